//! Shared in-memory stub endpoint for integration tests
//!
//! A [`StubGrid`] models a set of hosts with flat file trees. Its
//! connector builds transports that complete every operation
//! synchronously, so the blocking API can be exercised without any
//! network. Counters record connects, rebinds, closes and transfers for
//! assertions.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gridr::{
	AbortFn, Completion, Connector, Credential, DirEntry, Endpoint, EventSink, GridError,
	GridResult, Kind, MarkerFn, PairSource, PerfMarker, SessionSettings, SessionTransport, Stage,
	StatInfo, StreamPayload, TransferEvent, Url,
};

pub struct FileEntry {
	pub data: Vec<u8>,
	pub is_dir: bool,
}

/// Behavior knobs and the file trees of every stub host
#[derive(Default)]
pub struct GridState {
	/// host -> path -> entry
	pub files: HashMap<String, HashMap<String, FileEntry>>,
	/// "host path" -> number of MKD calls that created it
	pub mkdir_count: HashMap<String, usize>,
	/// "host path" -> permission bits set through chmod
	pub modes: HashMap<String, u32>,
	/// Reject transfers attempted with the UDT stack enabled
	pub reject_udt: bool,
	/// Fail every transfer with this message, after writing half the file
	pub fail_transfers_with: Option<String>,
	/// Never complete transfers; only the abort handle finishes them
	pub hang_transfers: bool,
	/// Drop the last byte when writing this destination path
	pub truncate_dest: Option<String>,
}

#[derive(Clone, Default)]
pub struct Counters {
	pub connects: Arc<AtomicUsize>,
	pub rebinds: Arc<AtomicUsize>,
	pub closes: Arc<AtomicUsize>,
	pub udt_attempts: Arc<AtomicUsize>,
	pub udt_connects: Arc<AtomicUsize>,
	pub attempts: Arc<AtomicUsize>,
	pub transfers: Arc<AtomicUsize>,
}

pub struct StubGrid {
	pub state: Arc<Mutex<GridState>>,
	pub counters: Counters,
}

impl StubGrid {
	pub fn new() -> Self {
		StubGrid { state: Arc::new(Mutex::new(GridState::default())), counters: Counters::default() }
	}

	/// Create a file and every ancestor directory on `host`
	pub fn add_file(&self, host: &str, path: &str, data: &[u8]) {
		let mut state = self.state.lock().unwrap();
		let tree = state.files.entry(host.to_string()).or_default();
		let mut dir = String::new();
		for part in path.split('/').filter(|p| !p.is_empty()) {
			let parent = format!("{}/{}", dir, part);
			if parent != path {
				tree.entry(parent.clone())
					.or_insert_with(|| FileEntry { data: Vec::new(), is_dir: true });
			}
			dir = parent;
		}
		tree.insert(path.to_string(), FileEntry { data: data.to_vec(), is_dir: false });
	}

	pub fn file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
		let state = self.state.lock().unwrap();
		state.files.get(host).and_then(|t| t.get(path)).filter(|e| !e.is_dir).map(|e| e.data.clone())
	}

	pub fn has_dir(&self, host: &str, path: &str) -> bool {
		let state = self.state.lock().unwrap();
		state.files.get(host).and_then(|t| t.get(path)).map(|e| e.is_dir).unwrap_or(false)
	}

	pub fn mkdir_count(&self, host: &str, path: &str) -> usize {
		let state = self.state.lock().unwrap();
		*state.mkdir_count.get(&format!("{} {}", host, path)).unwrap_or(&0)
	}

	pub fn connector(&self) -> Arc<StubConnector> {
		Arc::new(StubConnector { state: self.state.clone(), counters: self.counters.clone() })
	}

	pub fn connects(&self) -> usize {
		self.counters.connects.load(Ordering::SeqCst)
	}

	pub fn rebinds(&self) -> usize {
		self.counters.rebinds.load(Ordering::SeqCst)
	}

	pub fn closes(&self) -> usize {
		self.counters.closes.load(Ordering::SeqCst)
	}

	pub fn udt_attempts(&self) -> usize {
		self.counters.udt_attempts.load(Ordering::SeqCst)
	}

	pub fn udt_connects(&self) -> usize {
		self.counters.udt_connects.load(Ordering::SeqCst)
	}

	pub fn attempts(&self) -> usize {
		self.counters.attempts.load(Ordering::SeqCst)
	}

	pub fn transfers(&self) -> usize {
		self.counters.transfers.load(Ordering::SeqCst)
	}

	pub fn mode_of(&self, host: &str, path: &str) -> Option<u32> {
		let state = self.state.lock().unwrap();
		state.modes.get(&format!("{} {}", host, path)).copied()
	}
}

/// Digest the stub endpoints report for a file body
pub fn checksum_of(data: &[u8]) -> String {
	hex::encode(&blake3::hash(data).as_bytes()[..8])
}

pub struct StubConnector {
	state: Arc<Mutex<GridState>>,
	counters: Counters,
}

impl Connector for StubConnector {
	fn connect(
		&self,
		endpoint: &Endpoint,
		settings: &SessionSettings,
		_credential: &Credential,
	) -> GridResult<Box<dyn SessionTransport>> {
		// A connect asking for the UDT stack fails the handshake outright
		// when the endpoint rejects the driver
		if settings.enable_udt {
			self.counters.udt_connects.fetch_add(1, Ordering::SeqCst);
			if self.state.lock().unwrap().reject_udt {
				return Err(GridError::from_message(
					"500 Command failed : udt driver not whitelisted",
				));
			}
		}
		self.counters.connects.fetch_add(1, Ordering::SeqCst);
		Ok(Box::new(StubTransport {
			host: endpoint.host().to_string(),
			udt: settings.enable_udt,
			state: self.state.clone(),
			counters: self.counters.clone(),
			pending: Arc::new(Mutex::new(None)),
		}))
	}
}

pub struct StubTransport {
	host: String,
	udt: bool,
	state: Arc<Mutex<GridState>>,
	counters: Counters,
	pending: Arc<Mutex<Option<Completion<()>>>>,
}

fn not_found(path: &str) -> GridError {
	GridError::new(Kind::NotFound, format!("No such file or directory: {}", path))
}

impl StubTransport {
	fn copy_one(&self, state: &mut GridState, source: &Url, dest: &Url) -> GridResult<()> {
		let mut data = state
			.files
			.get(source.host())
			.and_then(|t| t.get(source.path()))
			.filter(|e| !e.is_dir)
			.map(|e| e.data.clone())
			.ok_or_else(|| not_found(source.path()))?;
		if state.truncate_dest.as_deref() == Some(dest.path()) {
			data.pop();
		}
		state
			.files
			.entry(dest.host().to_string())
			.or_default()
			.insert(dest.path().to_string(), FileEntry { data, is_dir: false });
		self.counters.transfers.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	/// Shared failure injection for single and bulk transfers; returns the
	/// forced error when one is configured
	fn transfer_fault(&self, state: &mut GridState, dest: &Url) -> Option<GridError> {
		self.counters.attempts.fetch_add(1, Ordering::SeqCst);
		if self.udt {
			self.counters.udt_attempts.fetch_add(1, Ordering::SeqCst);
			if state.reject_udt {
				return Some(GridError::from_message(
					"500 Command failed : udt driver not whitelisted",
				));
			}
		}
		if let Some(msg) = state.fail_transfers_with.clone() {
			// A failed transfer leaves a partial file behind
			state
				.files
				.entry(dest.host().to_string())
				.or_default()
				.insert(dest.path().to_string(), FileEntry { data: b"partial".to_vec(), is_dir: false });
			return Some(GridError::from_message(msg));
		}
		None
	}
}

impl SessionTransport for StubTransport {
	fn aborter(&self) -> AbortFn {
		let pending = self.pending.clone();
		Arc::new(move || {
			if let Some(done) = pending.lock().unwrap().take() {
				done.fail(GridError::new(Kind::Canceled, "aborted"));
			}
		})
	}

	fn reconfigure(&mut self, endpoint: &Endpoint, settings: &SessionSettings) -> GridResult<()> {
		if endpoint.host() != self.host {
			self.counters.rebinds.fetch_add(1, Ordering::SeqCst);
			self.host = endpoint.host().to_string();
		}
		self.udt = settings.enable_udt;
		Ok(())
	}

	fn begin_stat(&mut self, path: &str, done: Completion<StatInfo>) -> GridResult<()> {
		let state = self.state.lock().unwrap();
		if path == "/" {
			done.succeed(StatInfo { size: 0, is_dir: true, mode: 0o755, mtime: None });
			return Ok(());
		}
		match state.files.get(&self.host).and_then(|t| t.get(path)) {
			Some(entry) => done.succeed(StatInfo {
				size: entry.data.len() as u64,
				is_dir: entry.is_dir,
				mode: if entry.is_dir { 0o755 } else { 0o644 },
				mtime: None,
			}),
			None => done.fail(not_found(path)),
		}
		Ok(())
	}

	fn begin_mkdir(&mut self, path: &str, done: Completion<()>) -> GridResult<()> {
		let mut state = self.state.lock().unwrap();
		let tree = state.files.entry(self.host.clone()).or_default();
		if tree.contains_key(path) {
			done.fail(GridError::new(Kind::AlreadyExists, format!("{} exists", path)));
			return Ok(());
		}
		tree.insert(path.to_string(), FileEntry { data: Vec::new(), is_dir: true });
		*state.mkdir_count.entry(format!("{} {}", self.host, path)).or_insert(0) += 1;
		done.succeed(());
		Ok(())
	}

	fn begin_delete(&mut self, path: &str, done: Completion<()>) -> GridResult<()> {
		let mut state = self.state.lock().unwrap();
		match state.files.get_mut(&self.host).and_then(|t| t.remove(path)) {
			Some(_) => done.succeed(()),
			None => done.fail(not_found(path)),
		}
		Ok(())
	}

	fn begin_rename(&mut self, from: &str, to: &str, done: Completion<()>) -> GridResult<()> {
		let mut state = self.state.lock().unwrap();
		let tree = state.files.entry(self.host.clone()).or_default();
		match tree.remove(from) {
			Some(entry) => {
				tree.insert(to.to_string(), entry);
				done.succeed(());
			}
			None => done.fail(not_found(from)),
		}
		Ok(())
	}

	fn begin_chmod(&mut self, path: &str, mode: u32, done: Completion<()>) -> GridResult<()> {
		let mut state = self.state.lock().unwrap();
		if state.files.get(&self.host).map(|t| t.contains_key(path)).unwrap_or(false) {
			state.modes.insert(format!("{} {}", self.host, path), mode);
			done.succeed(());
		} else {
			done.fail(not_found(path));
		}
		Ok(())
	}

	fn begin_list(&mut self, path: &str, done: Completion<Vec<DirEntry>>) -> GridResult<()> {
		let state = self.state.lock().unwrap();
		let dir = path.trim_end_matches('/');
		let tree = match state.files.get(&self.host) {
			Some(tree) => tree,
			None => {
				done.fail(not_found(path));
				return Ok(());
			}
		};
		if dir.is_empty() || tree.get(dir).map(|e| e.is_dir).unwrap_or(false) {
			let mut entries: Vec<DirEntry> = tree
				.iter()
				.filter_map(|(key, entry)| {
					let (parent, name) = key.rsplit_once('/')?;
					let parent = if parent.is_empty() { "" } else { parent };
					if parent != dir || name.is_empty() {
						return None;
					}
					Some(DirEntry {
						name: name.to_string(),
						info: StatInfo {
							size: entry.data.len() as u64,
							is_dir: entry.is_dir,
							mode: if entry.is_dir { 0o755 } else { 0o644 },
							mtime: None,
						},
					})
				})
				.collect();
			entries.sort_by(|a, b| a.name.cmp(&b.name));
			done.succeed(entries);
		} else {
			done.fail(not_found(path));
		}
		Ok(())
	}

	fn begin_checksum(
		&mut self,
		path: &str,
		_algorithm: &str,
		done: Completion<String>,
	) -> GridResult<()> {
		let state = self.state.lock().unwrap();
		match state.files.get(&self.host).and_then(|t| t.get(path)) {
			Some(entry) if !entry.is_dir => done.succeed(checksum_of(&entry.data)),
			Some(_) => done.fail(GridError::new(Kind::IsADirectory, format!("{} is a directory", path))),
			None => done.fail(not_found(path)),
		}
		Ok(())
	}

	fn begin_transfer(
		&mut self,
		source: &Url,
		dest: &Url,
		markers: Option<MarkerFn>,
		done: Completion<()>,
	) -> GridResult<()> {
		let mut state = self.state.lock().unwrap();
		if state.hang_transfers {
			*self.pending.lock().unwrap() = Some(done);
			return Ok(());
		}
		if let Some(e) = self.transfer_fault(&mut state, dest) {
			done.fail(e);
			return Ok(());
		}
		let result = self.copy_one(&mut state, source, dest);
		if result.is_ok() {
			if let Some(markers) = &markers {
				let bytes = state
					.files
					.get(dest.host())
					.and_then(|t| t.get(dest.path()))
					.map(|e| e.data.len() as u64)
					.unwrap_or(0);
				markers(PerfMarker {
					bytes_transferred: bytes,
					instant_rate: bytes as f64,
					average_rate: bytes as f64,
					elapsed: Duration::from_millis(1),
					source: source.to_string(),
					dest: dest.to_string(),
				});
			}
		}
		done.finish(result);
		Ok(())
	}

	fn begin_bulk_transfer(
		&mut self,
		first: (Url, Url),
		pairs: Arc<dyn PairSource>,
		done: Completion<()>,
	) -> GridResult<()> {
		let mut state = self.state.lock().unwrap();
		if let Some(e) = self.transfer_fault(&mut state, &first.1) {
			done.fail(e);
			return Ok(());
		}
		let mut pair = Some(first);
		while let Some((source, dest)) = pair {
			if let Err(e) = self.copy_one(&mut state, &source, &dest) {
				done.fail(e);
				return Ok(());
			}
			pair = pairs.next_pair();
		}
		done.succeed(());
		Ok(())
	}

	fn begin_read(
		&mut self,
		path: &str,
		offset: u64,
		length: usize,
		done: Completion<StreamPayload>,
	) -> GridResult<()> {
		let state = self.state.lock().unwrap();
		let data = match state.files.get(&self.host).and_then(|t| t.get(path)) {
			Some(entry) if !entry.is_dir => &entry.data,
			_ => {
				done.fail(not_found(path));
				return Ok(());
			}
		};
		let offset = offset as usize;
		let end = (offset + length).min(data.len());
		let chunk = if offset < data.len() { data[offset..end].to_vec() } else { Vec::new() };
		// The server only reveals EOF by delivering less than was asked for
		let eof = if length == 0 {
			offset >= data.len()
		} else {
			end >= data.len() && chunk.len() < length
		};
		done.succeed(StreamPayload { data: chunk, eof });
		Ok(())
	}

	fn begin_write(
		&mut self,
		path: &str,
		offset: u64,
		data: Vec<u8>,
		eof: bool,
		done: Completion<StreamPayload>,
	) -> GridResult<()> {
		let mut state = self.state.lock().unwrap();
		let tree = state.files.entry(self.host.clone()).or_default();
		let entry =
			tree.entry(path.to_string()).or_insert_with(|| FileEntry { data: Vec::new(), is_dir: false });
		let offset = offset as usize;
		if entry.data.len() < offset + data.len() {
			entry.data.resize(offset + data.len(), 0);
		}
		entry.data[offset..offset + data.len()].copy_from_slice(&data);
		done.succeed(StreamPayload { data, eof });
		Ok(())
	}

	fn close(&mut self) {
		self.counters.closes.fetch_add(1, Ordering::SeqCst);
	}
}

/// Event sink that records every lifecycle stage it sees
pub struct CollectSink {
	pub events: Mutex<Vec<TransferEvent>>,
}

impl CollectSink {
	pub fn new() -> Arc<Self> {
		Arc::new(CollectSink { events: Mutex::new(Vec::new()) })
	}

	pub fn stages(&self) -> Vec<Stage> {
		self.events.lock().unwrap().iter().map(|e| e.stage).collect()
	}
}

impl EventSink for CollectSink {
	fn on_event(&self, event: &TransferEvent) {
		self.events.lock().unwrap().push(event.clone());
	}
}

// vim: ts=4
