//! Default wire transport
//!
//! One [`FtpTransport`] owns the authenticated control connection of one
//! session. Every `begin_*` call spawns a task on the shared runtime that
//! drives the command exchange and finalizes the completion handle; the
//! abort handle wakes those tasks out of whatever they are awaiting, and
//! the aborted task still delivers its completion.
//!
//! Third-party transfers pair this session's control connection with a
//! second one opened to the destination endpoint: passive mode on the
//! destination, PORT with the returned address on the source, then
//! STOR/RETR on the two channels until both report completion.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::endpoint::{Endpoint, Url};
use crate::error::{GridError, GridResult, Kind};
use crate::global;
use crate::logging::*;
use crate::operation::{AbortFn, Completion, StreamPayload};
use crate::progress::{PerfMarker, RateMeter};
use crate::protocol::wire::{self, Reply};
use crate::session::{
	Connector, Credential, DirEntry, MarkerFn, PairSource, SessionSettings, SessionTransport,
	StatInfo,
};

/// Builds [`FtpTransport`] instances; the default engine connector
pub struct FtpConnector;

impl FtpConnector {
	pub fn new() -> Self {
		FtpConnector
	}
}

impl Default for FtpConnector {
	fn default() -> Self {
		Self::new()
	}
}

impl Connector for FtpConnector {
	fn connect(
		&self,
		endpoint: &Endpoint,
		settings: &SessionSettings,
		credential: &Credential,
	) -> GridResult<Box<dyn SessionTransport>> {
		let handle = global::runtime_handle()?;
		let control =
			handle.block_on(ControlChannel::open(endpoint, settings, credential))?;
		Ok(Box::new(FtpTransport {
			endpoint: endpoint.clone(),
			settings: settings.clone(),
			credential: credential.clone(),
			control: Arc::new(AsyncMutex::new(control)),
			abort: Arc::new(AbortState::new()),
		}))
	}
}

// === Abort plumbing ===

struct AbortState {
	requested: AtomicBool,
	notify: Notify,
}

impl AbortState {
	fn new() -> Self {
		AbortState { requested: AtomicBool::new(false), notify: Notify::new() }
	}

	fn trigger(&self) {
		self.requested.store(true, Ordering::SeqCst);
		self.notify.notify_waiters();
	}

	fn reset(&self) {
		self.requested.store(false, Ordering::SeqCst);
	}

	async fn wait(&self) {
		loop {
			// Register before checking the flag so a trigger between the
			// check and the await cannot be missed
			let notified = self.notify.notified();
			if self.requested.load(Ordering::SeqCst) {
				return;
			}
			notified.await;
		}
	}
}

fn aborted() -> GridError {
	GridError::new(Kind::Canceled, "operation aborted")
}

/// Race a command exchange against the abort handle
async fn abortable<T>(
	abort: &AbortState,
	fut: impl Future<Output = GridResult<T>>,
) -> GridResult<T> {
	tokio::select! {
		_ = abort.wait() => Err(aborted()),
		result = fut => result,
	}
}

// === Control channel ===

struct ControlChannel {
	endpoint: Endpoint,
	reader: BufReader<OwnedReadHalf>,
	writer: OwnedWriteHalf,
}

impl ControlChannel {
	/// Connect, authenticate and apply session settings
	async fn open(
		endpoint: &Endpoint,
		settings: &SessionSettings,
		credential: &Credential,
	) -> GridResult<Self> {
		trace!("opening control connection to {}", endpoint);
		let stream = TcpStream::connect((strip_brackets(endpoint.host()), endpoint.port()))
			.await
			.map_err(|e| GridError::new(Kind::ConnectFailure, format!("{}: {}", endpoint, e)))?;
		if let Err(e) = stream.set_nodelay(true) {
			debug!("cannot disable Nagle on {}: {}", endpoint, e);
		}
		let (reader, writer) = stream.into_split();
		let mut ctl =
			ControlChannel { endpoint: endpoint.clone(), reader: BufReader::new(reader), writer };
		let greeting = ctl.read().await?;
		if !greeting.is_success() {
			return Err(greeting.into_error());
		}
		ctl.login(credential).await?;
		ctl.apply(settings).await?;
		Ok(ctl)
	}

	async fn login(&mut self, credential: &Credential) -> GridResult<()> {
		match credential {
			// A delegated proxy authenticates the channel itself; there is
			// no USER/PASS exchange on top of it
			Credential::Proxy(_) => Ok(()),
			Credential::Anonymous => self.login_userpass("anonymous", "anonymous@").await,
			Credential::UserPass { user, pass } => self.login_userpass(user, pass).await,
		}
	}

	async fn login_userpass(&mut self, user: &str, pass: &str) -> GridResult<()> {
		let reply = self.command(&format!("USER {}", user)).await?;
		if reply.is_success() {
			return Ok(());
		}
		if !reply.is_intermediate() {
			return Err(reply.into_error());
		}
		let reply = self.command(&format!("PASS {}", pass)).await?;
		if reply.is_success() {
			Ok(())
		} else {
			Err(reply.into_error())
		}
	}

	/// Apply negotiated settings to the live connection
	///
	/// Tuning commands are best-effort; only the network stack selection
	/// must surface its failure, the UDT fallback depends on seeing it.
	async fn apply(&mut self, settings: &SessionSettings) -> GridResult<()> {
		self.expect("TYPE I").await?;
		if settings.tcp_buffer_size > 0 {
			let _ = self.command(&format!("SBUF {}", settings.tcp_buffer_size)).await;
		}
		if settings.nb_streams > 1 {
			let n = settings.nb_streams;
			let _ = self.command("MODE E").await;
			let _ = self.command(&format!("OPTS RETR Parallelism={},{},{};", n, n, n)).await;
		}
		if !settings.dcau {
			let _ = self.command("SITE DCAU N").await;
		}
		if settings.enable_udt {
			let reply = self.command("SITE SETNETSTACK udt").await?;
			if !reply.is_success() {
				return Err(reply.into_error());
			}
		} else {
			let _ = self.command("SITE SETNETSTACK default").await;
		}
		Ok(())
	}

	async fn send(&mut self, cmd: &str) -> GridResult<()> {
		trace!("[{}] >>> {}", self.endpoint, cmd);
		self.writer.write_all(cmd.as_bytes()).await?;
		self.writer.write_all(b"\r\n").await?;
		Ok(())
	}

	async fn read(&mut self) -> GridResult<Reply> {
		let reply = wire::read_reply(&mut self.reader).await?;
		trace!("[{}] <<< {} {}", self.endpoint, reply.code, reply.text);
		Ok(reply)
	}

	/// Send one command and return its final (non-preliminary) reply
	async fn command(&mut self, cmd: &str) -> GridResult<Reply> {
		self.send(cmd).await?;
		loop {
			let reply = self.read().await?;
			if !reply.is_preliminary() {
				return Ok(reply);
			}
		}
	}

	/// Like [`ControlChannel::command`], failing on anything but 2xx/3xx
	async fn expect(&mut self, cmd: &str) -> GridResult<Reply> {
		let reply = self.command(cmd).await?;
		if reply.is_success() || reply.is_intermediate() {
			Ok(reply)
		} else {
			Err(reply.into_error())
		}
	}

	/// Drain replies of an in-flight data command until completion
	async fn wait_complete(&mut self) -> GridResult<()> {
		loop {
			let reply = self.read().await?;
			if reply.is_preliminary() {
				continue;
			}
			if reply.is_success() {
				return Ok(());
			}
			return Err(reply.into_error());
		}
	}
}

/// Passive-mode data target on this channel's endpoint
async fn passive(ctl: &mut ControlChannel, ipv6: bool) -> GridResult<(String, u16)> {
	if ipv6 {
		let reply = ctl.expect("EPSV").await?;
		let port = wire::parse_epsv(&reply.text)?;
		Ok((strip_brackets(ctl.endpoint.host()).to_string(), port))
	} else {
		let reply = ctl.expect("PASV").await?;
		let addr = wire::parse_pasv(&reply.text)?;
		Ok((addr.ip().to_string(), addr.port()))
	}
}

fn strip_brackets(host: &str) -> &str {
	host.trim_start_matches('[').trim_end_matches(']')
}

// === The transport ===

/// One session's wire transport: an authenticated control connection plus
/// the abort handle for the call in flight
pub struct FtpTransport {
	endpoint: Endpoint,
	settings: SessionSettings,
	credential: Credential,
	control: Arc<AsyncMutex<ControlChannel>>,
	abort: Arc<AbortState>,
}

impl FtpTransport {
	/// Spawn one command exchange; the task owns the completion
	fn spawn<T, F>(&self, done: Completion<T>, fut: F) -> GridResult<()>
	where
		T: Send + 'static,
		F: Future<Output = GridResult<T>> + Send + 'static,
	{
		self.abort.reset();
		let abort = self.abort.clone();
		let handle = global::runtime_handle()?;
		handle.spawn(async move {
			let result = abortable(&abort, fut).await;
			done.finish(result);
		});
		Ok(())
	}
}

impl SessionTransport for FtpTransport {
	fn aborter(&self) -> AbortFn {
		let abort = self.abort.clone();
		Arc::new(move || abort.trigger())
	}

	fn reconfigure(&mut self, endpoint: &Endpoint, settings: &SessionSettings) -> GridResult<()> {
		let handle = global::runtime_handle()?;
		let control = self.control.clone();
		if endpoint != &self.endpoint {
			// Different endpoint: the old connection is useless, replace it
			let fresh = handle.block_on(ControlChannel::open(
				endpoint,
				settings,
				&self.credential,
			))?;
			handle.block_on(async {
				*control.lock().await = fresh;
			});
		} else {
			handle.block_on(async { control.lock().await.apply(settings).await })?;
		}
		self.endpoint = endpoint.clone();
		self.settings = settings.clone();
		Ok(())
	}

	fn begin_stat(&mut self, path: &str, done: Completion<StatInfo>) -> GridResult<()> {
		let control = self.control.clone();
		let path = path.to_string();
		self.spawn(done, async move {
			let mut ctl = control.lock().await;
			let reply = ctl.expect(&format!("MLST {}", path)).await?;
			wire::parse_mlst(&reply.text)
		})
	}

	fn begin_mkdir(&mut self, path: &str, done: Completion<()>) -> GridResult<()> {
		let control = self.control.clone();
		let path = path.to_string();
		self.spawn(done, async move {
			let mut ctl = control.lock().await;
			ctl.expect(&format!("MKD {}", path)).await?;
			Ok(())
		})
	}

	fn begin_delete(&mut self, path: &str, done: Completion<()>) -> GridResult<()> {
		let control = self.control.clone();
		let path = path.to_string();
		self.spawn(done, async move {
			let mut ctl = control.lock().await;
			match ctl.expect(&format!("DELE {}", path)).await {
				Ok(_) => Ok(()),
				Err(e) if e.kind() == Kind::IsADirectory => {
					ctl.expect(&format!("RMD {}", path)).await?;
					Ok(())
				}
				Err(e) => Err(e),
			}
		})
	}

	fn begin_rename(&mut self, from: &str, to: &str, done: Completion<()>) -> GridResult<()> {
		let control = self.control.clone();
		let (from, to) = (from.to_string(), to.to_string());
		self.spawn(done, async move {
			let mut ctl = control.lock().await;
			let reply = ctl.expect(&format!("RNFR {}", from)).await?;
			if !reply.is_intermediate() {
				return Err(reply.into_error());
			}
			ctl.expect(&format!("RNTO {}", to)).await?;
			Ok(())
		})
	}

	fn begin_chmod(&mut self, path: &str, mode: u32, done: Completion<()>) -> GridResult<()> {
		let control = self.control.clone();
		let cmd = format!("SITE CHMOD {:o} {}", mode, path);
		self.spawn(done, async move {
			let mut ctl = control.lock().await;
			ctl.expect(&cmd).await?;
			Ok(())
		})
	}

	fn begin_list(&mut self, path: &str, done: Completion<Vec<DirEntry>>) -> GridResult<()> {
		let control = self.control.clone();
		let ipv6 = self.settings.ipv6;
		let path = path.to_string();
		self.spawn(done, async move {
			let mut ctl = control.lock().await;
			let target = passive(&mut ctl, ipv6).await?;
			ctl.send(&format!("MLSD {}", path)).await?;
			let mut data = TcpStream::connect(target)
				.await
				.map_err(|e| GridError::new(Kind::ConnectFailure, e.to_string()))?;
			let mut raw = Vec::new();
			data.read_to_end(&mut raw).await?;
			drop(data);
			ctl.wait_complete().await?;
			Ok(wire::parse_mlsd(&String::from_utf8_lossy(&raw)))
		})
	}

	fn begin_checksum(
		&mut self,
		path: &str,
		algorithm: &str,
		done: Completion<String>,
	) -> GridResult<()> {
		let control = self.control.clone();
		let cmd = format!("CKSM {} 0 -1 {}", algorithm, path);
		self.spawn(done, async move {
			let mut ctl = control.lock().await;
			let reply = ctl.expect(&cmd).await?;
			match reply.text.split_whitespace().last() {
				Some(digest) => Ok(digest.to_string()),
				None => Err(GridError::new(Kind::Protocol, "empty checksum reply")),
			}
		})
	}

	fn begin_transfer(
		&mut self,
		source: &Url,
		dest: &Url,
		markers: Option<MarkerFn>,
		done: Completion<()>,
	) -> GridResult<()> {
		let control = self.control.clone();
		let settings = self.settings.clone();
		let credential = self.credential.clone();
		let (source, dest) = (source.clone(), dest.clone());
		// Delayed passive only exists in the version 2 GET/PUT exchange
		let getput = settings.gridftp_v2 && settings.delayed_passive;
		self.spawn(done, async move {
			let mut src = control.lock().await;
			let mut dst =
				ControlChannel::open(dest.endpoint(), &settings, &credential).await?;
			let result =
				third_party_pair(&mut src, &mut dst, &source, &dest, getput, markers.as_ref())
					.await;
			let _ = dst.send("QUIT").await;
			result
		})
	}

	fn begin_bulk_transfer(
		&mut self,
		first: (Url, Url),
		pairs: Arc<dyn PairSource>,
		done: Completion<()>,
	) -> GridResult<()> {
		let control = self.control.clone();
		let settings = self.settings.clone();
		let credential = self.credential.clone();
		let getput = self.settings.gridftp_v2 && self.settings.delayed_passive;
		self.spawn(done, async move {
			let mut src = control.lock().await;
			let mut dst =
				ControlChannel::open(first.1.endpoint(), &settings, &credential).await?;
			let mut pair = Some(first);
			while let Some((source, dest)) = pair {
				// A pair on a different destination host gets a fresh
				// second channel
				if dest.endpoint() != &dst.endpoint {
					let _ = dst.send("QUIT").await;
					dst = ControlChannel::open(dest.endpoint(), &settings, &credential).await?;
				}
				third_party_pair(&mut src, &mut dst, &source, &dest, getput, None).await?;
				pair = pairs.next_pair();
			}
			let _ = dst.send("QUIT").await;
			Ok(())
		})
	}

	fn begin_read(
		&mut self,
		path: &str,
		offset: u64,
		length: usize,
		done: Completion<StreamPayload>,
	) -> GridResult<()> {
		let control = self.control.clone();
		let ipv6 = self.settings.ipv6;
		let path = path.to_string();
		self.spawn(done, async move {
			let mut ctl = control.lock().await;
			let target = passive(&mut ctl, ipv6).await?;
			if offset > 0 {
				ctl.expect(&format!("REST {}", offset)).await?;
			}
			ctl.send(&format!("RETR {}", path)).await?;
			let mut data = TcpStream::connect(target)
				.await
				.map_err(|e| GridError::new(Kind::ConnectFailure, e.to_string()))?;

			let mut buf = vec![0u8; length.max(1)];
			let mut filled = 0;
			let mut eof = false;
			loop {
				let n = data.read(&mut buf[filled..]).await?;
				if n == 0 {
					eof = true;
					break;
				}
				filled += n;
				if filled >= length {
					break;
				}
			}
			buf.truncate(filled.min(length));
			drop(data);
			ctl.wait_complete().await?;
			Ok(StreamPayload { data: buf, eof })
		})
	}

	fn begin_write(
		&mut self,
		path: &str,
		offset: u64,
		data: Vec<u8>,
		eof: bool,
		done: Completion<StreamPayload>,
	) -> GridResult<()> {
		// Each chunk is one complete STOR at an offset, so a zero-length
		// EOF commit has nothing left to do on the wire
		if data.is_empty() {
			done.succeed(StreamPayload { data, eof: true });
			return Ok(());
		}
		let control = self.control.clone();
		let ipv6 = self.settings.ipv6;
		let path = path.to_string();
		self.spawn(done, async move {
			let mut ctl = control.lock().await;
			let target = passive(&mut ctl, ipv6).await?;
			if offset > 0 {
				ctl.expect(&format!("REST {}", offset)).await?;
			}
			ctl.send(&format!("STOR {}", path)).await?;
			let mut channel = TcpStream::connect(target)
				.await
				.map_err(|e| GridError::new(Kind::ConnectFailure, e.to_string()))?;
			channel.write_all(&data).await?;
			channel.shutdown().await?;
			drop(channel);
			ctl.wait_complete().await?;
			Ok(StreamPayload { data, eof })
		})
	}

	fn close(&mut self) {
		if let Ok(handle) = global::runtime_handle() {
			let control = self.control.clone();
			handle.spawn(async move {
				let _ = control.lock().await.send("QUIT").await;
			});
		}
	}
}

/// One source-to-destination file over a prepared channel pair
///
/// With protocol version 2 the destination gets a `PUT ...;pasv` and
/// announces its data port in a 127 reply, possibly only once it is ready
/// to receive (delayed passive); the source then gets the matching `GET`.
/// Otherwise classic PASV on the destination, PORT on the source, then
/// STOR/RETR. Either way the source channel is drained first because it
/// carries the periodic performance markers.
async fn third_party_pair(
	src: &mut ControlChannel,
	dst: &mut ControlChannel,
	source: &Url,
	dest: &Url,
	getput: bool,
	markers: Option<&MarkerFn>,
) -> GridResult<()> {
	if getput {
		dst.send(&format!("PUT path={};mode=e;pasv", dest.path())).await?;
		let addr = loop {
			let reply = dst.read().await?;
			if reply.code == 127 {
				break wire::parse_pasv(&reply.text)?;
			}
			if !reply.is_preliminary() {
				return Err(reply.into_error());
			}
		};
		src.send(&format!(
			"GET path={};mode=e;port={}",
			source.path(),
			wire::format_port(&addr)?
		))
		.await?;
	} else {
		let reply = dst.expect("PASV").await?;
		let addr: SocketAddr = wire::parse_pasv(&reply.text)?;
		src.expect(&format!("PORT {}", wire::format_port(&addr)?)).await?;

		dst.send(&format!("STOR {}", dest.path())).await?;
		src.send(&format!("RETR {}", source.path())).await?;
	}

	let mut meter = RateMeter::new();
	loop {
		let reply = src.read().await?;
		if reply.is_preliminary() {
			if let Some(total) = wire::parse_perf_bytes(&reply.text) {
				let (instant_rate, average_rate, elapsed) = meter.sample(total);
				if let Some(markers) = markers {
					markers(PerfMarker {
						bytes_transferred: total,
						instant_rate,
						average_rate,
						elapsed,
						source: source.to_string(),
						dest: dest.to_string(),
					});
				}
			}
			continue;
		}
		if reply.is_success() {
			break;
		}
		return Err(reply.into_error());
	}
	dst.wait_complete().await
}

// vim: ts=4
