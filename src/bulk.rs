//! Bulk multi-file transfer pipeline
//!
//! An ordered batch of transfer tasks is executed as one pipelined
//! exchange: a sequential prepare phase with per-task failure isolation, a
//! single shared transfer phase that pulls source/destination pairs
//! through a cursor callback, an optional one-shot retry without UDT, and
//! a sequential close phase validating sizes and checksums per task.
//!
//! Per-task failures never abort siblings; a transfer-phase failure is
//! shared, recorded once on the batch, and marks every task that had not
//! reached a terminal state as failed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::config::TransferOptions;
use crate::endpoint::Url;
use crate::error::{compare_checksums, ChecksumSide, GridError, GridResult, Kind};
use crate::events::{EventSink, Side, Stage, TransferEvent};
use crate::logging::*;
use crate::namespace;
use crate::operation::Operation;
use crate::session::PairSource;

use crate::engine::GridEngine;

/// Per-task lifecycle within a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
	Pending,
	Started,
	Failed,
	Succeeded,
}

/// One source-to-destination pair within a batch
#[derive(Debug, Clone)]
pub struct TransferTask {
	pub source: Url,
	pub dest: Url,
	/// Digest declared by the caller for this file
	pub declared_checksum: Option<String>,
}

impl TransferTask {
	pub fn new(source: Url, dest: Url) -> Self {
		TransferTask { source, dest, declared_checksum: None }
	}

	pub fn with_checksum(source: Url, dest: Url, declared: impl Into<String>) -> Self {
		TransferTask { source, dest, declared_checksum: Some(declared.into()) }
	}
}

/// Final outcome of one task
///
/// Tasks swept up by a shared transfer-phase failure are `Failed` with
/// `error: None`; the shared cause lives once in [`BulkResult::shared_error`].
#[derive(Debug)]
pub struct TaskOutcome {
	pub source: Url,
	pub dest: Url,
	pub status: TaskStatus,
	pub source_checksum: Option<String>,
	pub error: Option<GridError>,
}

/// Aggregated batch result; always one outcome per submitted task
#[derive(Debug)]
pub struct BulkResult {
	pub outcomes: Vec<TaskOutcome>,
	/// Transfer-phase failure shared by the whole exchange
	pub shared_error: Option<GridError>,
}

impl BulkResult {
	pub fn failed(&self) -> usize {
		self.outcomes.iter().filter(|o| o.status == TaskStatus::Failed).count()
	}

	pub fn all_succeeded(&self) -> bool {
		self.failed() == 0 && self.shared_error.is_none()
	}
}

struct TaskState {
	task: TransferTask,
	status: TaskStatus,
	error: Option<GridError>,
	source_checksum: Option<String>,
	source_size: u64,
}

impl TaskState {
	fn new(task: TransferTask) -> Self {
		let source_checksum = task.declared_checksum.clone();
		TaskState { task, status: TaskStatus::Pending, error: None, source_checksum, source_size: 0 }
	}

	fn fail(&mut self, error: GridError) {
		debug!("task {} => {} failed: {}", self.task.source, self.task.dest, error);
		self.status = TaskStatus::Failed;
		self.error = Some(error);
	}

	fn is_failed(&self) -> bool {
		self.status == TaskStatus::Failed
	}
}

/// Shared batch state: ordered tasks plus the exchange cursor
struct BulkBatch {
	tasks: Vec<TaskState>,
	cursor: usize,
}

/// Pulls the next viable pair for the transport, skipping failed tasks
///
/// The cursor only moves forward; a task marked failed is never
/// revisited.
struct BatchCursor {
	batch: Arc<Mutex<BulkBatch>>,
	events: Arc<dyn EventSink>,
	transfer_id: Uuid,
}

impl PairSource for BatchCursor {
	fn next_pair(&self) -> Option<(Url, Url)> {
		let mut batch = self.batch.lock().unwrap_or_else(|e| e.into_inner());
		batch.cursor += 1;
		while batch.cursor < batch.tasks.len() && batch.tasks[batch.cursor].is_failed() {
			trace!("skipping pair {} marked as failed", batch.cursor);
			batch.cursor += 1;
		}
		if batch.cursor < batch.tasks.len() {
			let idx = batch.cursor;
			batch.tasks[idx].status = TaskStatus::Started;
			let source = batch.tasks[idx].task.source.clone();
			let dest = batch.tasks[idx].task.dest.clone();
			self.events.on_event(&TransferEvent::new(
				self.transfer_id,
				Side::Both,
				Stage::TransferEnter,
				format!(
					"Providing next pair: ({}) {} => ({}) {}",
					source.endpoint().host_and_port(),
					source,
					dest.endpoint().host_and_port(),
					dest
				),
			));
			Some((source, dest))
		} else {
			trace!("no more pairs to give");
			None
		}
	}
}

/// Execute one batch; always returns one outcome per task
pub(crate) fn run_pipeline(
	engine: &GridEngine,
	opts: &TransferOptions,
	tasks: Vec<TransferTask>,
) -> GridResult<BulkResult> {
	let transfer_id = Uuid::new_v4();
	let nbfiles = tasks.len();
	debug!("[{}] bulk copy of {} files", transfer_id, nbfiles);

	let mut states: Vec<TaskState> = tasks.into_iter().map(TaskState::new).collect();

	// Phase 1: prepare, sequential, failures isolated per task
	fire(engine, transfer_id, Side::Both, Stage::PrepareEnter, "");
	prepare_sources(engine, opts, transfer_id, &mut states);
	prepare_destinations(engine, opts, transfer_id, &mut states);
	fire(engine, transfer_id, Side::Both, Stage::PrepareExit, "");

	// Phases 2+3: one shared exchange, retried once without UDT
	let mut shared_error = None;
	if engine.is_canceled() {
		for state in states.iter_mut().filter(|s| !s.is_failed()) {
			state.fail(GridError::new(Kind::Canceled, "operation canceled"));
		}
	} else if states.iter().any(|s| !s.is_failed()) {
		let batch = Arc::new(Mutex::new(BulkBatch { tasks: states, cursor: 0 }));
		shared_error = run_exchange_with_retry(engine, opts, transfer_id, &batch);
		states = match Arc::try_unwrap(batch) {
			Ok(mutex) => mutex.into_inner().unwrap_or_else(|e| e.into_inner()).tasks,
			Err(batch) => {
				// The transport kept a cursor handle alive past
				// completion; fall back to draining through the lock
				let mut guard = batch.lock().unwrap_or_else(|e| e.into_inner());
				std::mem::replace(&mut *guard, BulkBatch { tasks: Vec::new(), cursor: 0 }).tasks
			}
		};
		if shared_error.is_some() {
			// Shared cause is recorded once on the batch, not duplicated
			// into every task
			for state in states.iter_mut() {
				if !matches!(state.status, TaskStatus::Failed) {
					state.status = TaskStatus::Failed;
				}
			}
		}
	}

	// Phase 4: close, sequential, failures isolated per task
	if shared_error.is_none() && !engine.is_canceled() {
		close_batch(engine, opts, transfer_id, &mut states);
	}

	let outcomes = states
		.into_iter()
		.map(|mut s| {
			if !matches!(s.status, TaskStatus::Failed) {
				s.status = TaskStatus::Succeeded;
			}
			TaskOutcome {
				source: s.task.source,
				dest: s.task.dest,
				status: s.status,
				source_checksum: s.source_checksum,
				error: s.error,
			}
		})
		.collect::<Vec<_>>();

	debug_assert_eq!(outcomes.len(), nbfiles);
	Ok(BulkResult { outcomes, shared_error })
}

/// Verify each source exists and is a regular file; record its size and,
/// when enabled, its checksum
fn prepare_sources(
	engine: &GridEngine,
	opts: &TransferOptions,
	transfer_id: Uuid,
	states: &mut [TaskState],
) {
	let config = engine.config();
	let deadline = config.operation_deadline();
	let mode = opts.effective_checksum_mode(config);
	let algorithm = opts.algorithm(config).to_string();

	for state in states.iter_mut() {
		if engine.is_canceled() {
			state.fail(GridError::new(Kind::Canceled, "operation canceled"));
			continue;
		}
		let source = state.task.source.clone();
		let info = match engine
			.with_session(source.endpoint(), |s| namespace::stat(s, source.path(), deadline))
		{
			Ok(info) => info,
			Err(e) => {
				state.fail(e);
				continue;
			}
		};
		if info.is_dir {
			state.fail(GridError::new(Kind::IsADirectory, format!("{} is a directory", source)));
			continue;
		}
		state.source_size = info.size;

		if mode.source {
			fire(engine, transfer_id, Side::Source, Stage::ChecksumEnter, source.to_string());
			let digest = engine.with_session(source.endpoint(), |s| {
				namespace::checksum(s, source.path(), &algorithm, deadline)
			});
			match digest {
				Ok(digest) => match &state.task.declared_checksum {
					Some(declared) if !compare_checksums(declared, &digest) => {
						state.fail(GridError::new(
							Kind::ChecksumMismatch(ChecksumSide::Source),
							format!(
								"user checksum and source checksum do not match: {} != {}",
								declared, digest
							),
						));
					}
					_ => state.source_checksum = Some(digest),
				},
				Err(e) => state.fail(e),
			}
			fire(engine, transfer_id, Side::Source, Stage::ChecksumExit, source.to_string());
		}
	}
}

/// Prepare each destination: overwrite handling and parent creation,
/// deduplicating parents shared between sibling tasks
fn prepare_destinations(
	engine: &GridEngine,
	opts: &TransferOptions,
	transfer_id: Uuid,
	states: &mut [TaskState],
) {
	let deadline = engine.config().operation_deadline();
	let mut ensured_parents: HashSet<String> = HashSet::new();

	for state in states.iter_mut() {
		if state.is_failed() {
			continue;
		}
		if engine.is_canceled() {
			state.fail(GridError::new(Kind::Canceled, "operation canceled"));
			continue;
		}
		let dest = state.task.dest.clone();
		let deleted = match prepare_one_destination(engine, opts, transfer_id, &dest, deadline) {
			Ok(deleted) => deleted,
			Err(e) => {
				state.fail(e);
				continue;
			}
		};
		if !deleted && opts.create_parent {
			let parent_key = match dest.parent() {
				Some(parent) => format!("{}{}", parent.endpoint(), parent.path()),
				None => continue,
			};
			if ensured_parents.contains(&parent_key) {
				trace!("parent already ensured for a sibling task, skipping");
				continue;
			}
			match engine
				.with_session(dest.endpoint(), |s| namespace::ensure_parent(s, &dest, deadline))
			{
				Ok(()) => {
					ensured_parents.insert(parent_key);
				}
				Err(e) => state.fail(e),
			}
		}
	}
}

/// Overwrite handling for one destination; returns whether a pre-existing
/// file was deleted
fn prepare_one_destination(
	engine: &GridEngine,
	opts: &TransferOptions,
	transfer_id: Uuid,
	dest: &Url,
	deadline: Option<Duration>,
) -> GridResult<bool> {
	if opts.strict_copy {
		return Ok(false);
	}
	let existed =
		engine.with_session(dest.endpoint(), |s| namespace::exists(s, dest.path(), deadline))?;
	if !existed {
		return Ok(false);
	}
	if !opts.replace_existing {
		return Err(GridError::new(
			Kind::AlreadyExists,
			format!("destination {} already exists", dest),
		));
	}
	engine.with_session(dest.endpoint(), |s| namespace::delete(s, dest.path(), deadline))?;
	fire(engine, transfer_id, Side::Destination, Stage::OverwriteDestination, format!("Deleted {}", dest));
	Ok(true)
}

/// Run the shared exchange, retrying exactly once without UDT when the
/// endpoint rejects the UDT driver; no other failure retries and the
/// retry never recurses
fn run_exchange_with_retry(
	engine: &GridEngine,
	opts: &TransferOptions,
	transfer_id: Uuid,
	batch: &Arc<Mutex<BulkBatch>>,
) -> Option<GridError> {
	let udt = engine.config().enable_udt;
	if udt {
		fire(engine, transfer_id, Side::Both, Stage::UdtEnable, "Trying UDT");
	}
	match run_exchange(engine, opts, transfer_id, batch, udt) {
		Err(e) if udt && e.is_udt_rejection() => {
			warn!("[{}] UDT bulk transfer failed, disabling and retrying: {}", transfer_id, e);
			fire(
				engine,
				transfer_id,
				Side::Both,
				Stage::UdtDisable,
				format!("UDT failed. Falling back to default mode: {}", e),
			);
			// Tasks the aborted attempt had started become eligible again
			{
				let mut guard = batch.lock().unwrap_or_else(|e| e.into_inner());
				guard.cursor = 0;
				for task in guard.tasks.iter_mut() {
					if task.status == TaskStatus::Started {
						task.status = TaskStatus::Pending;
					}
				}
			}
			run_exchange(engine, opts, transfer_id, batch, false).err()
		}
		Err(e) => Some(e),
		Ok(()) => None,
	}
}

/// One pipelined exchange over a single session
fn run_exchange(
	engine: &GridEngine,
	opts: &TransferOptions,
	transfer_id: Uuid,
	batch: &Arc<Mutex<BulkBatch>>,
	udt: bool,
) -> GridResult<()> {
	// First viable pair starts the exchange; the transport pulls the rest
	// through the cursor
	let first = {
		let mut guard = batch.lock().unwrap_or_else(|e| e.into_inner());
		let mut idx = 0;
		while idx < guard.tasks.len() && guard.tasks[idx].is_failed() {
			idx += 1;
		}
		if idx >= guard.tasks.len() {
			return Ok(());
		}
		guard.cursor = idx;
		guard.tasks[idx].status = TaskStatus::Started;
		(guard.tasks[idx].task.source.clone(), guard.tasks[idx].task.dest.clone())
	};

	fire(engine, transfer_id, Side::Both, Stage::TransferEnter, format!(
		"Providing first pair: ({}) {} => ({}) {}",
		first.0.endpoint().host_and_port(),
		first.0,
		first.1.endpoint().host_and_port(),
		first.1
	));

	let mut session = engine.acquire_session(first.0.endpoint())?;
	session.apply_options(opts, udt)?;

	let cursor = Arc::new(BatchCursor {
		batch: batch.clone(),
		events: engine.events_arc(),
		transfer_id,
	});

	let op = Operation::<()>::new();
	op.start(session.aborter());
	let result = session
		.transport_mut()
		.begin_bulk_transfer(first, cursor, op.completion())
		.and_then(|()| op.wait(opts.deadline()));

	engine.release_session(session, result.is_ok());

	// Every task the exchange actually started gets its exit event
	{
		let guard = batch.lock().unwrap_or_else(|e| e.into_inner());
		for task in guard.tasks.iter() {
			if task.status == TaskStatus::Started {
				fire(engine, transfer_id, Side::Both, Stage::TransferExit, format!(
					"Done {} => {}",
					task.task.source, task.task.dest
				));
			}
		}
	}

	result
}

/// Validate sizes and checksums per task after a successful exchange
fn close_batch(
	engine: &GridEngine,
	opts: &TransferOptions,
	transfer_id: Uuid,
	states: &mut [TaskState],
) {
	let config = engine.config();
	let deadline = config.operation_deadline();
	let mode = opts.effective_checksum_mode(config);
	let algorithm = opts.algorithm(config).to_string();

	fire(engine, transfer_id, Side::Both, Stage::CloseEnter, "");
	for state in states.iter_mut() {
		if state.is_failed() {
			continue;
		}
		if engine.is_canceled() {
			state.fail(GridError::new(Kind::Canceled, "operation canceled"));
			continue;
		}
		let dest = state.task.dest.clone();
		let info = match engine
			.with_session(dest.endpoint(), |s| namespace::stat(s, dest.path(), deadline))
		{
			Ok(info) => info,
			Err(e) => {
				state.fail(e);
				continue;
			}
		};
		if info.size != state.source_size {
			state.fail(GridError::new(
				Kind::SizeMismatch,
				format!(
					"source and destination file sizes do not match: {} != {}",
					state.source_size, info.size
				),
			));
			continue;
		}
		if mode.target {
			fire(engine, transfer_id, Side::Destination, Stage::ChecksumEnter, dest.to_string());
			let digest = engine.with_session(dest.endpoint(), |s| {
				namespace::checksum(s, dest.path(), &algorithm, deadline)
			});
			match digest {
				Ok(digest) => {
					if let Some(expected) = &state.source_checksum {
						if !compare_checksums(expected, &digest) {
							let side = if state.task.declared_checksum.as_deref()
								== Some(expected.as_str())
							{
								ChecksumSide::UserDeclared
							} else {
								ChecksumSide::Destination
							};
							state.fail(GridError::new(
								Kind::ChecksumMismatch(side),
								format!(
									"destination checksum does not match: {} != {}",
									expected, digest
								),
							));
						}
					}
				}
				Err(e) => state.fail(e),
			}
			fire(engine, transfer_id, Side::Destination, Stage::ChecksumExit, dest.to_string());
		}
	}
	fire(engine, transfer_id, Side::Both, Stage::CloseExit, "");
}

fn fire(
	engine: &GridEngine,
	transfer_id: Uuid,
	side: Side,
	stage: Stage,
	description: impl Into<String>,
) {
	engine.events().on_event(&TransferEvent::new(transfer_id, side, stage, description));
}

// vim: ts=4
