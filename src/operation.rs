//! Asynchronous operation state machine
//!
//! An [`Operation`] tracks one in-flight protocol call from `Pending` to a
//! terminal state. Network completion arrives on a runtime worker thread
//! through a [`Completion`] handle; callers block in [`Operation::wait`] on
//! a condition variable. The completion handle holds shared ownership of
//! the operation core, so a waiter can never free state that a late
//! callback still writes into.
//!
//! Cancellation and timeout only *request* an abort; the terminal state is
//! written exactly once, always by the completion path. On deadline expiry
//! `wait` sends one abort and then waits again, unbounded, for the abort's
//! own completion before reporting `TimedOut`. Skipping that second wait
//! would free the operation while the transport can still complete it.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{GridError, GridResult, Kind};
use crate::logging::*;
use crate::session::Session;

/// Abort request handle registered by the transport for the active call
pub type AbortFn = Arc<dyn Fn() + Send + Sync>;

/// Operation lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
	Pending,
	Running,
	DoneOk,
	DoneError,
	Canceled,
	TimedOut,
}

impl OpStatus {
	pub fn is_terminal(&self) -> bool {
		!matches!(self, OpStatus::Pending | OpStatus::Running)
	}
}

struct OpState<T> {
	status: OpStatus,
	payload: Option<T>,
	error: Option<GridError>,
	aborter: Option<AbortFn>,
	abort_requested: bool,
	timed_out: bool,
	cancel_reason: Option<String>,
}

struct OpCore<T> {
	state: Mutex<OpState<T>>,
	cond: Condvar,
}

/// One asynchronous protocol call tracked to a terminal state
///
/// Clones share the same underlying state; a clone is how a watchdog or
/// another thread gets a handle it can call [`Operation::cancel`] on.
pub struct Operation<T = ()> {
	core: Arc<OpCore<T>>,
}

impl<T> Clone for Operation<T> {
	fn clone(&self) -> Self {
		Operation { core: self.core.clone() }
	}
}

/// Completion handle handed to the transport
///
/// Cloneable so that multiple failure paths (control channel, data channel,
/// abort path) can race to complete; only the first terminal transition
/// takes effect, later ones are ignored.
pub struct Completion<T = ()> {
	core: Arc<OpCore<T>>,
}

impl<T> Clone for Completion<T> {
	fn clone(&self) -> Self {
		Completion { core: self.core.clone() }
	}
}

impl<T> Operation<T> {
	pub fn new() -> Self {
		Operation {
			core: Arc::new(OpCore {
				state: Mutex::new(OpState {
					status: OpStatus::Pending,
					payload: None,
					error: None,
					aborter: None,
					abort_requested: false,
					timed_out: false,
					cancel_reason: None,
				}),
				cond: Condvar::new(),
			}),
		}
	}

	/// Completion handle for the transport
	pub fn completion(&self) -> Completion<T> {
		Completion { core: self.core.clone() }
	}

	/// Mark the operation running and register its abort handle
	pub fn start(&self, aborter: AbortFn) {
		let mut st = self.lock();
		st.status = OpStatus::Running;
		st.aborter = Some(aborter);
	}

	pub fn status(&self) -> OpStatus {
		self.lock().status
	}

	/// Block until the terminal state, with an optional deadline
	///
	/// On deadline expiry: request one abort, then wait with no further
	/// deadline for the abort's own completion, then report `TimedOut`.
	pub fn wait(&self, timeout: Option<Duration>) -> GridResult<T> {
		let deadline = timeout.map(|t| Instant::now() + t);
		let mut st = self.lock();
		while !st.status.is_terminal() {
			match deadline {
				Some(d) => {
					let now = Instant::now();
					if now >= d {
						trace!("operation deadline elapsed, requesting abort");
						st.timed_out = true;
						let aborter = if st.abort_requested {
							None
						} else {
							st.abort_requested = true;
							st.aborter.clone()
						};
						drop(st);
						if let Some(abort) = aborter {
							abort();
						}
						st = self.lock();
						while !st.status.is_terminal() {
							st = self.core.cond.wait(st).unwrap_or_else(|e| e.into_inner());
						}
						break;
					}
					let (guard, _) = self
						.core
						.cond
						.wait_timeout(st, d - now)
						.unwrap_or_else(|e| e.into_inner());
					st = guard;
				}
				None => {
					st = self.core.cond.wait(st).unwrap_or_else(|e| e.into_inner());
				}
			}
		}
		match st.status {
			OpStatus::DoneOk => match st.payload.take() {
				Some(payload) => Ok(payload),
				None => Err(GridError::new(Kind::Protocol, "operation completed without a result")),
			},
			OpStatus::TimedOut => {
				Err(GridError::new(Kind::TimedOut, "operation timed out"))
			}
			OpStatus::Canceled => Err(st
				.error
				.clone()
				.unwrap_or_else(|| GridError::new(Kind::Canceled, "operation canceled"))),
			_ => Err(st
				.error
				.clone()
				.unwrap_or_else(|| GridError::new(Kind::Protocol, "operation failed"))),
		}
	}

	/// Request cancellation from any thread
	///
	/// Only requests the abort; the transport's completion callback still
	/// fires and finalizes the state as `Canceled`.
	pub fn cancel(&self, reason: &str) {
		let aborter = {
			let mut st = self.lock();
			if st.status.is_terminal() {
				return;
			}
			st.cancel_reason = Some(reason.to_string());
			if st.abort_requested {
				None
			} else {
				st.abort_requested = true;
				st.aborter.clone()
			}
		};
		if let Some(abort) = aborter {
			debug!("canceling operation: {}", reason);
			abort();
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, OpState<T>> {
		self.core.state.lock().unwrap_or_else(|e| e.into_inner())
	}
}

impl<T> Default for Operation<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Completion<T> {
	/// Finalize with a successful result
	pub fn succeed(&self, payload: T) {
		self.finish(Ok(payload));
	}

	/// Finalize with an error
	pub fn fail(&self, error: GridError) {
		self.finish(Err(error));
	}

	/// Write the terminal state exactly once and wake the waiter
	///
	/// A pending timeout or cancel request overrides the transported
	/// result: the waiter asked for the abort and must observe it.
	pub fn finish(&self, result: Result<T, GridError>) {
		let mut st = self.core.state.lock().unwrap_or_else(|e| e.into_inner());
		if st.status.is_terminal() {
			trace!("ignoring completion after terminal state {:?}", st.status);
			return;
		}
		if st.timed_out {
			st.status = OpStatus::TimedOut;
			st.error = Some(GridError::new(Kind::TimedOut, "operation timed out"));
		} else if let Some(reason) = st.cancel_reason.take() {
			st.status = OpStatus::Canceled;
			st.error = Some(GridError::new(Kind::Canceled, reason));
		} else {
			match result {
				Ok(payload) => {
					st.status = OpStatus::DoneOk;
					st.payload = Some(payload);
				}
				Err(e) if e.kind() == Kind::Canceled => {
					st.status = OpStatus::Canceled;
					st.error = Some(e);
				}
				Err(e) => {
					st.status = OpStatus::DoneError;
					st.error = Some(e);
				}
			}
		}
		self.core.cond.notify_all();
	}
}

/// One chunk delivered by a stream completion
pub struct StreamPayload {
	pub data: Vec<u8>,
	pub eof: bool,
}

/// Operation specialization for chunked data transfer
///
/// Tracks the running offset and EOF. A read whose requested length
/// exactly matches the remaining data can receive a *second* completion
/// bearing only EOF; [`StreamOperation::drain_eof`] issues the zero-length
/// follow-up read that consumes it.
pub struct StreamOperation {
	path: String,
	offset: u64,
	eof: bool,
	expect_eof: bool,
}

impl StreamOperation {
	pub fn new(path: impl Into<String>) -> Self {
		StreamOperation { path: path.into(), offset: 0, eof: false, expect_eof: false }
	}

	pub fn offset(&self) -> u64 {
		self.offset
	}

	pub fn eof(&self) -> bool {
		self.eof
	}

	/// Read up to `length` bytes at the current offset
	///
	/// Returns an empty buffer once EOF was reached.
	pub fn read(
		&mut self,
		session: &mut Session,
		length: usize,
		timeout: Option<Duration>,
	) -> GridResult<Vec<u8>> {
		if self.eof {
			return Ok(Vec::new());
		}
		let op = Operation::new();
		op.start(session.aborter());
		session.transport_mut().begin_read(&self.path, self.offset, length, op.completion())?;
		let chunk = op.wait(timeout)?;
		self.offset += chunk.data.len() as u64;
		self.eof = chunk.eof;
		// A full read may leave a trailing EOF-only completion behind
		self.expect_eof = !chunk.eof && length > 0 && chunk.data.len() == length;
		Ok(chunk.data)
	}

	/// Consume a pending EOF-only completion with a zero-cost read
	pub fn drain_eof(
		&mut self,
		session: &mut Session,
		timeout: Option<Duration>,
	) -> GridResult<()> {
		while self.expect_eof && !self.eof {
			self.expect_eof = false;
			let op = Operation::new();
			op.start(session.aborter());
			session.transport_mut().begin_read(&self.path, self.offset, 0, op.completion())?;
			let chunk = op.wait(timeout)?;
			self.offset += chunk.data.len() as u64;
			self.eof = chunk.eof;
		}
		Ok(())
	}

	/// Write one chunk at the current offset
	pub fn write(
		&mut self,
		session: &mut Session,
		data: Vec<u8>,
		eof: bool,
		timeout: Option<Duration>,
	) -> GridResult<usize> {
		let op = Operation::new();
		op.start(session.aborter());
		session
			.transport_mut()
			.begin_write(&self.path, self.offset, data, eof, op.completion())?;
		let chunk = op.wait(timeout)?;
		self.offset += chunk.data.len() as u64;
		self.eof = chunk.eof;
		Ok(chunk.data.len())
	}

	/// Commit an upload that has not seen EOF yet with a zero-length
	/// EOF write
	pub fn commit(&mut self, session: &mut Session, timeout: Option<Duration>) -> GridResult<()> {
		if !self.eof {
			debug!("committing stream PUT for {}", self.path);
			self.write(session, Vec::new(), true, timeout)?;
		}
		Ok(())
	}
}


// vim: ts=4
