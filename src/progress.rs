//! Transfer progress markers and the inactivity watchdog
//!
//! Endpoints emit periodic performance markers during a transfer. Markers
//! feed two consumers: the caller's progress sink, and a watchdog that
//! cancels the transfer when no useful marker arrives within the
//! configured window. The watchdog deadline is independent from the
//! overall operation deadline and is re-armed on every useful sample.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::logging::*;

/// One periodic progress sample from an active transfer
#[derive(Debug, Clone)]
pub struct PerfMarker {
	pub bytes_transferred: u64,
	/// Instantaneous rate, bytes per second
	pub instant_rate: f64,
	/// Average rate since transfer start, bytes per second
	pub average_rate: f64,
	pub elapsed: Duration,
	pub source: String,
	pub dest: String,
}

/// Rate bookkeeping for transports that only see byte counts
pub(crate) struct RateMeter {
	started: Instant,
	last_sample: Instant,
	last_bytes: u64,
}

impl RateMeter {
	pub(crate) fn new() -> Self {
		let now = Instant::now();
		RateMeter { started: now, last_sample: now, last_bytes: 0 }
	}

	/// Fold a new total byte count into instant/average rates
	pub(crate) fn sample(&mut self, total_bytes: u64) -> (f64, f64, Duration) {
		let now = Instant::now();
		let elapsed = now.duration_since(self.started);
		let window = now.duration_since(self.last_sample).as_secs_f64();
		let instant = if window > 0.0 {
			(total_bytes.saturating_sub(self.last_bytes)) as f64 / window
		} else {
			0.0
		};
		let average =
			if elapsed.as_secs_f64() > 0.0 { total_bytes as f64 / elapsed.as_secs_f64() } else { 0.0 };
		self.last_sample = now;
		self.last_bytes = total_bytes;
		(instant, average, elapsed)
	}
}

struct WatchdogState {
	deadline: Instant,
	stopped: bool,
}

/// Cancels a stalled transfer after a fixed inactivity window
///
/// Runs on its own thread; [`Watchdog::feed`] pushes the deadline out by
/// one window. Dropping the watchdog stops the thread without firing.
pub(crate) struct Watchdog {
	state: Arc<(Mutex<WatchdogState>, Condvar)>,
	handle: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
	/// Arm a watchdog that runs `on_stall` once if no feed arrives within
	/// `window`
	pub(crate) fn arm(window: Duration, on_stall: Box<dyn FnOnce() + Send>) -> Self {
		let state = Arc::new((
			Mutex::new(WatchdogState { deadline: Instant::now() + window, stopped: false }),
			Condvar::new(),
		));
		let thread_state = state.clone();
		let handle = thread::spawn(move || {
			let (lock, cond) = &*thread_state;
			let mut st = lock.lock().unwrap_or_else(|e| e.into_inner());
			loop {
				if st.stopped {
					return;
				}
				let now = Instant::now();
				if now >= st.deadline {
					break;
				}
				let remaining = st.deadline - now;
				let (guard, _) =
					cond.wait_timeout(st, remaining).unwrap_or_else(|e| e.into_inner());
				st = guard;
			}
			drop(st);
			warn!("transfer inactivity window elapsed, canceling");
			on_stall();
		});
		Watchdog { state, handle: Some(handle) }
	}

	/// Re-arm: push the deadline one full window into the future
	pub(crate) fn feed(&self, window: Duration) {
		let (lock, cond) = &*self.state;
		let mut st = lock.lock().unwrap_or_else(|e| e.into_inner());
		st.deadline = Instant::now() + window;
		cond.notify_all();
	}
}

impl Drop for Watchdog {
	fn drop(&mut self) {
		{
			let (lock, cond) = &*self.state;
			let mut st = lock.lock().unwrap_or_else(|e| e.into_inner());
			st.stopped = true;
			cond.notify_all();
		}
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}
}


// vim: ts=4
