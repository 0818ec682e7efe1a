//! Reference-counted engine activation
//!
//! The underlying I/O runtime is shared process-wide and must outlive every
//! session and in-flight operation. Activation is explicit and counted:
//! each engine instance calls [`activate`] on construction and
//! [`deactivate`] on drop; the runtime is built on the first activation and
//! torn down when the count returns to zero.

use std::sync::Mutex;
use tokio::runtime;

use crate::error::{GridError, GridResult, Kind};
use crate::logging::*;

struct Activation {
	refs: usize,
	runtime: Option<runtime::Runtime>,
}

static ACTIVATION: Mutex<Activation> = Mutex::new(Activation { refs: 0, runtime: None });

/// Activate the engine, building the shared runtime on first use
pub fn activate() -> GridResult<()> {
	let mut state = ACTIVATION.lock().unwrap_or_else(|e| e.into_inner());
	if state.runtime.is_none() {
		debug!("activating grid engine runtime");
		let rt = runtime::Builder::new_multi_thread()
			.worker_threads(2)
			.thread_name("gridr-io")
			.enable_all()
			.build()
			.map_err(|e| GridError::new(Kind::ConnectFailure, format!("runtime start failed: {}", e)))?;
		state.runtime = Some(rt);
	}
	state.refs += 1;
	Ok(())
}

/// Drop one activation reference, tearing the runtime down at zero
pub fn deactivate() {
	let rt = {
		let mut state = ACTIVATION.lock().unwrap_or_else(|e| e.into_inner());
		if state.refs == 0 {
			warn!("deactivate called without matching activate");
			return;
		}
		state.refs -= 1;
		if state.refs == 0 {
			debug!("deactivating grid engine runtime");
			state.runtime.take()
		} else {
			None
		}
	};
	// Shut the runtime down outside the lock; worker threads may still be
	// finishing abort completions.
	if let Some(rt) = rt {
		rt.shutdown_background();
	}
}

/// Handle to the shared runtime; fails when the engine is not activated
pub(crate) fn runtime_handle() -> GridResult<runtime::Handle> {
	let state = ACTIVATION.lock().unwrap_or_else(|e| e.into_inner());
	state
		.runtime
		.as_ref()
		.map(|rt| rt.handle().clone())
		.ok_or_else(|| GridError::new(Kind::InvalidArgument, "engine not activated"))
}


// vim: ts=4
