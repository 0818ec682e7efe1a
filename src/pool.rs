//! Idle session cache
//!
//! Connection setup against a grid endpoint is expensive (TCP, TLS
//! handshake, credential exchange, feature negotiation), so released
//! sessions are cached keyed by endpoint host. Multiple idle sessions per
//! host are legal. The cache is bounded: instead of a per-item LRU, hitting
//! the bound destroys every idle session before the released one is
//! inserted.

use std::sync::Mutex;

use crate::endpoint::Endpoint;
use crate::error::GridResult;
use crate::logging::*;
use crate::session::{Connector, Credential, Session, SessionSettings};

/// Bounded cache of idle sessions, keyed by endpoint host
pub struct ConnectionPool {
	idle: Mutex<Vec<Session>>,
	capacity: usize,
}

impl ConnectionPool {
	pub fn new(capacity: usize) -> Self {
		ConnectionPool { idle: Mutex::new(Vec::new()), capacity }
	}

	/// Number of idle sessions currently cached
	pub fn idle_count(&self) -> usize {
		self.lock().len()
	}

	/// Take a session for `endpoint`, reusing an idle one when possible
	///
	/// Lookup order: an idle session for this exact host; failing that,
	/// *any* idle session rebound to the new endpoint (so idle sessions
	/// never starve behind a host mismatch); failing that, a fresh
	/// connection through `connector`. A construction failure surfaces as
	/// an error and never leaves a partial entry in the pool.
	pub fn acquire(
		&self,
		endpoint: &Endpoint,
		settings: &SessionSettings,
		credential: &Credential,
		connector: &dyn Connector,
	) -> GridResult<Session> {
		let recycled = {
			let mut idle = self.lock();
			match idle.iter().position(|s| s.host() == endpoint.host()) {
				Some(pos) => {
					trace!("session for {} found in cache", endpoint.host());
					Some(idle.remove(pos))
				}
				None if !idle.is_empty() => {
					trace!(
						"no session cached for {}, rebinding a generic one",
						endpoint.host()
					);
					Some(idle.remove(0))
				}
				None => None,
			}
		};

		// Network work happens with the pool lock released
		match recycled {
			Some(mut session) => {
				if session.host() == endpoint.host() {
					return Ok(session);
				}
				match session.rebind(endpoint.clone()) {
					Ok(()) => Ok(session),
					Err(e) => {
						debug!("rebind failed ({}), opening a fresh session", e);
						session.destroy();
						self.connect_new(endpoint, settings, credential, connector)
					}
				}
			}
			None => {
				trace!("no idle session for {}, connecting", endpoint.host());
				self.connect_new(endpoint, settings, credential, connector)
			}
		}
	}

	/// Give a session back to the pool
	///
	/// With reuse disabled the session is destroyed immediately. If
	/// inserting would exceed capacity, every currently idle session is
	/// destroyed first; the pool may transiently exceed capacity between
	/// release and eviction, never after.
	pub fn release(&self, session: Session, reusable: bool) {
		if !reusable {
			session.destroy();
			return;
		}
		let evicted = {
			let mut idle = self.lock();
			if idle.len() >= self.capacity {
				debug!("session cache full ({}), evicting all idle sessions", idle.len());
				std::mem::take(&mut *idle)
			} else {
				Vec::new()
			}
		};
		for old in evicted {
			old.destroy();
		}
		trace!("caching session for {}", session.host());
		self.lock().push(session);
	}

	/// Destroy every idle session
	pub fn clear(&self) {
		let drained = std::mem::take(&mut *self.lock());
		for session in drained {
			session.destroy();
		}
	}

	fn connect_new(
		&self,
		endpoint: &Endpoint,
		settings: &SessionSettings,
		credential: &Credential,
		connector: &dyn Connector,
	) -> GridResult<Session> {
		let transport = connector.connect(endpoint, settings, credential)?;
		Ok(Session::new(endpoint.clone(), settings.clone(), transport))
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Session>> {
		self.idle.lock().unwrap_or_else(|e| e.into_inner())
	}
}

impl Drop for ConnectionPool {
	fn drop(&mut self) {
		self.clear();
	}
}

// vim: ts=4
