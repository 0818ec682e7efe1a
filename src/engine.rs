//! Engine entry point
//!
//! [`GridEngine`] ties the pieces together: configuration, the session
//! pool, the transport connector, the credential and the telemetry sinks.
//! Construction activates the shared runtime (reference counted); dropping
//! the engine releases it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bulk::{run_pipeline, BulkResult, TransferTask};
use crate::config::{Config, TransferOptions};
use crate::endpoint::{Endpoint, Url};
use crate::error::{GridResult, Kind};
use crate::events::{EventSink, NullSink, ProgressSink};
use crate::global;
use crate::namespace;
use crate::pool::ConnectionPool;
use crate::protocol::ftp::FtpConnector;
use crate::session::{Connector, Credential, DirEntry, Session, SessionSettings, StatInfo};
use crate::transfer::{TransferCoordinator, TransferSummary};

/// Cooperative cancellation flag shared with long-running calls
///
/// Cancellation is a request: in-flight operations observe it at their
/// next checkpoint and finish as `Canceled`.
#[derive(Clone)]
pub struct CancelToken {
	flag: Arc<AtomicBool>,
}

impl CancelToken {
	pub fn new() -> Self {
		CancelToken { flag: Arc::new(AtomicBool::new(false)) }
	}

	pub fn cancel(&self) {
		self.flag.store(true, Ordering::SeqCst);
	}

	pub fn is_canceled(&self) -> bool {
		self.flag.load(Ordering::SeqCst)
	}
}

impl Default for CancelToken {
	fn default() -> Self {
		Self::new()
	}
}

/// Protocol-client engine for GridFTP-style endpoints
pub struct GridEngine {
	config: Config,
	credential: Credential,
	pool: ConnectionPool,
	connector: Arc<dyn Connector>,
	events: Arc<dyn EventSink>,
	progress: Arc<dyn ProgressSink>,
	cancel: CancelToken,
}

impl GridEngine {
	/// Build an engine with the default wire transport
	pub fn new(config: Config, credential: Credential) -> GridResult<Self> {
		Self::with_connector(config, credential, Arc::new(FtpConnector::new()))
	}

	/// Build an engine with a custom transport connector (stub endpoints,
	/// alternative wire implementations)
	pub fn with_connector(
		config: Config,
		credential: Credential,
		connector: Arc<dyn Connector>,
	) -> GridResult<Self> {
		global::activate()?;
		let pool = ConnectionPool::new(config.pool_capacity);
		Ok(GridEngine {
			config,
			credential,
			pool,
			connector,
			events: Arc::new(NullSink),
			progress: Arc::new(NullSink),
			cancel: CancelToken::new(),
		})
	}

	/// Register a telemetry sink for lifecycle events
	pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
		self.events = sink;
		self
	}

	/// Register a sink for periodic transfer progress
	pub fn progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
		self.progress = sink;
		self
	}

	/// Token that cancels calls running against this engine
	pub fn cancel_token(&self) -> CancelToken {
		self.cancel.clone()
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	// === Namespace operations ===

	pub fn stat(&self, url: &Url) -> GridResult<StatInfo> {
		self.with_session(url.endpoint(), |s| {
			namespace::stat(s, url.path(), self.config.operation_deadline())
		})
	}

	pub fn exists(&self, url: &Url) -> GridResult<bool> {
		self.with_session(url.endpoint(), |s| {
			namespace::exists(s, url.path(), self.config.operation_deadline())
		})
	}

	pub fn mkdir(&self, url: &Url) -> GridResult<()> {
		self.with_session(url.endpoint(), |s| {
			namespace::mkdir(s, url.path(), self.config.operation_deadline())
		})
	}

	pub fn delete(&self, url: &Url) -> GridResult<()> {
		self.with_session(url.endpoint(), |s| {
			namespace::delete(s, url.path(), self.config.operation_deadline())
		})
	}

	/// Rename within one endpoint; renames never cross hosts
	pub fn rename(&self, source: &Url, dest: &Url) -> GridResult<()> {
		if source.endpoint() != dest.endpoint() {
			return Err(crate::error::GridError::new(
				Kind::InvalidArgument,
				format!("rename cannot cross endpoints: {} => {}", source, dest),
			));
		}
		self.with_session(source.endpoint(), |s| {
			namespace::rename(s, source.path(), dest.path(), self.config.operation_deadline())
		})
	}

	pub fn chmod(&self, url: &Url, mode: u32) -> GridResult<()> {
		self.with_session(url.endpoint(), |s| {
			namespace::chmod(s, url.path(), mode, self.config.operation_deadline())
		})
	}

	pub fn list(&self, url: &Url) -> GridResult<Vec<DirEntry>> {
		self.with_session(url.endpoint(), |s| {
			namespace::list(s, url.path(), self.config.operation_deadline())
		})
	}

	pub fn checksum(&self, url: &Url, algorithm: &str) -> GridResult<String> {
		self.with_session(url.endpoint(), |s| {
			namespace::checksum(s, url.path(), algorithm, self.config.operation_deadline())
		})
	}

	// === Transfers ===

	/// Copy one file between two endpoints (third-party transfer)
	pub fn copy(
		&self,
		opts: &TransferOptions,
		source: &Url,
		dest: &Url,
	) -> GridResult<TransferSummary> {
		TransferCoordinator::new(self, opts).copy(source, dest)
	}

	/// Copy an ordered batch of files as one pipelined exchange
	///
	/// Always returns one outcome per task; the call is `Err` only for
	/// invalid input, never for per-task failures.
	pub fn copy_bulk(&self, opts: &TransferOptions, tasks: Vec<TransferTask>) -> GridResult<BulkResult> {
		if tasks.is_empty() {
			return Err(crate::error::GridError::new(
				Kind::InvalidArgument,
				"bulk copy requires at least one task",
			));
		}
		run_pipeline(self, opts, tasks)
	}

	// === Internals shared with the transfer modules ===

	pub(crate) fn acquire_session(&self, endpoint: &Endpoint) -> GridResult<Session> {
		let settings = SessionSettings::from_config(&self.config);
		self.pool.acquire(endpoint, &settings, &self.credential, self.connector.as_ref())
	}

	pub(crate) fn release_session(&self, session: Session, reusable: bool) {
		self.pool.release(session, reusable && self.config.session_reuse);
	}

	pub(crate) fn with_session<R>(
		&self,
		endpoint: &Endpoint,
		f: impl FnOnce(&mut Session) -> GridResult<R>,
	) -> GridResult<R> {
		let mut session = self.acquire_session(endpoint)?;
		let result = f(&mut session);
		self.release_session(session, result.is_ok());
		result
	}

	pub(crate) fn events(&self) -> &dyn EventSink {
		self.events.as_ref()
	}

	pub(crate) fn events_arc(&self) -> Arc<dyn EventSink> {
		self.events.clone()
	}

	pub(crate) fn progress(&self) -> Arc<dyn ProgressSink> {
		self.progress.clone()
	}

	pub(crate) fn is_canceled(&self) -> bool {
		self.cancel.is_canceled()
	}
}

impl Drop for GridEngine {
	fn drop(&mut self) {
		self.pool.clear();
		global::deactivate();
	}
}

// vim: ts=4
