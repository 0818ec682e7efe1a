//! Sessions and the transport seam
//!
//! A [`Session`] is one configured, authenticated connection context to one
//! endpoint. The wire itself sits behind the [`SessionTransport`] trait so
//! the engine can be exercised against stub endpoints; the real
//! implementation lives in [`crate::protocol::ftp`]. Sessions are not
//! thread-safe: ownership transfers atomically at pool acquire/release and
//! a session runs at most one operation at a time.

use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

use crate::config::{Config, TransferOptions};
use crate::endpoint::{Endpoint, Url};
use crate::error::GridResult;
use crate::logging::*;
use crate::operation::{AbortFn, Completion, StreamPayload};
use crate::progress::PerfMarker;

/// Opaque credential handed to the transport at connect time
#[derive(Debug, Clone)]
pub enum Credential {
	Anonymous,
	UserPass { user: String, pass: String },
	Proxy(Vec<u8>),
}

/// Negotiated per-session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
	pub nb_streams: u32,
	pub tcp_buffer_size: u64,
	pub gridftp_v2: bool,
	pub ipv6: bool,
	pub delayed_passive: bool,
	pub dcau: bool,
	pub enable_udt: bool,
}

impl SessionSettings {
	pub fn from_config(config: &Config) -> Self {
		SessionSettings {
			nb_streams: 0,
			tcp_buffer_size: 0,
			gridftp_v2: config.gridftp_v2,
			ipv6: config.ipv6,
			delayed_passive: config.delayed_passive,
			dcau: config.dcau,
			// The network stack is selected per transfer through
			// apply_options, never at connect time; a fresh session always
			// starts on the default stack
			enable_udt: false,
		}
	}
}

/// Stat result for a remote path
#[derive(Debug, Clone)]
pub struct StatInfo {
	pub size: u64,
	pub is_dir: bool,
	pub mode: u32,
	pub mtime: Option<SystemTime>,
}

/// One entry of a remote directory listing
#[derive(Debug, Clone)]
pub struct DirEntry {
	pub name: String,
	pub info: StatInfo,
}

/// Periodic progress delivery registered for the duration of a transfer
pub type MarkerFn = Arc<dyn Fn(PerfMarker) + Send + Sync>;

/// Supplies source/destination pairs to a pipelined bulk exchange
///
/// The transport pulls the next pair each time it finishes one file;
/// `None` signals that the batch cursor passed the end.
pub trait PairSource: Send + Sync {
	fn next_pair(&self) -> Option<(Url, Url)>;
}

/// Wire operations of one session
///
/// Every `begin_*` method starts an asynchronous call and finalizes the
/// given completion from a runtime thread. The handle returned by
/// [`SessionTransport::aborter`] requests an abort of the call in flight;
/// the aborted call still delivers its own completion.
pub trait SessionTransport: Send {
	/// Abort handle for the operation currently in flight
	fn aborter(&self) -> AbortFn;

	/// Re-apply negotiated settings, e.g. when a pooled session is reused
	/// for a different endpoint or with different per-call options
	fn reconfigure(&mut self, endpoint: &Endpoint, settings: &SessionSettings) -> GridResult<()>;

	fn begin_stat(&mut self, path: &str, done: Completion<StatInfo>) -> GridResult<()>;

	fn begin_mkdir(&mut self, path: &str, done: Completion<()>) -> GridResult<()>;

	fn begin_delete(&mut self, path: &str, done: Completion<()>) -> GridResult<()>;

	/// Rename within this session's endpoint
	fn begin_rename(&mut self, from: &str, to: &str, done: Completion<()>) -> GridResult<()>;

	fn begin_chmod(&mut self, path: &str, mode: u32, done: Completion<()>) -> GridResult<()>;

	/// List the entries of a remote directory
	fn begin_list(&mut self, path: &str, done: Completion<Vec<DirEntry>>) -> GridResult<()>;

	/// Ask the endpoint for the digest of a remote file
	fn begin_checksum(
		&mut self,
		path: &str,
		algorithm: &str,
		done: Completion<String>,
	) -> GridResult<()>;

	/// One source-to-destination third-party transfer
	fn begin_transfer(
		&mut self,
		source: &Url,
		dest: &Url,
		markers: Option<MarkerFn>,
		done: Completion<()>,
	) -> GridResult<()>;

	/// One pipelined multi-file exchange pulling pairs from `pairs`
	fn begin_bulk_transfer(
		&mut self,
		first: (Url, Url),
		pairs: Arc<dyn PairSource>,
		done: Completion<()>,
	) -> GridResult<()>;

	fn begin_read(
		&mut self,
		path: &str,
		offset: u64,
		length: usize,
		done: Completion<StreamPayload>,
	) -> GridResult<()>;

	fn begin_write(
		&mut self,
		path: &str,
		offset: u64,
		data: Vec<u8>,
		eof: bool,
		done: Completion<StreamPayload>,
	) -> GridResult<()>;

	/// Tear the connection down; the session is gone after this
	fn close(&mut self);
}

/// Builds transports; the seam the pool uses on a cache miss
pub trait Connector: Send + Sync {
	fn connect(
		&self,
		endpoint: &Endpoint,
		settings: &SessionSettings,
		credential: &Credential,
	) -> GridResult<Box<dyn SessionTransport>>;
}

/// One authenticated, configured connection context, reusable across
/// operations against one endpoint
pub struct Session {
	id: Uuid,
	endpoint: Endpoint,
	settings: SessionSettings,
	transport: Box<dyn SessionTransport>,
}

impl Session {
	pub fn new(
		endpoint: Endpoint,
		settings: SessionSettings,
		transport: Box<dyn SessionTransport>,
	) -> Self {
		let id = Uuid::new_v4();
		trace!("session {} created for {}", id, endpoint);
		Session { id, endpoint, settings, transport }
	}

	pub fn id(&self) -> Uuid {
		self.id
	}

	pub fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}

	pub fn host(&self) -> &str {
		self.endpoint.host()
	}

	pub fn settings(&self) -> &SessionSettings {
		&self.settings
	}

	pub fn aborter(&self) -> AbortFn {
		self.transport.aborter()
	}

	pub(crate) fn transport_mut(&mut self) -> &mut dyn SessionTransport {
		self.transport.as_mut()
	}

	/// Re-bind a pooled session to a different endpoint
	pub(crate) fn rebind(&mut self, endpoint: Endpoint) -> GridResult<()> {
		debug!("rebinding session {} from {} to {}", self.id, self.endpoint, endpoint);
		self.endpoint = endpoint;
		self.transport.reconfigure(&self.endpoint, &self.settings)
	}

	/// Apply per-call transfer options on top of the engine defaults
	pub(crate) fn apply_options(&mut self, opts: &TransferOptions, udt: bool) -> GridResult<()> {
		self.settings.nb_streams = opts.nb_streams;
		self.settings.tcp_buffer_size = opts.tcp_buffer_size;
		self.settings.enable_udt = udt;
		trace!(
			"session {}: {} streams, {} byte buffers, udt={}",
			self.id,
			self.settings.nb_streams,
			self.settings.tcp_buffer_size,
			udt
		);
		self.transport.reconfigure(&self.endpoint, &self.settings)
	}

	/// Destroy the session, closing the connection
	pub(crate) fn destroy(mut self) {
		trace!("destroying session {} for {}", self.id, self.endpoint);
		self.transport.close();
	}
}

// vim: ts=4
