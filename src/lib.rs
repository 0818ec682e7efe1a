//! Protocol-client engine for GridFTP-style grid storage endpoints
//!
//! The public API is blocking: namespace primitives (stat, mkdir, delete,
//! remote checksum), single third-party transfers with checksum
//! validation and rollback, and pipelined multi-file batches with
//! per-file failure isolation. Underneath, every call is an asynchronous
//! command exchange on a shared runtime, bridged by an operation state
//! machine that survives callbacks racing against timeouts and cancels.
//!
//! ```no_run
//! use gridr::{Config, Credential, GridEngine, TransferOptions, Url};
//!
//! # fn main() -> Result<(), gridr::GridError> {
//! let engine = GridEngine::new(Config::default(), Credential::Anonymous)?;
//! let source = Url::parse("gsiftp://source.example.org/dteam/file1")?;
//! let dest = Url::parse("gsiftp://dest.example.org/dteam/file1")?;
//! engine.copy(&TransferOptions::default(), &source, &dest)?;
//! # Ok(())
//! # }
//! ```

mod bulk;
mod config;
mod endpoint;
mod engine;
mod error;
mod events;
mod global;
pub mod logging;
mod namespace;
mod operation;
mod pool;
mod progress;
mod protocol;
mod session;
mod transfer;

pub use bulk::{BulkResult, TaskOutcome, TaskStatus, TransferTask};
pub use config::{ChecksumMode, Config, TransferOptions};
pub use endpoint::{Endpoint, Url, DEFAULT_GRIDFTP_PORT};
pub use engine::{CancelToken, GridEngine};
pub use error::{ChecksumSide, GridError, GridResult, Kind};
pub use events::{EventSink, NullSink, ProgressSink, Side, Stage, TransferEvent};
pub use operation::{AbortFn, Completion, OpStatus, Operation, StreamOperation, StreamPayload};
pub use pool::ConnectionPool;
pub use progress::PerfMarker;
pub use protocol::ftp::FtpConnector;
pub use session::{
	Connector, Credential, DirEntry, MarkerFn, PairSource, Session, SessionSettings,
	SessionTransport, StatInfo,
};

// vim: ts=4
