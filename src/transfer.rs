//! Single third-party transfer coordination
//!
//! One [`TransferCoordinator`] run moves one file between two endpoints:
//! destination preparation (overwrite / parent creation), the transfer
//! itself under an inactivity watchdog, checksum validation on both sides,
//! and destination rollback when a transfer that created the file fails.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::TransferOptions;
use crate::endpoint::Url;
use crate::error::{compare_checksums, ChecksumSide, GridError, GridResult, Kind};
use crate::events::{Side, Stage, TransferEvent};
use crate::logging::*;
use crate::namespace;
use crate::operation::Operation;
use crate::progress::Watchdog;
use crate::session::MarkerFn;

use crate::engine::GridEngine;

/// Result of one successful transfer
#[derive(Debug, Clone)]
pub struct TransferSummary {
	pub transfer_id: Uuid,
	pub source_checksum: Option<String>,
	pub destination_checksum: Option<String>,
}

pub(crate) struct TransferCoordinator<'a> {
	engine: &'a GridEngine,
	opts: &'a TransferOptions,
	transfer_id: Uuid,
}

impl<'a> TransferCoordinator<'a> {
	pub(crate) fn new(engine: &'a GridEngine, opts: &'a TransferOptions) -> Self {
		TransferCoordinator { engine, opts, transfer_id: Uuid::new_v4() }
	}

	pub(crate) fn copy(&self, source: &Url, dest: &Url) -> GridResult<TransferSummary> {
		let config = self.engine.config();
		let mode = self.opts.effective_checksum_mode(config);
		let algorithm = self.opts.algorithm(config).to_string();
		let deadline = config.operation_deadline();

		debug!("[{}] copy {} => {}", self.transfer_id, source, dest);

		// Source checksum before anything touches the destination
		let source_checksum = if mode.source {
			Some(self.source_checksum(source, &algorithm, deadline)?)
		} else {
			None
		};

		// Destination preparation; remembers whether the destination
		// pre-existed, which decides the rollback rule below
		let dest_preexisted = if self.opts.strict_copy {
			false
		} else {
			self.prepare_destination(dest, deadline)?
		};

		self.event(Side::Both, Stage::TransferEnter, format!(
			"({}) {} => ({}) {}",
			source.endpoint().host_and_port(),
			source,
			dest.endpoint().host_and_port(),
			dest
		));
		self.event(Side::Both, Stage::TransferType, "push");

		let transferred = self.copy_with_udt_fallback(source, dest).and_then(|()| {
			self.event(Side::Both, Stage::TransferExit, format!(
				"({}) {} => ({}) {}",
				source.endpoint().host_and_port(),
				source,
				dest.endpoint().host_and_port(),
				dest
			));
			if mode.target {
				self.verify_destination(dest, &algorithm, &source_checksum, deadline)
			} else {
				Ok(None)
			}
		});

		match transferred {
			Ok(destination_checksum) => Ok(TransferSummary {
				transfer_id: self.transfer_id,
				source_checksum,
				destination_checksum,
			}),
			Err(e) => {
				// A destination this transfer created is deleted again;
				// one that pre-existed is left alone
				if !dest_preexisted && !self.opts.strict_copy {
					debug!("[{}] transfer failed, cleaning destination {}", self.transfer_id, dest);
					match self.engine.with_session(dest.endpoint(), |s| {
						namespace::delete(s, dest.path(), deadline)
					}) {
						Ok(()) => Err(e),
						// Nothing was written, nothing to clean
						Err(cleanup) if cleanup.kind() == Kind::NotFound => Err(e),
						Err(cleanup) => Err(e.with_cleanup_failure(&cleanup)),
					}
				} else {
					Err(e)
				}
			}
		}
	}

	/// Compute the source digest and verify it against a user-declared one
	fn source_checksum(
		&self,
		source: &Url,
		algorithm: &str,
		deadline: Option<Duration>,
	) -> GridResult<String> {
		self.event(Side::Source, Stage::ChecksumEnter, algorithm);
		let digest = self.engine.with_session(source.endpoint(), |s| {
			namespace::checksum(s, source.path(), algorithm, deadline)
		})?;
		self.event(Side::Source, Stage::ChecksumExit, format!("{}={}", algorithm, digest));

		if let Some(declared) = &self.opts.user_checksum {
			if !compare_checksums(declared, &digest) {
				return Err(GridError::new(
					Kind::ChecksumMismatch(ChecksumSide::Source),
					format!("user-declared and source checksums differ: {} != {}", declared, digest),
				));
			}
		}
		Ok(digest)
	}

	/// Overwrite handling and parent creation; returns whether the
	/// destination pre-existed (and was deleted for replacement)
	fn prepare_destination(&self, dest: &Url, deadline: Option<Duration>) -> GridResult<bool> {
		let existed = self
			.engine
			.with_session(dest.endpoint(), |s| namespace::exists(s, dest.path(), deadline))?;
		if existed {
			if !self.opts.replace_existing {
				return Err(GridError::new(
					Kind::AlreadyExists,
					format!("destination {} already exists", dest),
				));
			}
			debug!("[{}] destination {} exists, deleting for overwrite", self.transfer_id, dest);
			self.engine
				.with_session(dest.endpoint(), |s| namespace::delete(s, dest.path(), deadline))?;
			self.event(Side::Destination, Stage::OverwriteDestination, format!("Deleted {}", dest));
			// The file was there, so its parent directory is there too
			return Ok(true);
		}
		if self.opts.create_parent {
			self.engine
				.with_session(dest.endpoint(), |s| namespace::ensure_parent(s, dest, deadline))?;
		}
		Ok(false)
	}

	/// Run the transfer, retrying exactly once without UDT when the
	/// endpoint rejects the UDT driver
	fn copy_with_udt_fallback(&self, source: &Url, dest: &Url) -> GridResult<()> {
		let udt = self.engine.config().enable_udt;
		if udt {
			info!("[{}] trying UDT transfer", self.transfer_id);
			self.event(Side::Both, Stage::UdtEnable, "Trying UDT");
		}
		match self.run_transfer(source, dest, udt) {
			Err(e) if udt && e.is_udt_rejection() => {
				warn!("[{}] UDT transfer failed, disabling and retrying: {}", self.transfer_id, e);
				self.event(
					Side::Both,
					Stage::UdtDisable,
					format!("UDT failed. Falling back to default mode: {}", e),
				);
				self.run_transfer(source, dest, false)
			}
			other => other,
		}
	}

	/// One transfer attempt with an armed inactivity watchdog
	fn run_transfer(&self, source: &Url, dest: &Url, udt: bool) -> GridResult<()> {
		let mut session = self.engine.acquire_session(source.endpoint())?;
		session.apply_options(self.opts, udt)?;

		let op = Operation::<()>::new();
		op.start(session.aborter());

		let perf_window = self.engine.config().perf_timeout;
		let watchdog = if perf_window > 0 {
			let window = Duration::from_secs(perf_window);
			let canceler = op.clone();
			let msg = format!(
				"transfer canceled because the performance marker timeout of {} seconds was exceeded, \
				 or all markers in that period reported zero bytes transferred",
				perf_window
			);
			Some(Arc::new(Watchdog::arm(window, Box::new(move || canceler.cancel(&msg)))))
		} else {
			None
		};

		let markers: Option<MarkerFn> = {
			let sink = self.engine.progress();
			let watchdog = watchdog.clone();
			let window = Duration::from_secs(perf_window);
			Some(Arc::new(move |marker| {
				sink.on_progress(&marker);
				if let Some(wd) = &watchdog {
					// Some endpoints checksum before closing and report
					// zero throughput for a while; only a marker with
					// bytes actually flowing re-arms the watchdog
					if marker.instant_rate != 0.0 {
						wd.feed(window);
					} else {
						info!("performance marker with zero throughput, not re-arming watchdog");
					}
				}
			}))
		};

		let result = session
			.transport_mut()
			.begin_transfer(source, dest, markers, op.completion())
			.and_then(|()| op.wait(self.opts.deadline()));

		drop(watchdog);
		self.engine.release_session(session, result.is_ok());
		result
	}

	/// Destination-side checksum validation after a successful transfer
	fn verify_destination(
		&self,
		dest: &Url,
		algorithm: &str,
		source_checksum: &Option<String>,
		deadline: Option<Duration>,
	) -> GridResult<Option<String>> {
		self.event(Side::Destination, Stage::ChecksumEnter, algorithm);
		let digest = self.engine.with_session(dest.endpoint(), |s| {
			namespace::checksum(s, dest.path(), algorithm, deadline)
		})?;
		self.event(Side::Destination, Stage::ChecksumExit, format!("{}={}", algorithm, digest));

		if let Some(src) = source_checksum {
			if !compare_checksums(src, &digest) {
				return Err(GridError::new(
					Kind::ChecksumMismatch(ChecksumSide::Destination),
					format!("source and destination checksums differ: {} != {}", src, digest),
				));
			}
		} else if let Some(declared) = &self.opts.user_checksum {
			if !compare_checksums(declared, &digest) {
				return Err(GridError::new(
					Kind::ChecksumMismatch(ChecksumSide::UserDeclared),
					format!(
						"user-declared and destination checksums differ: {} != {}",
						declared, digest
					),
				));
			}
		}
		Ok(Some(digest))
	}

	fn event(&self, side: Side, stage: Stage, description: impl Into<String>) {
		self.engine
			.events()
			.on_event(&TransferEvent::new(self.transfer_id, side, stage, description));
	}
}

// vim: ts=4
