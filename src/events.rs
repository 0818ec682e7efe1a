//! Lifecycle event notifications
//!
//! Transfers fire events at well-known points (prepare, transfer,
//! checksum, close) toward an external telemetry sink. Events are
//! fire-and-forget: the engine never interprets them.

use std::time::SystemTime;
use uuid::Uuid;

use crate::progress::PerfMarker;

/// Which side of the transfer an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
	Both,
	Source,
	Destination,
}

/// Lifecycle stages reported during a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
	PrepareEnter,
	PrepareExit,
	TransferEnter,
	TransferExit,
	TransferType,
	ChecksumEnter,
	ChecksumExit,
	CloseEnter,
	CloseExit,
	OverwriteDestination,
	UdtEnable,
	UdtDisable,
}

/// One lifecycle notification
#[derive(Debug, Clone)]
pub struct TransferEvent {
	pub transfer_id: Uuid,
	pub side: Side,
	pub stage: Stage,
	pub description: String,
	pub timestamp: SystemTime,
}

impl TransferEvent {
	pub fn new(transfer_id: Uuid, side: Side, stage: Stage, description: impl Into<String>) -> Self {
		TransferEvent {
			transfer_id,
			side,
			stage,
			description: description.into(),
			timestamp: SystemTime::now(),
		}
	}
}

/// Telemetry sink for lifecycle events
pub trait EventSink: Send + Sync {
	fn on_event(&self, event: &TransferEvent);
}

/// Sink for periodic transfer progress
pub trait ProgressSink: Send + Sync {
	fn on_progress(&self, marker: &PerfMarker);
}

/// Default sink that drops everything
pub struct NullSink;

impl EventSink for NullSink {
	fn on_event(&self, _event: &TransferEvent) {}
}

impl ProgressSink for NullSink {
	fn on_progress(&self, _marker: &PerfMarker) {}
}

// vim: ts=4
