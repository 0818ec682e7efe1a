//! Bulk pipeline tests
//!
//! One outcome per submitted task, always; per-task failures isolated in
//! prepare and close; transfer-phase failures shared across the batch;
//! parent creation deduplicated between sibling tasks; UDT fallback
//! retried exactly once for the whole exchange.

mod common;

use common::{checksum_of, CollectSink, StubGrid};
use gridr::{
	ChecksumMode, Config, Credential, GridEngine, Kind, Stage, TaskStatus, TransferOptions,
	TransferTask, Url,
};

fn engine_with(grid: &StubGrid, config: Config) -> GridEngine {
	GridEngine::with_connector(config, Credential::Anonymous, grid.connector()).unwrap()
}

fn url(s: &str) -> Url {
	Url::parse(s).unwrap()
}

fn task(src: &str, dst: &str) -> TransferTask {
	TransferTask::new(url(src), url(dst))
}

/// Every submitted task gets exactly one outcome
#[test]
fn test_bulk_outcome_per_task() {
	let grid = StubGrid::new();
	grid.add_file("src.example.org", "/a", b"one");
	grid.add_file("src.example.org", "/b", b"two");
	grid.add_file("src.example.org", "/c", b"three");
	let engine = engine_with(&grid, Config::default());

	let tasks = vec![
		task("gsiftp://src.example.org/a", "gsiftp://dst.example.org/a"),
		task("gsiftp://src.example.org/b", "gsiftp://dst.example.org/b"),
		task("gsiftp://src.example.org/c", "gsiftp://dst.example.org/c"),
	];
	let result = engine.copy_bulk(&TransferOptions::default(), tasks).unwrap();

	assert_eq!(result.outcomes.len(), 3);
	assert!(result.all_succeeded());
	assert!(result.outcomes.iter().all(|o| o.status == TaskStatus::Succeeded));
	assert_eq!(grid.file("dst.example.org", "/b").unwrap(), b"two");
}

/// A missing source fails its own task and nothing else
#[test]
fn test_missing_source_isolated() {
	let grid = StubGrid::new();
	grid.add_file("src.example.org", "/a", b"one");
	grid.add_file("src.example.org", "/c", b"three");
	let engine = engine_with(&grid, Config::default());

	let tasks = vec![
		task("gsiftp://src.example.org/a", "gsiftp://dst.example.org/a"),
		task("gsiftp://src.example.org/missing", "gsiftp://dst.example.org/missing"),
		task("gsiftp://src.example.org/c", "gsiftp://dst.example.org/c"),
	];
	let result = engine.copy_bulk(&TransferOptions::default(), tasks).unwrap();

	let statuses: Vec<TaskStatus> = result.outcomes.iter().map(|o| o.status).collect();
	assert_eq!(statuses, vec![TaskStatus::Succeeded, TaskStatus::Failed, TaskStatus::Succeeded]);
	assert_eq!(result.outcomes[1].error.as_ref().unwrap().kind(), Kind::NotFound);
	assert!(result.shared_error.is_none());
	assert_eq!(result.failed(), 1);
	// Only the two viable pairs were handed to the exchange
	assert_eq!(grid.transfers(), 2);
}

/// A transfer-phase failure is shared: recorded once, every remaining
/// task marked failed without its own copy of the error
#[test]
fn test_shared_transfer_failure() {
	let grid = StubGrid::new();
	grid.add_file("src.example.org", "/a", b"one");
	grid.add_file("src.example.org", "/b", b"two");
	grid.state.lock().unwrap().fail_transfers_with = Some("control channel lost".to_string());
	let engine = engine_with(&grid, Config::default());

	let tasks = vec![
		task("gsiftp://src.example.org/a", "gsiftp://dst.example.org/a"),
		task("gsiftp://src.example.org/b", "gsiftp://dst.example.org/b"),
	];
	let result = engine.copy_bulk(&TransferOptions::default(), tasks).unwrap();

	assert!(result.shared_error.is_some());
	assert!(result.outcomes.iter().all(|o| o.status == TaskStatus::Failed));
	assert!(result.outcomes.iter().all(|o| o.error.is_none()));
}

/// Sibling tasks under the same directory create the parent once
#[test]
fn test_parent_created_once_for_siblings() {
	let grid = StubGrid::new();
	grid.add_file("src.example.org", "/a", b"one");
	grid.add_file("src.example.org", "/b", b"two");
	let engine = engine_with(&grid, Config::default());

	let opts = TransferOptions { create_parent: true, ..TransferOptions::default() };
	let tasks = vec![
		task("gsiftp://src.example.org/a", "gsiftp://dst.example.org/out/a"),
		task("gsiftp://src.example.org/b", "gsiftp://dst.example.org/out/b"),
	];
	let result = engine.copy_bulk(&opts, tasks).unwrap();

	assert!(result.all_succeeded());
	assert_eq!(grid.mkdir_count("dst.example.org", "/out"), 1);
}

/// Cancellation before the exchange marks every task canceled
#[test]
fn test_cancel_before_transfer() {
	let grid = StubGrid::new();
	grid.add_file("src.example.org", "/a", b"one");
	grid.add_file("src.example.org", "/b", b"two");
	let engine = engine_with(&grid, Config::default());
	engine.cancel_token().cancel();

	let tasks = vec![
		task("gsiftp://src.example.org/a", "gsiftp://dst.example.org/a"),
		task("gsiftp://src.example.org/b", "gsiftp://dst.example.org/b"),
	];
	let result = engine.copy_bulk(&TransferOptions::default(), tasks).unwrap();

	assert_eq!(result.outcomes.len(), 2);
	for outcome in &result.outcomes {
		assert_eq!(outcome.status, TaskStatus::Failed);
		assert_eq!(outcome.error.as_ref().unwrap().kind(), Kind::Canceled);
	}
	assert_eq!(grid.transfers(), 0);
}

/// An empty batch is a caller error, not an empty result
#[test]
fn test_empty_batch_rejected() {
	let grid = StubGrid::new();
	let engine = engine_with(&grid, Config::default());
	let err = engine.copy_bulk(&TransferOptions::default(), Vec::new()).unwrap_err();
	assert_eq!(err.kind(), Kind::InvalidArgument);
}

/// The whole exchange is retried once without UDT, never twice
#[test]
fn test_bulk_udt_retry_once() {
	let grid = StubGrid::new();
	grid.add_file("src.example.org", "/a", b"one");
	grid.add_file("src.example.org", "/b", b"two");
	grid.state.lock().unwrap().reject_udt = true;
	let sink = CollectSink::new();
	let config = Config { enable_udt: true, ..Config::default() };
	let engine = engine_with(&grid, config).event_sink(sink.clone());

	let tasks = vec![
		task("gsiftp://src.example.org/a", "gsiftp://dst.example.org/a"),
		task("gsiftp://src.example.org/b", "gsiftp://dst.example.org/b"),
	];
	let result = engine.copy_bulk(&TransferOptions::default(), tasks).unwrap();

	assert!(result.all_succeeded());
	assert_eq!(grid.udt_attempts(), 1);
	assert_eq!(grid.transfers(), 2);
	assert!(sink.stages().contains(&Stage::UdtDisable));
}

/// A retry that fails with the same UDT rejection ends the batch; the
/// exchange runs exactly twice
#[test]
fn test_bulk_udt_rejection_on_retry_not_retried_again() {
	let grid = StubGrid::new();
	grid.add_file("src.example.org", "/a", b"one");
	grid.add_file("src.example.org", "/b", b"two");
	// Every exchange attempt fails with the rejection, UDT or not
	grid.state.lock().unwrap().fail_transfers_with =
		Some("500 Command failed : udt driver not whitelisted".to_string());
	let config = Config { enable_udt: true, ..Config::default() };
	let engine = engine_with(&grid, config);

	let tasks = vec![
		task("gsiftp://src.example.org/a", "gsiftp://dst.example.org/a"),
		task("gsiftp://src.example.org/b", "gsiftp://dst.example.org/b"),
	];
	let result = engine.copy_bulk(&TransferOptions::default(), tasks).unwrap();

	assert_eq!(grid.attempts(), 2);
	assert_eq!(grid.udt_attempts(), 1);
	assert_eq!(grid.transfers(), 0);
	assert!(result.shared_error.as_ref().map(|e| e.is_udt_rejection()).unwrap_or(false));
	assert_eq!(result.failed(), 2);
	assert!(result.outcomes.iter().all(|o| o.status == TaskStatus::Failed && o.error.is_none()));
}

/// A directory source fails its task during prepare
#[test]
fn test_directory_source_rejected() {
	let grid = StubGrid::new();
	grid.add_file("src.example.org", "/dir/child", b"x");
	grid.add_file("src.example.org", "/b", b"two");
	let engine = engine_with(&grid, Config::default());

	let tasks = vec![
		task("gsiftp://src.example.org/dir", "gsiftp://dst.example.org/dir"),
		task("gsiftp://src.example.org/b", "gsiftp://dst.example.org/b"),
	];
	let result = engine.copy_bulk(&TransferOptions::default(), tasks).unwrap();

	assert_eq!(result.outcomes[0].status, TaskStatus::Failed);
	assert_eq!(result.outcomes[0].error.as_ref().unwrap().kind(), Kind::IsADirectory);
	assert_eq!(result.outcomes[1].status, TaskStatus::Succeeded);
}

/// A wrong per-task declared digest fails that task in prepare
#[test]
fn test_declared_checksum_mismatch_in_prepare() {
	let grid = StubGrid::new();
	grid.add_file("src.example.org", "/a", b"one");
	grid.add_file("src.example.org", "/b", b"two");
	let engine = engine_with(&grid, Config::default());

	let opts = TransferOptions {
		checksum_mode: ChecksumMode { source: true, target: false },
		..TransferOptions::default()
	};
	let tasks = vec![
		TransferTask::with_checksum(
			url("gsiftp://src.example.org/a"),
			url("gsiftp://dst.example.org/a"),
			"0000000000000000",
		),
		TransferTask::with_checksum(
			url("gsiftp://src.example.org/b"),
			url("gsiftp://dst.example.org/b"),
			checksum_of(b"two"),
		),
	];
	let result = engine.copy_bulk(&opts, tasks).unwrap();

	assert_eq!(result.outcomes[0].status, TaskStatus::Failed);
	assert!(matches!(
		result.outcomes[0].error.as_ref().unwrap().kind(),
		Kind::ChecksumMismatch(gridr::ChecksumSide::Source)
	));
	assert_eq!(result.outcomes[1].status, TaskStatus::Succeeded);
	assert_eq!(grid.transfers(), 1);
}

/// The close phase compares sizes and fails the shortened task only
#[test]
fn test_destination_size_mismatch_detected() {
	let grid = StubGrid::new();
	grid.add_file("src.example.org", "/a", b"intact");
	grid.add_file("src.example.org", "/b", b"shortened");
	grid.state.lock().unwrap().truncate_dest = Some("/b".to_string());
	let engine = engine_with(&grid, Config::default());

	let tasks = vec![
		task("gsiftp://src.example.org/a", "gsiftp://dst.example.org/a"),
		task("gsiftp://src.example.org/b", "gsiftp://dst.example.org/b"),
	];
	let result = engine.copy_bulk(&TransferOptions::default(), tasks).unwrap();

	assert_eq!(result.outcomes[0].status, TaskStatus::Succeeded);
	assert_eq!(result.outcomes[1].status, TaskStatus::Failed);
	assert_eq!(result.outcomes[1].error.as_ref().unwrap().kind(), Kind::SizeMismatch);
}

// vim: ts=4
