//! Engine configuration
//!
//! Two layers: [`Config`] holds the engine-level defaults (session reuse,
//! pool capacity, timeouts, protocol toggles), loadable from a TOML file;
//! [`TransferOptions`] is the per-call snapshot a caller passes with each
//! copy, immutable for the duration of that call.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GridError, GridResult, Kind};

/// Engine-level defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Keep sessions in the pool for reuse across operations
	pub session_reuse: bool,

	/// Idle sessions kept before a bulk eviction is triggered
	pub pool_capacity: usize,

	/// Default deadline for a single protocol operation, in seconds
	pub operation_timeout: u64,

	/// Inactivity window for the transfer watchdog, in seconds.
	/// 0 disables stall detection.
	pub perf_timeout: u64,

	/// Negotiate protocol version 2 features
	pub gridftp_v2: bool,

	/// Allow IPv6 data channels
	pub ipv6: bool,

	/// Delay passive-mode negotiation until the data channel is needed
	pub delayed_passive: bool,

	/// Data-channel authentication
	pub dcau: bool,

	/// Try the UDT network stack first for transfers
	pub enable_udt: bool,

	/// Checksum algorithm used when the caller does not name one
	pub default_checksum: String,

	/// Skip the source checksum even when validation is enabled
	pub skip_source_checksum: bool,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			session_reuse: true,
			pool_capacity: 400,
			operation_timeout: 300,
			perf_timeout: 180,
			gridftp_v2: true,
			ipv6: false,
			delayed_passive: true,
			dcau: false,
			enable_udt: false,
			default_checksum: "ADLER32".to_string(),
			skip_source_checksum: false,
		}
	}
}

impl Config {
	/// Load configuration from a TOML file, falling back to defaults for
	/// missing keys
	pub fn load(path: impl AsRef<Path>) -> GridResult<Config> {
		let text = std::fs::read_to_string(path.as_ref())?;
		toml::from_str(&text)
			.map_err(|e| GridError::new(Kind::InvalidArgument, format!("bad config file: {}", e)))
	}

	pub fn operation_deadline(&self) -> Option<Duration> {
		if self.operation_timeout == 0 {
			None
		} else {
			Some(Duration::from_secs(self.operation_timeout))
		}
	}
}

/// Which digests to validate around a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumMode {
	/// Compute and verify the source digest before the transfer
	pub source: bool,
	/// Compute and verify the destination digest after the transfer
	pub target: bool,
}

impl ChecksumMode {
	pub const NONE: ChecksumMode = ChecksumMode { source: false, target: false };
	pub const BOTH: ChecksumMode = ChecksumMode { source: true, target: true };

	pub fn enabled(&self) -> bool {
		self.source || self.target
	}
}

impl Default for ChecksumMode {
	fn default() -> Self {
		ChecksumMode::NONE
	}
}

/// Per-call configuration snapshot, immutable at call time
#[derive(Debug, Clone)]
pub struct TransferOptions {
	/// Parallel data streams (0 means protocol default, stream mode)
	pub nb_streams: u32,

	/// TCP buffer size in bytes (0 means endpoint default)
	pub tcp_buffer_size: u64,

	/// Overall transfer deadline in seconds (0 means no deadline)
	pub timeout: u64,

	/// Delete a pre-existing destination before copying
	pub replace_existing: bool,

	/// Create the destination parent directory if missing
	pub create_parent: bool,

	/// Skip every destination preparation and validation step
	pub strict_copy: bool,

	/// Checksum validation mode
	pub checksum_mode: ChecksumMode,

	/// Algorithm name; None picks the configured default
	pub checksum_algorithm: Option<String>,

	/// Digest declared by the caller, verified against both sides
	pub user_checksum: Option<String>,
}

impl Default for TransferOptions {
	fn default() -> Self {
		TransferOptions {
			nb_streams: 0,
			tcp_buffer_size: 0,
			timeout: 3600,
			replace_existing: false,
			create_parent: false,
			strict_copy: false,
			checksum_mode: ChecksumMode::NONE,
			checksum_algorithm: None,
			user_checksum: None,
		}
	}
}

impl TransferOptions {
	pub fn deadline(&self) -> Option<Duration> {
		if self.timeout == 0 {
			None
		} else {
			Some(Duration::from_secs(self.timeout))
		}
	}

	/// Effective checksum mode once strict-copy and the engine-level
	/// skip flag are applied
	pub fn effective_checksum_mode(&self, config: &Config) -> ChecksumMode {
		if self.strict_copy {
			return ChecksumMode::NONE;
		}
		let mut mode = self.checksum_mode;
		if config.skip_source_checksum {
			mode.source = false;
		}
		mode
	}

	/// Algorithm to use, resolving None to the configured default
	pub fn algorithm<'a>(&'a self, config: &'a Config) -> &'a str {
		match &self.checksum_algorithm {
			Some(alg) => alg,
			None => &config.default_checksum,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strict_copy_disables_checksums() {
		let config = Config::default();
		let opts = TransferOptions {
			strict_copy: true,
			checksum_mode: ChecksumMode::BOTH,
			..TransferOptions::default()
		};
		assert_eq!(opts.effective_checksum_mode(&config), ChecksumMode::NONE);
	}

	#[test]
	fn skip_source_checksum_clears_source_only() {
		let config = Config { skip_source_checksum: true, ..Config::default() };
		let opts =
			TransferOptions { checksum_mode: ChecksumMode::BOTH, ..TransferOptions::default() };
		let mode = opts.effective_checksum_mode(&config);
		assert!(!mode.source);
		assert!(mode.target);
	}

	#[test]
	fn default_algorithm_resolution() {
		let config = Config::default();
		let opts = TransferOptions::default();
		assert_eq!(opts.algorithm(&config), "ADLER32");
		let opts =
			TransferOptions { checksum_algorithm: Some("MD5".into()), ..TransferOptions::default() };
		assert_eq!(opts.algorithm(&config), "MD5");
	}
}

// vim: ts=4
