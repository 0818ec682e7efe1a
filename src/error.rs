//! Error types for grid storage operations
//!
//! The control channel of a GridFTP-style endpoint reports failures as a
//! numeric reply class plus free text. The numeric class distinguishes
//! "transient" from "permanent", nothing finer, so the mapping from reply
//! text to an error kind is keyword based and explicitly best-effort.

use std::error::Error;
use std::fmt;
use std::io;

/// Which checksum comparison failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumSide {
	/// Source digest does not match the user-declared digest
	Source,
	/// Destination digest does not match the source digest
	Destination,
	/// Destination digest does not match the user-declared digest
	UserDeclared,
}

impl fmt::Display for ChecksumSide {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ChecksumSide::Source => write!(f, "source vs user-declared"),
			ChecksumSide::Destination => write!(f, "destination vs source"),
			ChecksumSide::UserDeclared => write!(f, "destination vs user-declared"),
		}
	}
}

/// Coarse error classification for grid operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	/// Could not establish the control connection
	ConnectFailure,
	/// Endpoint rejected the credential
	AuthFailure,
	/// Path does not exist
	NotFound,
	/// Endpoint denied access
	AccessDenied,
	/// Destination already exists and replace was not requested
	AlreadyExists,
	/// A path component that must be a directory is not one
	NotADirectory,
	/// The path is a directory where a file was expected
	IsADirectory,
	/// Endpoint ran out of space or quota
	OutOfSpace,
	/// Digest comparison failed
	ChecksumMismatch(ChecksumSide),
	/// Destination size differs from the source size
	SizeMismatch,
	/// Operation was canceled before completion
	Canceled,
	/// Operation deadline elapsed
	TimedOut,
	/// Unclassified protocol failure
	Protocol,
	/// Caller passed invalid parameters
	InvalidArgument,
}

/// Error type for all grid operations
///
/// Carries the coarse [`Kind`], the human-readable message and, when the
/// failure originated in a wire reply, the numeric reply code.
#[derive(Debug, Clone)]
pub struct GridError {
	kind: Kind,
	message: String,
	mapped_code: Option<u16>,
}

pub type GridResult<T> = Result<T, GridError>;

impl GridError {
	pub fn new(kind: Kind, message: impl Into<String>) -> Self {
		GridError { kind, message: message.into(), mapped_code: None }
	}

	/// Attach the wire reply code that produced this error
	pub fn with_code(mut self, code: u16) -> Self {
		self.mapped_code = Some(code);
		self
	}

	/// Classify a free-text failure message from the endpoint
	///
	/// Keyword matching mirrors what servers in the wild actually print;
	/// fragments are chosen so that both capitalizations match (e.g.
	/// "o such file" catches "No such file" and "no such file").
	pub fn from_message(message: impl Into<String>) -> Self {
		let message = message.into();
		let kind = kind_from_message(&message);
		GridError { kind, message, mapped_code: None }
	}

	/// Classify a wire reply (numeric code plus text)
	pub fn from_reply(code: u16, text: &str) -> Self {
		let mut kind = kind_from_message(text);
		// The reply class prefilters the heuristic: a 530 is an
		// authentication failure whatever the prose says.
		if kind == Kind::Protocol {
			kind = match code {
				530 | 535 => Kind::AuthFailure,
				550 => Kind::NotFound,
				452 | 552 => Kind::OutOfSpace,
				_ => Kind::Protocol,
			};
		}
		GridError { kind, message: normalize(text), mapped_code: Some(code) }
	}

	pub fn kind(&self) -> Kind {
		self.kind
	}

	pub fn message(&self) -> &str {
		&self.message
	}

	/// Wire reply code, when the failure came from the endpoint
	pub fn mapped_code(&self) -> Option<u16> {
		self.mapped_code
	}

	/// True when the endpoint refused the UDT network stack
	///
	/// This specific failure is the only one that triggers a retry of a
	/// transfer with UDT disabled.
	pub fn is_udt_rejection(&self) -> bool {
		self.message.contains("udt driver not whitelisted")
	}

	/// Append a cleanup failure to this error without replacing it
	///
	/// Rollback failures during error recovery are reported alongside the
	/// original error, never instead of it.
	pub fn with_cleanup_failure(mut self, cleanup: &GridError) -> Self {
		self.message.push_str("; cleanup also failed: ");
		self.message.push_str(cleanup.message());
		self
	}
}

impl fmt::Display for GridError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.kind {
			Kind::ConnectFailure => write!(f, "Connection failed: {}", self.message),
			Kind::AuthFailure => write!(f, "Authentication failed: {}", self.message),
			Kind::NotFound => write!(f, "Not found: {}", self.message),
			Kind::AccessDenied => write!(f, "Access denied: {}", self.message),
			Kind::AlreadyExists => write!(f, "Already exists: {}", self.message),
			Kind::NotADirectory => write!(f, "Not a directory: {}", self.message),
			Kind::IsADirectory => write!(f, "Is a directory: {}", self.message),
			Kind::OutOfSpace => write!(f, "Out of space: {}", self.message),
			Kind::ChecksumMismatch(side) => {
				write!(f, "Checksum mismatch ({}): {}", side, self.message)
			}
			Kind::SizeMismatch => write!(f, "Size mismatch: {}", self.message),
			Kind::Canceled => write!(f, "Canceled: {}", self.message),
			Kind::TimedOut => write!(f, "Timed out: {}", self.message),
			Kind::Protocol => write!(f, "Protocol error: {}", self.message),
			Kind::InvalidArgument => write!(f, "Invalid argument: {}", self.message),
		}
	}
}

impl Error for GridError {}

impl From<io::Error> for GridError {
	fn from(e: io::Error) -> Self {
		let kind = match e.kind() {
			io::ErrorKind::NotFound => Kind::NotFound,
			io::ErrorKind::PermissionDenied => Kind::AccessDenied,
			io::ErrorKind::AlreadyExists => Kind::AlreadyExists,
			io::ErrorKind::TimedOut => Kind::TimedOut,
			io::ErrorKind::ConnectionRefused
			| io::ErrorKind::ConnectionReset
			| io::ErrorKind::ConnectionAborted => Kind::ConnectFailure,
			_ => Kind::Protocol,
		};
		GridError { kind, message: e.to_string(), mapped_code: None }
	}
}

/// Collapse carriage returns and newlines so multi-line server prose
/// logs as a single line
fn normalize(text: &str) -> String {
	text.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }).collect::<String>().trim().to_string()
}

fn kind_from_message(message: &str) -> Kind {
	if message.contains("o such file") || message.contains("not found") || message.contains("error 3011") {
		Kind::NotFound
	} else if message.contains("ermission denied")
		|| message.contains("credential")
		|| message.contains("Login incorrect")
		|| message.contains("Could not get virtual id")
	{
		Kind::AccessDenied
	} else if message.contains("exists") || message.contains("error 3006") {
		Kind::AlreadyExists
	} else if message.contains("ot a direct") {
		Kind::NotADirectory
	} else if message.contains("s a direct") {
		Kind::IsADirectory
	} else if message.contains("o space left") || message.contains("uota") {
		Kind::OutOfSpace
	} else if message.contains("aborted") || message.contains("anceled") {
		Kind::Canceled
	} else {
		Kind::Protocol
	}
}

/// Compare two digests the way endpoints print them: case-insensitive,
/// ignoring leading zeros
pub fn compare_checksums(a: &str, b: &str) -> bool {
	let a = a.trim_start_matches('0');
	let b = b.trim_start_matches('0');
	a.eq_ignore_ascii_case(b)
}


// vim: ts=4
