//! Endpoint and URL handling for grid storage services
//!
//! An [`Endpoint`] identifies one storage service instance (scheme, host,
//! port); a [`Url`] adds the path. The endpoint host is the key used by the
//! session pool.

use std::fmt;

use crate::error::{GridError, GridResult, Kind};

/// Default control port for gsiftp/gridftp endpoints
pub const DEFAULT_GRIDFTP_PORT: u16 = 2811;

/// Network address plus scheme identifying one storage service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
	scheme: String,
	host: String,
	port: u16,
}

impl Endpoint {
	pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
		Endpoint { scheme: scheme.into(), host: host.into(), port }
	}

	pub fn scheme(&self) -> &str {
		&self.scheme
	}

	pub fn host(&self) -> &str {
		&self.host
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	/// "host:port" rendering used in transfer lifecycle events
	pub fn host_and_port(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}
}

impl fmt::Display for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
	}
}

/// A full storage URL: endpoint plus path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
	endpoint: Endpoint,
	path: String,
}

impl Url {
	/// Parse a URL of the form `scheme://host[:port]/path`
	pub fn parse(url: &str) -> GridResult<Url> {
		let (scheme, rest) = url
			.split_once("://")
			.ok_or_else(|| GridError::new(Kind::InvalidArgument, format!("missing scheme in '{}'", url)))?;
		if scheme.is_empty() {
			return Err(GridError::new(Kind::InvalidArgument, format!("empty scheme in '{}'", url)));
		}
		let (authority, path) = match rest.find('/') {
			Some(idx) => (&rest[..idx], &rest[idx..]),
			None => (rest, "/"),
		};
		// Bracketed IPv6 literals carry the port after the closing bracket
		let (host, port) = if let Some(end) = authority.strip_prefix('[').and_then(|a| a.find(']')) {
			let host = &authority[..end + 2];
			match authority[end + 2..].strip_prefix(':') {
				Some(p) => (host, Some(p)),
				None => (host, None),
			}
		} else {
			match authority.rsplit_once(':') {
				Some((h, p)) => (h, Some(p)),
				None => (authority, None),
			}
		};
		if host.is_empty() {
			return Err(GridError::new(Kind::InvalidArgument, format!("missing host in '{}'", url)));
		}
		let port = match port {
			Some(p) => p
				.parse::<u16>()
				.map_err(|_| GridError::new(Kind::InvalidArgument, format!("invalid port in '{}'", url)))?,
			None => default_port(scheme),
		};
		Ok(Url { endpoint: Endpoint::new(scheme, host, port), path: path.to_string() })
	}

	pub fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}

	pub fn host(&self) -> &str {
		self.endpoint.host()
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	/// URL of the parent directory, or None at the root
	///
	/// Trailing slashes are stripped first, so `/a/b/` and `/a/b` both
	/// resolve to `/a`.
	pub fn parent(&self) -> Option<Url> {
		let trimmed = self.path.trim_end_matches('/');
		if trimmed.is_empty() {
			return None;
		}
		let cut = trimmed.rfind('/')?;
		let parent_path = if cut == 0 { "/" } else { &trimmed[..cut] };
		if parent_path == trimmed {
			return None;
		}
		Some(Url { endpoint: self.endpoint.clone(), path: parent_path.to_string() })
	}
}

impl fmt::Display for Url {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}://{}:{}{}", self.endpoint.scheme(), self.endpoint.host(), self.endpoint.port(), self.path)
	}
}

fn default_port(scheme: &str) -> u16 {
	match scheme {
		"ftp" => 21,
		_ => DEFAULT_GRIDFTP_PORT,
	}
}


// vim: ts=4
