//! Namespace primitives: stat, mkdir, delete, rename, chmod, directory
//! listing, remote checksum
//!
//! Thin blocking wrappers that tie one [`Operation`] to one transport
//! call. These are the building blocks the transfer prepare and close
//! phases are made of, and they are exported for direct use.

use std::time::Duration;

use crate::endpoint::Url;
use crate::error::{GridResult, Kind};
use crate::logging::*;
use crate::operation::Operation;
use crate::session::{DirEntry, Session, StatInfo};

/// Stat a remote path
pub fn stat(session: &mut Session, path: &str, timeout: Option<Duration>) -> GridResult<StatInfo> {
	trace!("stat {}", path);
	let op = Operation::new();
	op.start(session.aborter());
	session.transport_mut().begin_stat(path, op.completion())?;
	op.wait(timeout)
}

/// True when the remote path exists
pub fn exists(session: &mut Session, path: &str, timeout: Option<Duration>) -> GridResult<bool> {
	match stat(session, path, timeout) {
		Ok(_) => Ok(true),
		Err(e) if e.kind() == Kind::NotFound => Ok(false),
		Err(e) => Err(e),
	}
}

/// Create one remote directory
pub fn mkdir(session: &mut Session, path: &str, timeout: Option<Duration>) -> GridResult<()> {
	trace!("mkdir {}", path);
	let op = Operation::new();
	op.start(session.aborter());
	session.transport_mut().begin_mkdir(path, op.completion())?;
	op.wait(timeout)
}

/// Delete a remote file
pub fn delete(session: &mut Session, path: &str, timeout: Option<Duration>) -> GridResult<()> {
	trace!("delete {}", path);
	let op = Operation::new();
	op.start(session.aborter());
	session.transport_mut().begin_delete(path, op.completion())?;
	op.wait(timeout)
}

/// Rename a remote path; both paths live on the session's endpoint
pub fn rename(
	session: &mut Session,
	from: &str,
	to: &str,
	timeout: Option<Duration>,
) -> GridResult<()> {
	trace!("rename {} => {}", from, to);
	let op = Operation::new();
	op.start(session.aborter());
	session.transport_mut().begin_rename(from, to, op.completion())?;
	op.wait(timeout)
}

/// Change the permission bits of a remote path
pub fn chmod(
	session: &mut Session,
	path: &str,
	mode: u32,
	timeout: Option<Duration>,
) -> GridResult<()> {
	trace!("chmod {:o} {}", mode, path);
	let op = Operation::new();
	op.start(session.aborter());
	session.transport_mut().begin_chmod(path, mode, op.completion())?;
	op.wait(timeout)
}

/// List the entries of a remote directory
pub fn list(
	session: &mut Session,
	path: &str,
	timeout: Option<Duration>,
) -> GridResult<Vec<DirEntry>> {
	trace!("list {}", path);
	let op = Operation::new();
	op.start(session.aborter());
	session.transport_mut().begin_list(path, op.completion())?;
	op.wait(timeout)
}

/// Ask the endpoint for the digest of a remote file
pub fn checksum(
	session: &mut Session,
	path: &str,
	algorithm: &str,
	timeout: Option<Duration>,
) -> GridResult<String> {
	trace!("checksum {} {}", algorithm, path);
	let op = Operation::new();
	op.start(session.aborter());
	session.transport_mut().begin_checksum(path, algorithm, op.completion())?;
	op.wait(timeout)
}

/// Make sure the parent directory of `url` exists, creating missing
/// components from the top down
///
/// Idempotent: a second caller finds the parent already present and does
/// nothing. A parent that exists but is not a directory is an error.
pub fn ensure_parent(session: &mut Session, url: &Url, timeout: Option<Duration>) -> GridResult<()> {
	let parent = match url.parent() {
		Some(p) => p,
		None => {
			return Err(crate::error::GridError::new(
				Kind::InvalidArgument,
				format!("cannot derive a parent directory from '{}'", url),
			))
		}
	};
	ensure_dir(session, &parent, timeout)
}

fn ensure_dir(session: &mut Session, dir: &Url, timeout: Option<Duration>) -> GridResult<()> {
	if dir.path() == "/" {
		return Ok(());
	}
	match stat(session, dir.path(), timeout) {
		Ok(info) if info.is_dir => return Ok(()),
		Ok(_) => {
			return Err(crate::error::GridError::new(
				Kind::NotADirectory,
				format!("'{}' exists but is not a directory", dir),
			))
		}
		Err(e) if e.kind() == Kind::NotFound => {}
		Err(e) => return Err(e),
	}
	if let Some(grandparent) = dir.parent() {
		ensure_dir(session, &grandparent, timeout)?;
	}
	debug!("creating directory {}", dir.path());
	match mkdir(session, dir.path(), timeout) {
		Ok(()) => Ok(()),
		// Lost the race with a sibling task or another client
		Err(e) if e.kind() == Kind::AlreadyExists => Ok(()),
		Err(e) => Err(e),
	}
}

// vim: ts=4
