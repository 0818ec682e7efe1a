//! Control channel codec
//!
//! Replies are a three-digit code plus text, possibly spanning multiple
//! lines ("123-..." until "123 ..."). On top of the raw replies sit the
//! small text formats this module parses: passive-mode addresses, MLST
//! facts and periodic performance markers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{GridError, GridResult, Kind};
use crate::session::{DirEntry, StatInfo};

/// One complete control channel reply
#[derive(Debug)]
pub(crate) struct Reply {
	pub code: u16,
	pub text: String,
}

impl Reply {
	/// 1xx: more replies follow for the same command
	pub fn is_preliminary(&self) -> bool {
		(100..200).contains(&self.code)
	}

	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.code)
	}

	/// 3xx: the command sequence continues (e.g. USER before PASS)
	pub fn is_intermediate(&self) -> bool {
		(300..400).contains(&self.code)
	}

	pub fn into_error(self) -> GridError {
		GridError::from_reply(self.code, &self.text)
	}
}

/// Read one complete reply, folding multi-line replies into one text block
pub(crate) async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> GridResult<Reply> {
	let mut line = String::new();
	if reader.read_line(&mut line).await? == 0 {
		return Err(GridError::new(Kind::ConnectFailure, "control connection closed"));
	}
	let first = line.trim_end_matches(['\r', '\n']);
	let malformed = || GridError::new(Kind::Protocol, format!("malformed reply '{}'", first));
	if first.len() < 4 {
		return Err(malformed());
	}
	// Checked slicing throughout: a broken server may well put a multibyte
	// character where the code belongs
	let code =
		first.get(..3).and_then(|c| c.parse::<u16>().ok()).ok_or_else(malformed)?;
	let mut text = first.get(4..).ok_or_else(malformed)?.to_string();
	if first.as_bytes()[3] == b'-' {
		let terminator = format!("{:03} ", code);
		loop {
			let mut next = String::new();
			if reader.read_line(&mut next).await? == 0 {
				return Err(GridError::new(
					Kind::ConnectFailure,
					"control connection closed inside a multi-line reply",
				));
			}
			let next = next.trim_end_matches(['\r', '\n']);
			text.push('\n');
			if let Some(last) = next.strip_prefix(&terminator) {
				text.push_str(last);
				break;
			}
			text.push_str(next);
		}
	}
	Ok(Reply { code, text })
}

/// Parse a PASV reply: `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
pub(crate) fn parse_pasv(text: &str) -> GridResult<SocketAddr> {
	let inner = text
		.find('(')
		.and_then(|open| text[open + 1..].find(')').map(|close| &text[open + 1..open + 1 + close]))
		.ok_or_else(|| GridError::new(Kind::Protocol, format!("unparsable PASV reply '{}'", text)))?;
	let fields = inner
		.split(',')
		.map(|f| f.trim().parse::<u8>())
		.collect::<Result<Vec<u8>, _>>()
		.map_err(|_| GridError::new(Kind::Protocol, format!("unparsable PASV reply '{}'", text)))?;
	if fields.len() != 6 {
		return Err(GridError::new(Kind::Protocol, format!("unparsable PASV reply '{}'", text)));
	}
	let ip = Ipv4Addr::new(fields[0], fields[1], fields[2], fields[3]);
	let port = u16::from(fields[4]) << 8 | u16::from(fields[5]);
	Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Parse an EPSV reply: `229 Entering Extended Passive Mode (|||port|)`
///
/// EPSV only carries the port; the host is the control connection's peer.
pub(crate) fn parse_epsv(text: &str) -> GridResult<u16> {
	let inner = text
		.find('(')
		.and_then(|open| text[open + 1..].find(')').map(|close| &text[open + 1..open + 1 + close]))
		.ok_or_else(|| GridError::new(Kind::Protocol, format!("unparsable EPSV reply '{}'", text)))?;
	let mut parts = inner.split('|').filter(|p| !p.is_empty());
	parts
		.next()
		.and_then(|p| p.trim().parse::<u16>().ok())
		.ok_or_else(|| GridError::new(Kind::Protocol, format!("unparsable EPSV reply '{}'", text)))
}

/// Format a PORT argument: `h1,h2,h3,h4,p1,p2`
pub(crate) fn format_port(addr: &SocketAddr) -> GridResult<String> {
	match addr.ip() {
		IpAddr::V4(ip) => {
			let o = ip.octets();
			Ok(format!("{},{},{},{},{},{}", o[0], o[1], o[2], o[3], addr.port() >> 8, addr.port() & 0xff))
		}
		IpAddr::V6(_) => Err(GridError::new(
			Kind::InvalidArgument,
			"PORT cannot carry an IPv6 address, use EPRT",
		)),
	}
}

/// Format an EPRT argument: `|proto|host|port|`
pub(crate) fn format_eprt(addr: &SocketAddr) -> String {
	let proto = if addr.is_ipv4() { 1 } else { 2 };
	format!("|{}|{}|{}|", proto, addr.ip(), addr.port())
}

/// Parse the fact line of an MLST reply into a [`StatInfo`]
///
/// Expected shape: `Type=file;Size=1234;Modify=20240801120000;UNIX.mode=0644; /path`
pub(crate) fn parse_mlst(text: &str) -> GridResult<StatInfo> {
	let facts_line = text
		.lines()
		.map(str::trim)
		.find(|l| l.contains('=') && l.contains(';'))
		.ok_or_else(|| GridError::new(Kind::Protocol, format!("no facts in MLST reply '{}'", text)))?;
	let facts = match facts_line.rfind("; ") {
		Some(idx) => &facts_line[..idx + 1],
		None => facts_line,
	};

	let mut info = StatInfo { size: 0, is_dir: false, mode: 0, mtime: None };
	for fact in facts.split(';').filter(|f| !f.is_empty()) {
		let (key, value) = match fact.split_once('=') {
			Some(kv) => kv,
			None => continue,
		};
		if key.eq_ignore_ascii_case("type") {
			info.is_dir = value.eq_ignore_ascii_case("dir")
				|| value.eq_ignore_ascii_case("cdir")
				|| value.eq_ignore_ascii_case("pdir");
		} else if key.eq_ignore_ascii_case("size") {
			info.size = value.parse().unwrap_or(0);
		} else if key.eq_ignore_ascii_case("modify") {
			info.mtime = parse_timestamp(value);
		} else if key.eq_ignore_ascii_case("unix.mode") {
			info.mode = u32::from_str_radix(value, 8).unwrap_or(0);
		}
	}
	Ok(info)
}

/// Parse the data-channel payload of an MLSD listing
///
/// One entry per line, `facts; name`. The `cdir`/`pdir` self-references
/// are dropped; lines that do not parse as facts are skipped.
pub(crate) fn parse_mlsd(text: &str) -> Vec<DirEntry> {
	let mut entries = Vec::new();
	for line in text.lines() {
		let line = line.trim_end_matches('\r');
		if !line.contains('=') || !line.contains(';') {
			continue;
		}
		let name = match line.rfind("; ") {
			Some(idx) => line[idx + 2..].trim(),
			None => continue,
		};
		if name.is_empty() {
			continue;
		}
		let lower = line.to_ascii_lowercase();
		if lower.contains("type=cdir") || lower.contains("type=pdir") {
			continue;
		}
		if let Ok(info) = parse_mlst(line) {
			entries.push(DirEntry { name: name.to_string(), info });
		}
	}
	entries
}

/// Parse a `Modify=YYYYMMDDHHMMSS` fact value
fn parse_timestamp(value: &str) -> Option<SystemTime> {
	if value.len() < 14 || !value.is_char_boundary(14) {
		return None;
	}
	let num = |r: std::ops::Range<usize>| value[r].parse::<i64>().ok();
	let (year, month, day) = (num(0..4)?, num(4..6)?, num(6..8)?);
	let (hour, min, sec) = (num(8..10)?, num(10..12)?, num(12..14)?);
	if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
		return None;
	}
	let secs = days_from_civil(year, month, day) * 86400 + hour * 3600 + min * 60 + sec;
	if secs < 0 {
		return None;
	}
	Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

// Howard Hinnant's civil-days algorithm
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
	let y = if m <= 2 { y - 1 } else { y };
	let era = if y >= 0 { y } else { y - 399 } / 400;
	let yoe = y - era * 400;
	let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
	let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
	era * 146097 + doe - 719468
}

/// Extract the running byte count from a `112 Perf Marker` reply
pub(crate) fn parse_perf_bytes(text: &str) -> Option<u64> {
	for line in text.lines() {
		let line = line.trim();
		if let Some(rest) = line.strip_prefix("Stripe Bytes Transferred:") {
			return rest.trim().parse().ok();
		}
	}
	None
}


// vim: ts=4
