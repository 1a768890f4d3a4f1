//! One management session: authentication, then the command loop.
//!
//! Sessions own two fixed buffers and never allocate per connection beyond
//! what command tokenization needs. Password bytes are zeroed after every
//! attempt.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, warn};
use zeroize::Zeroize;

use super::commands::{self, Flow};
use super::{ManagementServer, BANNER, MGMT_BUFFER_SIZE};
use crate::errors::{Error, Result};
use crate::net::{self, Stream};

/// Password attempts allowed per connection.
const AUTH_ATTEMPTS: u32 = 3;

pub struct Session<'a> {
	pub(super) server: &'a ManagementServer,
	stream: Stream,
	peer: SocketAddr,
	authenticated: bool,
	rx: [u8; MGMT_BUFFER_SIZE],
	rx_len: usize,
	line: [u8; MGMT_BUFFER_SIZE],
	tx: [u8; MGMT_BUFFER_SIZE],
}

impl<'a> Session<'a> {
	pub fn new(server: &'a ManagementServer, stream: Stream, peer: SocketAddr) -> Self {
		Self {
			server,
			stream,
			peer,
			authenticated: false,
			rx: [0; MGMT_BUFFER_SIZE],
			rx_len: 0,
			line: [0; MGMT_BUFFER_SIZE],
			tx: [0; MGMT_BUFFER_SIZE],
		}
	}

	pub fn run(mut self) {
		if let Err(err) = self.serve() {
			if !matches!(err, Error::Network(_)) {
				debug!("management session error: {err}");
			}
		}
	}

	fn serve(&mut self) -> Result<()> {
		self.stream
			.set_read_timeout(Some(Duration::from_millis(1000)))?;
		self.send_str(BANNER)?;

		if !self.authenticate()? {
			return Ok(());
		}

		loop {
			self.send_str("xoe> ")?;
			let Some(len) = self.read_line()? else {
				return Ok(());
			};
			let line = String::from_utf8_lossy(&self.line[..len]).into_owned();
			self.line[..len].zeroize();

			match commands::dispatch(self, line.trim()) {
				Ok(Flow::Continue) => {}
				Ok(Flow::Quit) => return Ok(()),
				Err(err) => {
					// Command handlers only fail on the socket; give up.
					debug!("management command i/o failed: {err}");
					return Err(err);
				}
			}
		}
	}

	/// The three-attempt prompt/verify loop. Every failed attempt counts
	/// against the peer's rate-limit entry.
	fn authenticate(&mut self) -> Result<bool> {
		for _ in 0..AUTH_ATTEMPTS {
			self.send_str("Password: ")?;
			let Some(len) = self.read_line()? else {
				return Ok(false);
			};

			let ok = self.server.password.verify(&self.line[..len]);
			self.line[..len].zeroize();

			if ok {
				self.server.limiter.clear(self.peer.ip());
				self.authenticated = true;
				self.send_str("Authentication successful\n\n")?;
				return Ok(true);
			}

			warn!("failed management authentication from {}", self.peer);
			self.server.limiter.record_failure(self.peer.ip());
			self.send_str("Authentication failed\n")?;
		}

		Ok(false)
	}

	/// Reads one LF-terminated line into the line buffer, stripping CR and
	/// LF. Returns `None` when the peer goes away or shutdown is requested.
	fn read_line(&mut self) -> Result<Option<usize>> {
		loop {
			if let Some(pos) = self.rx[..self.rx_len].iter().position(|&b| b == b'\n') {
				let mut len = pos;
				while len > 0 && self.rx[len - 1] == b'\r' {
					len -= 1;
				}
				self.line[..len].copy_from_slice(&self.rx[..len]);
				self.rx.copy_within(pos + 1..self.rx_len, 0);
				let consumed = pos + 1;
				self.rx[self.rx_len - consumed..self.rx_len].zeroize();
				self.rx_len -= consumed;
				return Ok(Some(len));
			}

			if self.rx_len == self.rx.len() {
				self.rx.zeroize();
				self.rx_len = 0;
				self.send_str("line too long\n")?;
			}

			let rx_len = self.rx_len;
			match self.stream.read(&mut self.rx[rx_len..]) {
				Ok(0) => return Ok(None),
				Ok(n) => self.rx_len += n,
				Err(err) if net::is_timeout(&err) => {
					if self.server.shutdown.is_requested() {
						return Ok(None);
					}
				}
				Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
				Err(err) => return Err(Error::Io(err)),
			}
		}
	}

	pub(super) fn is_authenticated(&self) -> bool {
		self.authenticated
	}

	pub(super) fn send_str(&mut self, text: &str) -> Result<()> {
		net::write_all(&mut self.stream, text.as_bytes())
	}

	/// Formats into the fixed write buffer and sends the result. Output that
	/// does not fit is truncated at the buffer boundary.
	pub(super) fn send_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<()> {
		let mut cursor = io::Cursor::new(&mut self.tx[..]);
		cursor.write_fmt(args).ok();
		let len = cursor.position() as usize;

		let mut written = 0;
		while written < len {
			let n = match self.stream.write(&self.tx[written..len]) {
				Ok(0) => return Err(Error::Network("peer closed the connection".to_string())),
				Ok(n) => n,
				Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
				Err(err) => return Err(Error::Io(err)),
			};
			written += n;
		}
		self.stream.flush()?;
		Ok(())
	}
}

macro_rules! sendln {
	($session:expr, $($arg:tt)*) => {
		$session.send_fmt(format_args!("{}\n", format_args!($($arg)*)))
	};
}
pub(super) use sendln;
