//! TCP plumbing shared by every role.
//!
//! [`Stream`] abstracts over a plain socket and a TLS session so that role
//! code never matches on the encryption mode. [`SharedStream`] serializes a
//! stream behind a mutex for the pipeline roles whose two tasks share one
//! connection; the underlying socket keeps a short read timeout so readers
//! release the lock and writers are never starved.

pub mod client;
pub mod server;

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use rustls::{ClientConnection, ServerConnection, StreamOwned};

use crate::config::Configuration;
use crate::errors::{Error, Result};
use crate::tls;

/// Wake interval for accept loops and shared-stream readers.
pub const POLL_INTERVAL_MS: u64 = 1000;

/// One bridge connection, plain or encrypted.
pub enum Stream {
	Plain(TcpStream),
	TlsClient(StreamOwned<ClientConnection, TcpStream>),
	TlsServer(StreamOwned<ServerConnection, TcpStream>),
}

impl Stream {
	pub fn socket(&self) -> &TcpStream {
		match self {
			Stream::Plain(sock) => sock,
			Stream::TlsClient(stream) => stream.get_ref(),
			Stream::TlsServer(stream) => stream.get_ref(),
		}
	}

	pub fn peer_addr(&self) -> io::Result<SocketAddr> {
		self.socket().peer_addr()
	}

	pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
		self.socket().set_read_timeout(timeout)
	}

	/// Shuts the underlying socket down in both directions, unblocking any
	/// task parked in a read.
	pub fn shutdown(&self) {
		self.socket().shutdown(Shutdown::Both).ok();
	}
}

impl Read for Stream {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		match self {
			Stream::Plain(sock) => sock.read(buf),
			Stream::TlsClient(stream) => stream.read(buf),
			Stream::TlsServer(stream) => stream.read(buf),
		}
	}
}

impl Write for Stream {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self {
			Stream::Plain(sock) => sock.write(buf),
			Stream::TlsClient(stream) => stream.write(buf),
			Stream::TlsServer(stream) => stream.write(buf),
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self {
			Stream::Plain(sock) => sock.flush(),
			Stream::TlsClient(stream) => stream.flush(),
			Stream::TlsServer(stream) => stream.flush(),
		}
	}
}

/// True for the error kinds a timed-out socket read produces.
pub fn is_timeout(err: &io::Error) -> bool {
	matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// A stream shared by cooperating tasks. Reads poll with a short socket
/// timeout so the lock is released between attempts.
pub struct SharedStream {
	stream: Mutex<Stream>,
	socket: TcpStream,
	peer: Option<SocketAddr>,
}

impl SharedStream {
	pub fn new(stream: Stream) -> io::Result<Self> {
		let socket = stream.socket().try_clone()?;
		let peer = stream.peer_addr().ok();
		stream.set_read_timeout(Some(Duration::from_millis(100)))?;
		Ok(Self {
			stream: Mutex::new(stream),
			socket,
			peer,
		})
	}

	pub fn peer_addr(&self) -> Option<SocketAddr> {
		self.peer
	}

	/// One read attempt. `Ok(0)` means the peer closed; timeouts surface as
	/// errors for which [`is_timeout`] is true. `EINTR` is retried.
	pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
		let mut stream = self.stream.lock().unwrap();
		loop {
			match stream.read(buf) {
				Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
				other => return other,
			}
		}
	}

	/// Writes the whole buffer; short writes and `EINTR` are absorbed.
	pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
		let mut stream = self.stream.lock().unwrap();
		stream.write_all(buf)?;
		stream.flush()
	}

	pub fn shutdown(&self) {
		self.socket.shutdown(Shutdown::Both).ok();
	}
}

/// Reads exactly `buf.len()` bytes. A cleanly closed peer surfaces as
/// [`Error::Network`] so sessions can distinguish orderly disconnects from
/// wire corruption.
pub fn read_exact(stream: &mut Stream, buf: &mut [u8]) -> Result<()> {
	stream.read_exact(buf).map_err(|err| {
		if err.kind() == io::ErrorKind::UnexpectedEof {
			Error::Network("peer closed the connection".to_string())
		} else {
			Error::Io(err)
		}
	})
}

/// Writes the whole buffer, mapping failures into the crate error space.
pub fn write_all(stream: &mut Stream, buf: &[u8]) -> Result<()> {
	stream.write_all(buf)?;
	stream.flush()?;
	Ok(())
}

/// Waits up to `timeout_ms` for `fd` to become readable. Returns false on
/// timeout or `EINTR`, so callers re-check their shutdown conditions.
pub fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
	let mut pollfd = libc::pollfd {
		fd,
		events: libc::POLLIN,
		revents: 0,
	};

	// SAFETY: pollfd points to a single valid descriptor record.
	let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
	if rc < 0 {
		let err = io::Error::last_os_error();
		if err.kind() == io::ErrorKind::Interrupted {
			return Ok(false);
		}
		return Err(err);
	}

	Ok(rc > 0)
}

/// Binds the configured listen endpoint.
pub fn listen(config: &Configuration) -> Result<TcpListener> {
	let addr = config.listen_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
	let listener = TcpListener::bind((addr, config.listen_port))
		.map_err(|err| Error::Network(format!("cannot listen on {addr}:{}: {err}", config.listen_port)))?;
	Ok(listener)
}

/// Connects to the configured target, upgrading to TLS when enabled.
pub fn connect(config: &Configuration) -> Result<Stream> {
	let host = config
		.connect_host
		.as_deref()
		.ok_or_else(|| Error::InvalidArgument("no connect target".to_string()))?;
	let port = config.connect_port;

	let socket = TcpStream::connect((host, port))
		.map_err(|err| Error::Network(format!("cannot connect to {host}:{port}: {err}")))?;
	socket.set_nodelay(true).ok();
	debug!("connected to {host}:{port}");

	if config.encryption.is_enabled() {
		let tls_config = tls::client_config(config.encryption)?;
		tls::wrap_client(&tls_config, host, socket)
	} else {
		Ok(Stream::Plain(socket))
	}
}

/// Accept helper that polls `listener` once with the standard wake interval.
/// Returns `None` when nothing arrived before the timeout.
pub fn poll_accept(listener: &TcpListener) -> Result<Option<(TcpStream, SocketAddr)>> {
	if !wait_readable(listener.as_raw_fd(), POLL_INTERVAL_MS as i32)? {
		return Ok(None);
	}

	match listener.accept() {
		Ok((socket, peer)) => {
			socket.set_nodelay(true).ok();
			Ok(Some((socket, peer)))
		}
		// The connection may have vanished between poll and accept.
		Err(err) if is_timeout(&err) || err.kind() == io::ErrorKind::ConnectionAborted => Ok(None),
		Err(err) => Err(Error::Io(err)),
	}
}
