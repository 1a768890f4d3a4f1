//! The management interface.
//!
//! A loopback-only TCP listener with a small pool of pre-allocated session
//! slots. Sessions authenticate against a password hash, then speak a
//! line-oriented command protocol that inspects runtime state and mutates
//! the pending configuration. `restart` raises the restart signal; the
//! active role loop observes it and returns to the FSM for the swap.

pub mod commands;
pub mod ratelimit;
pub mod session;

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::cfgmgr::ConfigManager;
use crate::errors::{Error, Result};
use crate::fsm::RuntimeStatus;
use crate::net::{self, Stream};
use crate::shutdown::{RestartSignal, ShutdownToken};
use crate::tls;
use self::ratelimit::RateLimiter;

/// Pre-allocated session slots.
pub const MAX_MGMT_SESSIONS: usize = 4;
/// Fixed per-session read and write buffer size.
pub const MGMT_BUFFER_SIZE: usize = 1024;

/// Greeting sent before the password prompt.
pub const BANNER: &str = "XOE bridge management interface\n";
/// Sent to locked-out peers instead of a password prompt.
pub const LOCKOUT_BANNER: &str = "Too many failed attempts\n";

/// SHA-256 of the management password; comparisons are constant-time and the
/// plaintext is never stored.
pub struct PasswordHash([u8; 32]);

impl PasswordHash {
	pub fn new(password: &str) -> Self {
		Self(Sha256::digest(password.as_bytes()).into())
	}

	pub fn verify(&self, attempt: &[u8]) -> bool {
		let digest: [u8; 32] = Sha256::digest(attempt).into();
		digest.as_slice().ct_eq(self.0.as_slice()).into()
	}
}

pub struct ManagementServer {
	pub(crate) manager: Arc<ConfigManager>,
	pub(crate) restart: RestartSignal,
	pub(crate) shutdown: ShutdownToken,
	pub(crate) status: Arc<RuntimeStatus>,
	pub(crate) limiter: RateLimiter,
	pub(crate) password: PasswordHash,
	slots: [AtomicBool; MAX_MGMT_SESSIONS],
}

impl ManagementServer {
	fn acquire_slot(&self) -> Option<usize> {
		for (index, slot) in self.slots.iter().enumerate() {
			if slot
				.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				return Some(index);
			}
		}
		None
	}

	fn release_slot(&self, index: usize) {
		self.slots[index].store(false, Ordering::Release);
	}
}

/// A running management interface. Dropping the handle does not stop the
/// listener; request shutdown on the token and `join`.
pub struct Handle {
	pub addr: SocketAddr,
	listener: JoinHandle<()>,
}

impl Handle {
	pub fn join(self) {
		self.listener.join().ok();
	}
}

/// Binds 127.0.0.1 on the configured management port and spawns the listener
/// thread.
pub fn start(
	manager: Arc<ConfigManager>,
	restart: RestartSignal,
	shutdown: ShutdownToken,
	status: Arc<RuntimeStatus>,
) -> Result<Handle> {
	let config = manager.active();
	let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.mgmt_port))
		.map_err(|err| Error::Network(format!("management bind failed: {err}")))?;
	let addr = listener.local_addr()?;
	let tls_config = tls::server_config_for(&config)?;

	let server = Arc::new(ManagementServer {
		manager,
		restart,
		shutdown: shutdown.clone(),
		status,
		limiter: RateLimiter::new(),
		password: PasswordHash::new(&config.mgmt_password),
		slots: [const { AtomicBool::new(false) }; MAX_MGMT_SESSIONS],
	});

	let thread = thread::Builder::new()
		.name("mgmt-listener".to_string())
		.spawn(move || listen_loop(&listener, &server, tls_config.as_ref()))?;

	Ok(Handle {
		addr,
		listener: thread,
	})
}

fn listen_loop(
	listener: &TcpListener,
	server: &Arc<ManagementServer>,
	tls_config: Option<&Arc<rustls::ServerConfig>>,
) {
	while !server.shutdown.is_requested() {
		let accepted = match net::poll_accept(listener) {
			Ok(Some(accepted)) => accepted,
			Ok(None) => continue,
			Err(err) => {
				warn!("management accept failed: {err}");
				continue;
			}
		};
		let (socket, peer) = accepted;

		if server.limiter.is_locked(peer.ip()) {
			debug!("rejecting locked-out peer {peer}");
			reject(Stream::Plain(socket), LOCKOUT_BANNER);
			continue;
		}

		let stream = match tls_config {
			Some(tls_config) => match tls::wrap_server(tls_config, socket) {
				Ok(stream) => stream,
				Err(err) => {
					warn!("management TLS accept from {peer} failed: {err}");
					continue;
				}
			},
			None => Stream::Plain(socket),
		};

		let Some(slot) = server.acquire_slot() else {
			debug!("rejecting {peer}: management server full");
			reject(stream, "server full\n");
			continue;
		};

		info!("management session from {peer} (slot {slot})");
		let session_server = Arc::clone(server);
		let spawned = thread::Builder::new()
			.name(format!("mgmt-session-{slot}"))
			.spawn(move || {
				session::Session::new(&session_server, stream, peer).run();
				session_server.release_slot(slot);
				debug!("management session from {peer} closed");
			});
		if let Err(err) = spawned {
			warn!("cannot spawn management session: {err}");
			server.release_slot(slot);
		}
	}
}

fn reject(mut stream: Stream, message: &str) {
	net::write_all(&mut stream, message.as_bytes()).ok();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn password_hash_verifies_only_the_right_password() {
		let hash = PasswordHash::new("opensesame");
		assert!(hash.verify(b"opensesame"));
		assert!(!hash.verify(b"opensesame "));
		assert!(!hash.verify(b""));
	}
}
