//! The TCP accept server role.
//!
//! A fixed pool of client slots, one detached worker per accepted client.
//! Bytes read from one client are relayed to every other connected client,
//! so a serial bridge and a standard client on the same server form an
//! end-to-end tunnel. On shutdown the listener closes first, then every
//! client socket, then the loop waits up to five seconds for workers to
//! clear their in-use flags.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::Configuration;
use crate::errors::Result;
use crate::fsm::{RoleExit, RuntimeStatus};
use crate::net::{self, SharedStream, Stream};
use crate::shutdown::{RestartSignal, ShutdownToken};
use crate::tls;

/// Compile-time bound on concurrent bridge clients.
pub const MAX_CLIENTS: usize = 16;

/// How long `stop` waits for per-client workers to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Slot {
	stream: Option<Arc<SharedStream>>,
	peer: Option<SocketAddr>,
}

struct Pool {
	slots: Mutex<Vec<Slot>>,
	in_use: [AtomicBool; MAX_CLIENTS],
}

impl Pool {
	fn new() -> Self {
		Self {
			slots: Mutex::new((0..MAX_CLIENTS).map(|_| Slot::default()).collect()),
			in_use: [const { AtomicBool::new(false) }; MAX_CLIENTS],
		}
	}

	/// Claims a free slot, or returns `None` when the pool is full.
	fn acquire(&self, stream: Arc<SharedStream>, peer: SocketAddr) -> Option<usize> {
		let mut slots = self.slots.lock().unwrap();
		for (index, slot) in slots.iter_mut().enumerate() {
			if !self.in_use[index].load(Ordering::Acquire) {
				self.in_use[index].store(true, Ordering::Release);
				slot.stream = Some(stream);
				slot.peer = Some(peer);
				return Some(index);
			}
		}
		None
	}

	fn release(&self, index: usize) {
		let mut slots = self.slots.lock().unwrap();
		slots[index] = Slot::default();
		self.in_use[index].store(false, Ordering::Release);
	}

	/// Relays `data` to every connected client except the sender.
	fn broadcast_from(&self, from: usize, data: &[u8]) {
		let targets: Vec<(usize, Arc<SharedStream>)> = {
			let slots = self.slots.lock().unwrap();
			slots
				.iter()
				.enumerate()
				.filter(|(index, slot)| *index != from && slot.stream.is_some())
				.map(|(index, slot)| (index, Arc::clone(slot.stream.as_ref().unwrap())))
				.collect()
		};

		for (index, stream) in targets {
			if let Err(err) = stream.write_all(data) {
				debug!("relay to slot {index} failed: {err}");
				stream.shutdown();
			}
		}
	}

	fn disconnect_all(&self) {
		let slots = self.slots.lock().unwrap();
		for slot in slots.iter() {
			if let Some(stream) = &slot.stream {
				stream.shutdown();
			}
		}
	}

	fn active(&self) -> usize {
		self.in_use
			.iter()
			.filter(|flag| flag.load(Ordering::Acquire))
			.count()
	}

	fn snapshot(&self) -> Vec<(usize, SocketAddr)> {
		let slots = self.slots.lock().unwrap();
		slots
			.iter()
			.enumerate()
			.filter_map(|(index, slot)| slot.peer.map(|peer| (index, peer)))
			.collect()
	}
}

pub fn run(
	config: &Configuration,
	shutdown: &ShutdownToken,
	restart: &RestartSignal,
	status: &Arc<RuntimeStatus>,
) -> Result<RoleExit> {
	let listener = net::listen(config)?;
	let tls_config = tls::server_config_for(config)?;
	let pool = Arc::new(Pool::new());

	info!(
		"server listening on {}:{}{}",
		config
			.listen_addr
			.map(|a| a.to_string())
			.unwrap_or_else(|| "*".to_string()),
		config.listen_port,
		if tls_config.is_some() { " (TLS)" } else { "" }
	);

	let exit = loop {
		if shutdown.is_requested() {
			break RoleExit::Shutdown;
		}
		if restart.is_requested() {
			break RoleExit::Restart;
		}

		let (socket, peer) = match net::poll_accept(&listener) {
			Ok(Some(accepted)) => accepted,
			Ok(None) => continue,
			// Transient accept failures never stop the listener.
			Err(err) => {
				warn!("accept failed: {err}");
				continue;
			}
		};

		let stream = match &tls_config {
			Some(tls_config) => match tls::wrap_server(tls_config, socket) {
				Ok(stream) => stream,
				Err(err) => {
					warn!("TLS accept from {peer} failed: {err}");
					continue;
				}
			},
			None => Stream::Plain(socket),
		};

		let shared = match SharedStream::new(stream) {
			Ok(shared) => Arc::new(shared),
			Err(err) => {
				warn!("cannot set up client {peer}: {err}");
				continue;
			}
		};

		let Some(index) = pool.acquire(Arc::clone(&shared), peer) else {
			warn!("rejecting {peer}: all {MAX_CLIENTS} client slots in use");
			shared.shutdown();
			continue;
		};

		info!("client {peer} connected (slot {index})");
		status.set_clients(pool.snapshot());

		let pool = Arc::clone(&pool);
		let token = shutdown.clone();
		let status = Arc::clone(status);
		thread::spawn(move || {
			client_worker(&pool, index, &shared, &token);
			info!("client {peer} disconnected (slot {index})");
			pool.release(index);
			status.set_clients(pool.snapshot());
		});
	};

	// Graceful stop: close the listener, disconnect clients, then wait for
	// the workers to drain.
	drop(listener);
	pool.disconnect_all();
	let deadline = Instant::now() + DRAIN_TIMEOUT;
	while pool.active() > 0 && Instant::now() < deadline {
		thread::sleep(Duration::from_millis(100));
	}
	if pool.active() > 0 {
		warn!("{} client worker(s) still busy after drain window", pool.active());
	}
	status.set_clients(Vec::new());

	Ok(exit)
}

fn client_worker(pool: &Pool, index: usize, stream: &SharedStream, shutdown: &ShutdownToken) {
	let mut buf = [0u8; 4096];

	loop {
		match stream.read(&mut buf) {
			Ok(0) => return,
			Ok(n) => pool.broadcast_from(index, &buf[..n]),
			Err(err) if net::is_timeout(&err) => {
				if shutdown.is_requested() {
					return;
				}
			}
			Err(err) => {
				debug!("client slot {index} read failed: {err}");
				return;
			}
		}
	}
}
