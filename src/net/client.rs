//! The interactive standard client role: stdin to socket, socket to stdout.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::config::Configuration;
use crate::errors::Result;
use crate::fsm::RoleExit;
use crate::net::{self, SharedStream};
use crate::shutdown::{RestartSignal, ShutdownToken};

pub fn run(
	config: &Configuration,
	shutdown: &ShutdownToken,
	restart: &RestartSignal,
) -> Result<RoleExit> {
	let stream = net::connect(config)?;
	let shared = Arc::new(SharedStream::new(stream)?);
	let latch = ShutdownToken::new();

	info!(
		"connected to {}:{}; forwarding stdin",
		config.connect_host.as_deref().unwrap_or("?"),
		config.connect_port
	);

	let upstream = {
		let shared = Arc::clone(&shared);
		let latch = latch.clone();
		thread::spawn(move || stdin_to_socket(&shared, &latch))
	};

	let downstream = {
		let shared = Arc::clone(&shared);
		let latch = latch.clone();
		thread::spawn(move || socket_to_stdout(&shared, &latch))
	};

	let exit = loop {
		thread::sleep(Duration::from_secs(1));
		if shutdown.is_requested() || latch.is_requested() {
			break RoleExit::Shutdown;
		}
		if restart.is_requested() {
			break RoleExit::Restart;
		}
	};

	latch.request();
	shared.shutdown();
	upstream.join().ok();
	downstream.join().ok();

	Ok(exit)
}

fn stdin_to_socket(shared: &SharedStream, latch: &ShutdownToken) {
	let mut stdin = io::stdin().lock();
	let mut buf = [0u8; 4096];

	while !latch.is_requested() {
		// Poll so that shutdown is noticed even while stdin is silent.
		match net::wait_readable(libc::STDIN_FILENO, 1000) {
			Ok(false) => continue,
			Ok(true) => {}
			Err(err) => {
				warn!("stdin poll failed: {err}");
				latch.request();
				return;
			}
		}

		match stdin.read(&mut buf) {
			Ok(0) => {
				latch.request();
				return;
			}
			Ok(n) => {
				if let Err(err) = shared.write_all(&buf[..n]) {
					warn!("socket write failed: {err}");
					latch.request();
					return;
				}
			}
			Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
			Err(err) => {
				warn!("stdin read failed: {err}");
				latch.request();
				return;
			}
		}
	}
}

fn socket_to_stdout(shared: &SharedStream, latch: &ShutdownToken) {
	let mut stdout = io::stdout().lock();
	let mut buf = [0u8; 4096];

	while !latch.is_requested() {
		match shared.read(&mut buf) {
			Ok(0) => {
				info!("server closed the connection");
				latch.request();
				return;
			}
			Ok(n) => {
				if stdout.write_all(&buf[..n]).and_then(|()| stdout.flush()).is_err() {
					latch.request();
					return;
				}
			}
			Err(err) if net::is_timeout(&err) => {}
			Err(err) => {
				warn!("socket read failed: {err}");
				latch.request();
				return;
			}
		}
	}
}
