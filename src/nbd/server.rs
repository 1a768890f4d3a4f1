//! The NBD server role loop.
//!
//! One listener, one session at a time. The accept loop wakes once a second
//! to poll the shutdown token and the restart signal; session failures
//! terminate that session only.

use log::{info, warn};

use super::backend::Backend;
use super::session;
use crate::config::Configuration;
use crate::errors::Result;
use crate::fsm::RoleExit;
use crate::net::{self, Stream};
use crate::shutdown::{RestartSignal, ShutdownToken};
use crate::tls;

pub fn run(
	config: &Configuration,
	shutdown: &ShutdownToken,
	restart: &RestartSignal,
) -> Result<RoleExit> {
	let backend = Backend::open(&config.nbd)?;
	let listener = net::listen(config)?;
	let tls_config = tls::server_config_for(config)?;

	info!(
		"nbd server listening on port {} (export '{}', {} bytes, max {} connections)",
		config.listen_port,
		config.nbd.export_name,
		backend.size(),
		config.nbd.max_connections
	);

	loop {
		if shutdown.is_requested() {
			return Ok(RoleExit::Shutdown);
		}
		if restart.is_requested() {
			return Ok(RoleExit::Restart);
		}

		let (socket, peer) = match net::poll_accept(&listener) {
			Ok(Some(accepted)) => accepted,
			Ok(None) => continue,
			// Transient accept failures never stop the listener.
			Err(err) => {
				warn!("nbd accept failed: {err}");
				continue;
			}
		};

		let mut stream = match &tls_config {
			Some(tls_config) => match tls::wrap_server(tls_config, socket) {
				Ok(stream) => stream,
				Err(err) => {
					warn!("TLS accept from {peer} failed: {err}");
					continue;
				}
			},
			None => Stream::Plain(socket),
		};

		info!("nbd client {peer} connected");
		match session::run(&mut stream, &backend, &config.nbd) {
			Ok(()) => info!("nbd session with {peer} ended"),
			Err(err) => warn!("nbd session with {peer} failed: {err}"),
		}
	}
}
