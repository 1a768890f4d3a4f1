//! Dual-slot configuration manager.
//!
//! Owns an `active` configuration (what the role loops observe) and a
//! `pending` one (what management sessions mutate). One mutex covers both
//! slots, so [`ConfigManager::apply_pending`] is atomic from any other
//! caller's viewpoint: snapshot getters observe either the full pre-apply or
//! the full post-apply configuration, never a mixture.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::config::{Configuration, Encryption, Parity, Role};
use crate::errors::Result;

struct Slots {
	active: Configuration,
	pending: Configuration,
	has_pending: bool,
}

pub struct ConfigManager {
	slots: Mutex<Slots>,
}

impl ConfigManager {
	/// Seeds both slots with the boot configuration.
	pub fn new(seed: Configuration) -> Self {
		Self {
			slots: Mutex::new(Slots {
				active: seed.clone(),
				pending: seed,
				has_pending: false,
			}),
		}
	}

	/// Snapshot of the active configuration.
	pub fn active(&self) -> Configuration {
		self.slots.lock().unwrap().active.clone()
	}

	/// Snapshot of the pending configuration.
	pub fn pending(&self) -> Configuration {
		self.slots.lock().unwrap().pending.clone()
	}

	pub fn has_pending(&self) -> bool {
		self.slots.lock().unwrap().has_pending
	}

	fn mutate(&self, f: impl FnOnce(&mut Configuration)) {
		let mut slots = self.slots.lock().unwrap();
		f(&mut slots.pending);
		slots.has_pending = true;
	}

	pub fn set_role(&self, role: Role) {
		self.mutate(|c| c.role = role);
	}

	pub fn set_listen_port(&self, port: u16) {
		self.mutate(|c| c.listen_port = port);
	}

	pub fn set_listen_addr(&self, addr: Option<Ipv4Addr>) {
		self.mutate(|c| c.listen_addr = addr);
	}

	pub fn set_connect_host(&self, host: String) {
		self.mutate(|c| c.connect_host = Some(host));
	}

	pub fn set_connect_port(&self, port: u16) {
		self.mutate(|c| c.connect_port = port);
	}

	pub fn set_encryption(&self, mode: Encryption) {
		self.mutate(|c| c.encryption = mode);
	}

	pub fn set_serial_device(&self, device: String) {
		self.mutate(|c| c.serial.device = device);
	}

	pub fn set_serial_baud(&self, baud: u32) {
		self.mutate(|c| c.serial.baud = baud);
	}

	pub fn set_serial_parity(&self, parity: Parity) {
		self.mutate(|c| c.serial.parity = parity);
	}

	pub fn set_nbd_export(&self, path: String) {
		self.mutate(|c| c.nbd.export_path = path);
	}

	pub fn set_nbd_name(&self, name: String) {
		self.mutate(|c| c.nbd.export_name = name);
	}

	/// Re-runs full validation on the pending configuration.
	pub fn validate_pending(&self) -> Result<()> {
		self.slots.lock().unwrap().pending.validate()
	}

	/// Promotes pending to active and returns the new active configuration.
	pub fn apply_pending(&self) -> Configuration {
		let mut slots = self.slots.lock().unwrap();
		slots.active = slots.pending.clone();
		slots.has_pending = false;
		slots.active.clone()
	}

	/// Overwrites pending with a copy of active.
	pub fn clear_pending(&self) {
		let mut slots = self.slots.lock().unwrap();
		slots.pending = slots.active.clone();
		slots.has_pending = false;
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::thread;

	use super::*;

	#[test]
	fn set_marks_pending_and_apply_clears_it() {
		let mgr = ConfigManager::new(Configuration::default());
		assert!(!mgr.has_pending());

		mgr.set_listen_port(20000);
		assert!(mgr.has_pending());
		assert_eq!(mgr.active().listen_port, crate::config::DEFAULT_PORT);
		assert_eq!(mgr.pending().listen_port, 20000);

		let active = mgr.apply_pending();
		assert_eq!(active.listen_port, 20000);
		assert!(!mgr.has_pending());
		assert_eq!(mgr.active().listen_port, 20000);
	}

	#[test]
	fn clear_restores_pending_from_active() {
		let mgr = ConfigManager::new(Configuration::default());
		mgr.set_listen_port(20000);
		mgr.set_serial_baud(9600);
		mgr.clear_pending();
		assert!(!mgr.has_pending());
		assert_eq!(mgr.pending(), mgr.active());
	}

	#[test]
	fn apply_is_atomic_under_concurrent_readers() {
		// Writers flip between two full snapshots; readers must never observe
		// a torn combination of port and baud.
		let mgr = Arc::new(ConfigManager::new(Configuration::default()));
		mgr.set_listen_port(1111);
		mgr.set_serial_baud(9600);
		mgr.apply_pending();

		let writer = {
			let mgr = Arc::clone(&mgr);
			thread::spawn(move || {
				for i in 0..500u32 {
					if i % 2 == 0 {
						mgr.set_listen_port(2222);
						mgr.set_serial_baud(115_200);
					} else {
						mgr.set_listen_port(1111);
						mgr.set_serial_baud(9600);
					}
					mgr.apply_pending();
				}
			})
		};

		for _ in 0..500 {
			let snapshot = mgr.active();
			let pair = (snapshot.listen_port, snapshot.serial.baud);
			assert!(
				pair == (1111, 9600) || pair == (2222, 115_200),
				"torn snapshot: {pair:?}"
			);
		}

		writer.join().unwrap();
	}
}
