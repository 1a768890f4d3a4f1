//! USB device enumeration and the USB bridge client.
//!
//! The USB client has the same two-task shape as the serial pipeline with the
//! UART replaced by a claimed bulk interface. Device access goes through
//! `nusb`; transfers are futures and the bridge blocks on them.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use nusb::transfer::RequestBuffer;

use crate::config::{Configuration, UsbDeviceSpec};
use crate::errors::{Error, Result, UsbError};
use crate::fsm::RoleExit;
use crate::net::{self, SharedStream};
use crate::ring::RingBuffer;
use crate::serial::frame::{self, FrameFlags, MAX_FRAME, MAX_PAYLOAD};
use crate::shutdown::{RestartSignal, ShutdownToken};

/// Bytes requested per bulk-in transfer.
const TRANSFER_SIZE: usize = 512;

/// Prints the visible USB devices, one line each.
pub fn print_device_list() -> Result<()> {
	let devices = nusb::list_devices().map_err(|err| Error::Usb(UsbError::Other(err.to_string())))?;

	println!("Bus Addr  VID:PID   Product");
	for device in devices {
		println!(
			"{:3} {:4}  {:04x}:{:04x}  {}",
			device.bus_number(),
			device.device_address(),
			device.vendor_id(),
			device.product_id(),
			device.product_string().unwrap_or("(unknown)")
		);
	}

	Ok(())
}

/// A claimed interface with its bulk endpoint pair.
pub struct UsbLink {
	interface: nusb::Interface,
	ep_in: u8,
	ep_out: u8,
}

impl UsbLink {
	/// Finds, opens, and claims the device described by `spec`.
	pub fn open(spec: &UsbDeviceSpec) -> Result<Self> {
		let info = nusb::list_devices()
			.map_err(|err| Error::Usb(UsbError::Other(err.to_string())))?
			.find(|d| d.vendor_id() == spec.vendor_id && d.product_id() == spec.product_id)
			.ok_or(Error::Usb(UsbError::NoDevice))?;

		let device = info.open().map_err(|err| match err.kind() {
			std::io::ErrorKind::PermissionDenied => Error::Usb(UsbError::AccessDenied),
			_ => Error::Usb(UsbError::Other(err.to_string())),
		})?;
		let interface = device.claim_interface(spec.interface).map_err(|err| {
			match err.kind() {
				std::io::ErrorKind::ResourceBusy => Error::Usb(UsbError::Busy),
				_ => Error::Usb(UsbError::Other(err.to_string())),
			}
		})?;

		debug!(
			"claimed usb {:04x}:{:04x} interface {} (in {:#04x}, out {:#04x})",
			spec.vendor_id, spec.product_id, spec.interface, spec.ep_in, spec.ep_out
		);

		Ok(Self {
			interface,
			ep_in: spec.ep_in,
			ep_out: spec.ep_out,
		})
	}

	/// One bulk-in transfer. Blocks until the device produces data.
	pub fn read(&self) -> Result<Vec<u8>> {
		let completion = pollster::block_on(
			self.interface
				.bulk_in(self.ep_in, RequestBuffer::new(TRANSFER_SIZE)),
		);
		completion
			.into_result()
			.map_err(|err| Error::Usb(UsbError::from(err)))
	}

	/// One bulk-out transfer of the whole buffer.
	pub fn write(&self, data: Vec<u8>) -> Result<()> {
		let completion = pollster::block_on(self.interface.bulk_out(self.ep_out, data));
		completion
			.into_result()
			.map(|_| ())
			.map_err(|err| Error::Usb(UsbError::from(err)))
	}
}

/// Runs the USB client role: the serial pipeline shape over a bulk interface.
pub fn run(
	config: &Configuration,
	shutdown: &ShutdownToken,
	restart: &RestartSignal,
) -> Result<RoleExit> {
	let spec = config
		.usb_devices
		.first()
		.ok_or_else(|| Error::InvalidArgument("no usb device configured".to_string()))?;
	let link = Arc::new(UsbLink::open(spec)?);
	let stream = net::connect(config)?;
	let shared = Arc::new(SharedStream::new(stream)?);
	let ring = Arc::new(RingBuffer::new(0));
	let latch = ShutdownToken::new();
	let tx_seq = Arc::new(AtomicU16::new(0));

	info!(
		"usb bridge up: {:04x}:{:04x} <-> {}:{}",
		spec.vendor_id,
		spec.product_id,
		config.connect_host.as_deref().unwrap_or("?"),
		config.connect_port
	);

	let device_to_net = {
		let link = Arc::clone(&link);
		let shared = Arc::clone(&shared);
		let latch = latch.clone();
		let tx_seq = Arc::clone(&tx_seq);
		thread::spawn(move || {
			while !latch.is_requested() {
				let data = match link.read() {
					Ok(data) => data,
					Err(Error::Usb(UsbError::Timeout)) => continue,
					Err(err) => {
						warn!("usb read failed: {err}");
						latch.request();
						return;
					}
				};
				if data.is_empty() {
					continue;
				}

				let sequence = tx_seq.fetch_add(1, Ordering::Relaxed);
				let encoded = match frame::encode(&data, sequence, FrameFlags::empty()) {
					Ok(encoded) => encoded,
					Err(err) => {
						warn!("frame encode failed: {err}");
						continue;
					}
				};
				if let Err(err) = shared.write_all(&encoded) {
					warn!("socket write failed: {err}");
					latch.request();
					return;
				}
			}
		})
	};

	let net_to_device = {
		let link = Arc::clone(&link);
		let shared = Arc::clone(&shared);
		let ring = Arc::clone(&ring);
		let latch = latch.clone();
		thread::spawn(move || {
			let mut block = [0u8; MAX_FRAME];
			let mut payload = [0u8; MAX_PAYLOAD];
			let mut chunk = [0u8; TRANSFER_SIZE];

			while !latch.is_requested() {
				let n = match shared.read(&mut block) {
					Ok(0) => {
						info!("peer closed the bridge connection");
						latch.request();
						return;
					}
					Ok(n) => n,
					Err(err) if net::is_timeout(&err) => continue,
					Err(err) => {
						warn!("socket read failed: {err}");
						latch.request();
						return;
					}
				};

				let (len, sequence, flags) = match frame::decode_into(&block[..n], &mut payload) {
					Ok(decoded) => decoded,
					Err(err) => {
						warn!("dropping bad frame: {err}");
						continue;
					}
				};
				if !flags.is_empty() {
					debug!("frame {sequence} carries line status {flags:?}");
				}
				ring.write(&payload[..len]);

				while ring.available() > 0 && !latch.is_requested() {
					let n = ring.read(&mut chunk);
					if n == 0 {
						break;
					}
					if let Err(err) = link.write(chunk[..n].to_vec()) {
						warn!("usb write failed: {err}");
						latch.request();
						return;
					}
				}
			}
		})
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
	ring.close();
	shared.shutdown();
	// A bulk-in transfer with no traffic can outlive the socket; it resolves
	// when the device produces data or is unplugged.
	net_to_device.join().ok();
	device_to_net.join().ok();

	Ok(exit)
}
