//! The serial bridge pipeline.
//!
//! Two cooperating tasks couple a UART to a TCP socket. The transmit task
//! reads UART chunks, encapsulates them, and writes frames to the socket. The
//! receive task reads frames from the socket, decapsulates them into the ring
//! buffer, and drains the ring to the UART. A shared latch coordinates
//! shutdown: whichever side fails first latches it, and `stop` closes the
//! ring and the socket so both tasks unpark.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serialport::SerialPort;

use super::frame::{self, MAX_FRAME, MAX_PAYLOAD};
use super::CHUNK_SIZE;
use crate::config::Configuration;
use crate::errors::Result;
use crate::fsm::RoleExit;
use crate::net::{self, SharedStream};
use crate::ring::RingBuffer;
use crate::shutdown::{RestartSignal, ShutdownToken};

/// Runs the serial client role until shutdown, restart, or a fatal pipeline
/// error.
pub fn run(
	config: &Configuration,
	shutdown: &ShutdownToken,
	restart: &RestartSignal,
) -> Result<RoleExit> {
	let stream = net::connect(config)?;
	let uart = super::open(&config.serial)?;
	let uart_rx = uart.try_clone()?;

	let shared = Arc::new(SharedStream::new(stream)?);
	let ring = Arc::new(RingBuffer::new(0));
	let latch = ShutdownToken::new();
	let tx_seq = Arc::new(AtomicU16::new(0));
	let rx_seq = Arc::new(AtomicU16::new(0));

	info!(
		"serial bridge up: {} <-> {}:{}",
		config.serial.device,
		config.connect_host.as_deref().unwrap_or("?"),
		config.connect_port
	);

	let transmit = {
		let shared = Arc::clone(&shared);
		let latch = latch.clone();
		let tx_seq = Arc::clone(&tx_seq);
		thread::spawn(move || uart_to_net(uart_rx, &shared, &latch, &tx_seq))
	};

	let receive = {
		let shared = Arc::clone(&shared);
		let ring = Arc::clone(&ring);
		let latch = latch.clone();
		let rx_seq = Arc::clone(&rx_seq);
		thread::spawn(move || net_to_uart(uart, &shared, &ring, &latch, &rx_seq))
	};

	// Supervisor: 1 Hz poll for shutdown, restart, and pipeline death.
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
	transmit.join().ok();
	receive.join().ok();

	debug!(
		"serial bridge down after {} tx / {} rx frames",
		tx_seq.load(Ordering::Relaxed),
		rx_seq.load(Ordering::Relaxed)
	);
	Ok(exit)
}

/// Task A: UART to network. Timeouts yield empty reads and simply loop; a
/// failed UART read or socket write latches shutdown.
fn uart_to_net(
	mut uart: Box<dyn SerialPort>,
	shared: &SharedStream,
	latch: &ShutdownToken,
	tx_seq: &AtomicU16,
) {
	let mut chunk = [0u8; CHUNK_SIZE];

	while !latch.is_requested() {
		let n = match uart.read(&mut chunk) {
			Ok(n) => n,
			Err(err) if net::is_timeout(&err) => continue,
			Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
			Err(err) => {
				warn!("uart read failed: {err}");
				latch.request();
				return;
			}
		};
		if n == 0 {
			continue;
		}

		let sequence = tx_seq.fetch_add(1, Ordering::Relaxed);
		let flags = super::status_flags(uart.as_ref());
		let encoded = match frame::encode(&chunk[..n], sequence, flags) {
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
}

/// Task B: network to UART via the ring buffer.
fn net_to_uart(
	mut uart: Box<dyn SerialPort>,
	shared: &SharedStream,
	ring: &RingBuffer,
	latch: &ShutdownToken,
	rx_seq: &AtomicU16,
) {
	let mut block = [0u8; MAX_FRAME];
	let mut payload = [0u8; MAX_PAYLOAD];

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

		if !ingest(&block[..n], &mut payload, ring, rx_seq) {
			continue;
		}

		if let Err(err) = drain_ring(ring, &mut uart, latch) {
			warn!("uart write failed: {err}");
			latch.request();
			return;
		}
	}
}

/// Decapsulates one received block through `payload` into the ring. Checksum
/// and protocol-id failures are logged and the block discarded; error flags
/// are surfaced but never cause a drop.
fn ingest(block: &[u8], payload: &mut [u8], ring: &RingBuffer, rx_seq: &AtomicU16) -> bool {
	let (len, sequence, flags) = match frame::decode_into(block, payload) {
		Ok(decoded) => decoded,
		Err(err) => {
			warn!("dropping bad frame: {err}");
			return false;
		}
	};

	if !flags.is_empty() {
		debug!("frame {sequence} carries line status {flags:?}");
	}
	rx_seq.store(sequence.wrapping_add(1), Ordering::Relaxed);

	ring.write(&payload[..len]) > 0 || len == 0
}

/// Drains the ring to the UART until empty, checking the latch between
/// iterations.
fn drain_ring(ring: &RingBuffer, uart: &mut impl Write, latch: &ShutdownToken) -> io::Result<()> {
	let mut chunk = [0u8; CHUNK_SIZE];

	while ring.available() > 0 && !latch.is_requested() {
		let n = ring.read(&mut chunk);
		if n == 0 {
			break;
		}
		uart.write_all(&chunk[..n])?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::serial::frame::{encode, FrameFlags};

	#[test]
	fn ingest_accepts_valid_frames_and_tracks_sequence() {
		let ring = RingBuffer::new(64);
		let rx_seq = AtomicU16::new(0);
		let mut payload = [0u8; MAX_PAYLOAD];

		let block = encode(b"abc", 41, FrameFlags::empty()).unwrap();
		assert!(ingest(&block, &mut payload, &ring, &rx_seq));
		assert_eq!(rx_seq.load(Ordering::Relaxed), 42);

		let mut out = [0u8; 8];
		assert_eq!(ring.read(&mut out), 3);
		assert_eq!(&out[..3], b"abc");
	}

	#[test]
	fn ingest_discards_corrupt_blocks() {
		let ring = RingBuffer::new(64);
		let rx_seq = AtomicU16::new(7);
		let mut payload = [0u8; MAX_PAYLOAD];

		let mut block = encode(b"abc", 1, FrameFlags::empty()).unwrap();
		let last = block.len() - 1;
		block[last] ^= 0xFF;
		assert!(!ingest(&block, &mut payload, &ring, &rx_seq));
		assert_eq!(ring.available(), 0);
		assert_eq!(rx_seq.load(Ordering::Relaxed), 7);
	}

	#[test]
	fn ingest_keeps_frames_with_error_flags() {
		let ring = RingBuffer::new(64);
		let rx_seq = AtomicU16::new(0);
		let mut payload = [0u8; MAX_PAYLOAD];

		let block = encode(b"x", 0, FrameFlags::PARITY_ERROR).unwrap();
		assert!(ingest(&block, &mut payload, &ring, &rx_seq));
		assert_eq!(ring.available(), 1);
	}

	#[test]
	fn drain_ring_moves_everything_to_the_writer() {
		let ring = RingBuffer::new(1024);
		let latch = ShutdownToken::new();
		let payload: Vec<u8> = (0..200u8).collect();
		ring.write(&payload);

		let mut sink = Vec::new();
		drain_ring(&ring, &mut sink, &latch).unwrap();
		assert_eq!(sink, payload);
		assert_eq!(ring.available(), 0);
	}

	#[test]
	fn drain_ring_stops_on_latch() {
		let ring = RingBuffer::new(1024);
		let latch = ShutdownToken::new();
		latch.request();
		ring.write(&[1, 2, 3]);

		let mut sink = Vec::new();
		drain_ring(&ring, &mut sink, &latch).unwrap();
		assert!(sink.is_empty());
	}
}
