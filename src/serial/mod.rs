//! UART access for the serial bridge.

pub mod bridge;
pub mod frame;

use std::time::Duration;

use log::debug;
use serialport::SerialPort;

use crate::config::{self, SerialSettings};
use crate::errors::Result;
use self::frame::FrameFlags;

/// Bytes read from the UART per iteration of the transmit task.
pub const CHUNK_SIZE: usize = 256;

/// Opens and configures the UART described by `settings`.
pub fn open(settings: &SerialSettings) -> Result<Box<dyn SerialPort>> {
	let data_bits = match settings.data_bits {
		7 => serialport::DataBits::Seven,
		_ => serialport::DataBits::Eight,
	};
	let stop_bits = match settings.stop_bits {
		2 => serialport::StopBits::Two,
		_ => serialport::StopBits::One,
	};
	let parity = match settings.parity {
		config::Parity::None => serialport::Parity::None,
		config::Parity::Odd => serialport::Parity::Odd,
		config::Parity::Even => serialport::Parity::Even,
	};
	let flow = match settings.flow {
		config::FlowControl::None => serialport::FlowControl::None,
		config::FlowControl::XonXoff => serialport::FlowControl::Software,
		config::FlowControl::RtsCts => serialport::FlowControl::Hardware,
	};

	let port = serialport::new(&settings.device, settings.baud)
		.data_bits(data_bits)
		.stop_bits(stop_bits)
		.parity(parity)
		.flow_control(flow)
		.timeout(Duration::from_millis(u64::from(settings.timeout_ms)))
		.open()?;

	debug!(
		"opened {} at {} baud ({}{}{})",
		settings.device,
		settings.baud,
		settings.data_bits,
		match settings.parity {
			config::Parity::None => "N",
			config::Parity::Odd => "O",
			config::Parity::Even => "E",
		},
		settings.stop_bits
	);

	Ok(port)
}

/// Line-status flags to attach to outgoing frames.
///
/// The serialport crate does not surface parity, framing, or overrun state
/// portably, so transmitted frames currently carry no error flags.
pub fn status_flags(_port: &dyn SerialPort) -> FrameFlags {
	FrameFlags::empty()
}
