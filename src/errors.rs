//! Crate-wide error taxonomy.
//!
//! Leaf functions return [`Error`]; callers either recover locally (a serial
//! read timeout, a transient accept failure) or propagate with `?`. The
//! lifecycle FSM is the top-level recovery point.

use std::result;

use thiserror::Error;

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
	/// A caller-supplied value is out of range or malformed. Validation
	/// failures carry the offending field in the message.
	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	#[error("{path}: no such file or device")]
	NotFound { path: String },

	#[error("{path}: permission denied")]
	PermissionDenied { path: String },

	#[error("buffer too small: need {need} bytes, have {have}")]
	BufferTooSmall { need: usize, have: usize },

	/// Wire-level corruption or a protocol step out of order.
	#[error("invalid state: {0}")]
	InvalidState(String),

	#[error("network error: {0}")]
	Network(String),

	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	#[error("serial port error: {0}")]
	Serial(#[from] serialport::Error),

	#[error("usb error: {0}")]
	Usb(#[from] UsbError),

	#[error("tls error: {0}")]
	Tls(#[from] rustls::Error),
}

/// USB failure modes surfaced by the bridge client.
#[derive(Debug, Error)]
pub enum UsbError {
	#[error("transfer timed out")]
	Timeout,
	#[error("no matching device")]
	NoDevice,
	#[error("access denied (udev permissions?)")]
	AccessDenied,
	#[error("device is busy")]
	Busy,
	#[error("operation not supported")]
	NotSupported,
	#[error("endpoint pipe error")]
	Pipe,
	#[error("transfer overflow")]
	Overflow,
	#[error("transfer cancelled")]
	Cancelled,
	#[error("{0}")]
	Other(String),
}

impl From<nusb::transfer::TransferError> for UsbError {
	fn from(err: nusb::transfer::TransferError) -> Self {
		use nusb::transfer::TransferError;

		match err {
			TransferError::Cancelled => UsbError::Cancelled,
			TransferError::Stall => UsbError::Pipe,
			TransferError::Disconnected => UsbError::NoDevice,
			TransferError::Fault => UsbError::Other("host controller fault".to_string()),
			TransferError::Unknown => UsbError::Other("unknown transfer error".to_string()),
		}
	}
}

impl Error {
	/// Errors that terminate a single session rather than the process.
	pub fn is_session_local(&self) -> bool {
		matches!(self, Error::Network(_) | Error::Io(_) | Error::InvalidState(_))
	}
}
