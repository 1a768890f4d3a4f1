//! Network Block Device server, Fixed-Newstyle variant.
//!
//! Wire constants follow the NBD protocol document; only the
//! `NBD_OPT_EXPORT_NAME` negotiation subset is spoken. All multi-byte
//! integers are big-endian on the wire.

pub mod backend;
pub mod server;
pub mod session;

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::errors::{Error, Result};

/// `NBDMAGIC`, the first eight bytes of the handshake.
pub const NBDMAGIC: u64 = 0x4e42_444d_4147_4943;
/// `IHAVEOPT`, sent by the server and echoed by the client before options.
pub const IHAVEOPT: u64 = 0x4948_4156_454f_5054;
/// Magic opening every transmission request.
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
/// Magic opening every simple reply.
pub const REPLY_MAGIC: u32 = 0x6744_6698;

/// The one option this server understands.
pub const OPT_EXPORT_NAME: u32 = 1;

/// Size of a transmission request on the wire.
pub const REQUEST_LEN: usize = 28;
/// Size of a simple reply on the wire.
pub const REPLY_LEN: usize = 16;
/// Reserved zero padding after the export info.
pub const EXPORT_PAD: usize = 124;

/// Wire errno values used in replies.
pub const EPERM: u32 = 1;
pub const EIO: u32 = 5;
pub const EINVAL: u32 = 22;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct HandshakeFlags: u16 {
		const FIXED_NEWSTYLE = 0x0001;
	}
}

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ClientFlags: u32 {
		const FIXED_NEWSTYLE = 0x0001;
	}
}

bitflags! {
	/// Per-export transmission flags sent with the export info.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct TransmissionFlags: u16 {
		const HAS_FLAGS = 0x0001;
		const READ_ONLY = 0x0002;
		const SEND_FLUSH = 0x0004;
		const SEND_TRIM = 0x0020;
	}
}

/// Transmission commands handled by the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum Command {
	Read = 0,
	Write = 1,
	Disconnect = 2,
	Flush = 3,
	Trim = 4,
}

/// One parsed transmission request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
	pub flags: u16,
	pub command: u16,
	pub cookie: u64,
	pub offset: u64,
	pub length: u32,
}

impl Request {
	/// Parses a request header, verifying the magic.
	pub fn parse(raw: &[u8; REQUEST_LEN]) -> Result<Self> {
		let magic = u32::from_be_bytes(raw[0..4].try_into().unwrap());
		if magic != REQUEST_MAGIC {
			return Err(Error::InvalidState(format!(
				"bad request magic {magic:#010x}"
			)));
		}

		Ok(Self {
			flags: u16::from_be_bytes(raw[4..6].try_into().unwrap()),
			command: u16::from_be_bytes(raw[6..8].try_into().unwrap()),
			cookie: u64::from_be_bytes(raw[8..16].try_into().unwrap()),
			offset: u64::from_be_bytes(raw[16..24].try_into().unwrap()),
			length: u32::from_be_bytes(raw[24..28].try_into().unwrap()),
		})
	}
}

/// Serializes a simple reply header.
pub fn reply(cookie: u64, error: u32) -> [u8; REPLY_LEN] {
	let mut out = [0u8; REPLY_LEN];
	out[0..4].copy_from_slice(&REPLY_MAGIC.to_be_bytes());
	out[4..8].copy_from_slice(&error.to_be_bytes());
	out[8..16].copy_from_slice(&cookie.to_be_bytes());
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn magics_spell_their_names() {
		assert_eq!(&NBDMAGIC.to_be_bytes(), b"NBDMAGIC");
		assert_eq!(&IHAVEOPT.to_be_bytes(), b"IHAVEOPT");
	}

	#[test]
	fn request_round_trip() {
		let mut raw = [0u8; REQUEST_LEN];
		raw[0..4].copy_from_slice(&REQUEST_MAGIC.to_be_bytes());
		raw[6..8].copy_from_slice(&1u16.to_be_bytes());
		raw[8..16].copy_from_slice(&0xdead_beef_u64.to_be_bytes());
		raw[16..24].copy_from_slice(&4096u64.to_be_bytes());
		raw[24..28].copy_from_slice(&512u32.to_be_bytes());

		let request = Request::parse(&raw).unwrap();
		assert_eq!(request.command, Command::Write as u16);
		assert_eq!(request.cookie, 0xdead_beef);
		assert_eq!(request.offset, 4096);
		assert_eq!(request.length, 512);
	}

	#[test]
	fn bad_request_magic_is_rejected() {
		let raw = [0u8; REQUEST_LEN];
		assert!(matches!(Request::parse(&raw), Err(Error::InvalidState(_))));
	}

	#[test]
	fn reply_layout() {
		let out = reply(0x1122_3344_5566_7788, EINVAL);
		assert_eq!(&out[0..4], &REPLY_MAGIC.to_be_bytes());
		assert_eq!(&out[4..8], &EINVAL.to_be_bytes());
		assert_eq!(&out[8..16], &0x1122_3344_5566_7788u64.to_be_bytes());
	}

	#[test]
	fn command_parsing() {
		assert_eq!(Command::try_from(0u16).unwrap(), Command::Read);
		assert_eq!(Command::try_from(4u16).unwrap(), Command::Trim);
		assert!(Command::try_from(9u16).is_err());
	}
}
