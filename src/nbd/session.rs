//! One NBD client session: Fixed-Newstyle handshake plus the request/reply
//! transmission loop.

use log::{debug, info, warn};

use super::backend::Backend;
use super::{
	ClientFlags, Command, HandshakeFlags, Request, TransmissionFlags, EINVAL, EIO, EPERM,
	EXPORT_PAD, IHAVEOPT, NBDMAGIC, OPT_EXPORT_NAME, REQUEST_LEN,
};
use crate::config::NbdSettings;
use crate::errors::{Error, Result};
use crate::net::{self, Stream};

/// Upper bound on a single READ/WRITE transfer. Larger requests answer
/// `EINVAL` instead of allocating unbounded buffers.
pub const MAX_TRANSFER: u32 = 32 * 1024 * 1024;

/// Sanity cap on the export-name length during negotiation.
const MAX_NAME_LEN: u32 = 4096;

/// Drives a complete session on `stream`. Returns when the client sends
/// `DISC`, disconnects, or breaks the protocol.
pub fn run(stream: &mut Stream, backend: &Backend, settings: &NbdSettings) -> Result<()> {
	handshake(stream, backend, settings)?;
	transmission(stream, backend)
}

fn transmission_flags(backend: &Backend, settings: &NbdSettings) -> TransmissionFlags {
	let mut flags = TransmissionFlags::HAS_FLAGS;
	if backend.readonly() {
		flags |= TransmissionFlags::READ_ONLY;
	}
	if settings.flush {
		flags |= TransmissionFlags::SEND_FLUSH;
	}
	if settings.trim {
		flags |= TransmissionFlags::SEND_TRIM;
	}
	flags
}

/// Fixed-Newstyle negotiation, `NBD_OPT_EXPORT_NAME` subset.
fn handshake(stream: &mut Stream, backend: &Backend, settings: &NbdSettings) -> Result<()> {
	let mut greeting = [0u8; 18];
	greeting[0..8].copy_from_slice(&NBDMAGIC.to_be_bytes());
	greeting[8..16].copy_from_slice(&IHAVEOPT.to_be_bytes());
	greeting[16..18].copy_from_slice(&HandshakeFlags::FIXED_NEWSTYLE.bits().to_be_bytes());
	net::write_all(stream, &greeting)?;

	let mut raw = [0u8; 4];
	net::read_exact(stream, &mut raw)?;
	let client_flags = ClientFlags::from_bits_retain(u32::from_be_bytes(raw));
	if !client_flags.contains(ClientFlags::FIXED_NEWSTYLE) {
		return Err(Error::InvalidState(format!(
			"client flags {:#010x} lack FIXED_NEWSTYLE",
			client_flags.bits()
		)));
	}

	let mut option = [0u8; 16];
	net::read_exact(stream, &mut option)?;
	let magic = u64::from_be_bytes(option[0..8].try_into().unwrap());
	if magic != IHAVEOPT {
		return Err(Error::InvalidState(format!("bad option magic {magic:#018x}")));
	}
	let opt = u32::from_be_bytes(option[8..12].try_into().unwrap());
	let name_len = u32::from_be_bytes(option[12..16].try_into().unwrap());
	if opt != OPT_EXPORT_NAME {
		return Err(Error::InvalidState(format!(
			"unsupported option {opt} (only NBD_OPT_EXPORT_NAME is spoken)"
		)));
	}
	if name_len > MAX_NAME_LEN {
		return Err(Error::InvalidArgument(format!(
			"export name length {name_len} exceeds {MAX_NAME_LEN}"
		)));
	}

	let mut name = vec![0u8; name_len as usize];
	net::read_exact(stream, &mut name)?;
	let name = String::from_utf8_lossy(&name);
	// Any name selects the single configured export.
	if name != settings.export_name {
		debug!(
			"client asked for export '{name}', serving '{}'",
			settings.export_name
		);
	}

	let flags = transmission_flags(backend, settings);
	let mut info = [0u8; 8 + 2 + EXPORT_PAD];
	info[0..8].copy_from_slice(&backend.size().to_be_bytes());
	info[8..10].copy_from_slice(&flags.bits().to_be_bytes());
	net::write_all(stream, &info)?;

	info!(
		"nbd handshake complete: export {} bytes, flags {flags:?}",
		backend.size()
	);
	Ok(())
}

/// Discards `length` bytes from the stream, keeping it in sync after a
/// rejected write.
fn discard_payload(stream: &mut Stream, length: u32) -> Result<()> {
	let mut sink = [0u8; 8192];
	let mut remaining = length as usize;
	while remaining > 0 {
		let n = sink.len().min(remaining);
		net::read_exact(stream, &mut sink[..n])?;
		remaining -= n;
	}
	Ok(())
}

fn error_code(err: &Error) -> u32 {
	match err {
		Error::InvalidArgument(_) => EINVAL,
		Error::PermissionDenied { .. } => EPERM,
		_ => EIO,
	}
}

/// The request/reply loop.
fn transmission(stream: &mut Stream, backend: &Backend) -> Result<()> {
	let mut raw = [0u8; REQUEST_LEN];

	loop {
		net::read_exact(stream, &mut raw)?;
		let request = Request::parse(&raw)?;

		let command = match Command::try_from(request.command) {
			Ok(command) => command,
			Err(_) => {
				warn!("unknown nbd command {}", request.command);
				net::write_all(stream, &super::reply(request.cookie, EINVAL))?;
				continue;
			}
		};

		match command {
			Command::Read => {
				if request.length == 0 || request.length > MAX_TRANSFER {
					net::write_all(stream, &super::reply(request.cookie, EINVAL))?;
					continue;
				}
				let mut data = vec![0u8; request.length as usize];
				match backend.read(&mut data, request.offset) {
					Ok(()) => {
						net::write_all(stream, &super::reply(request.cookie, 0))?;
						net::write_all(stream, &data)?;
					}
					Err(err) => {
						debug!("nbd read failed: {err}");
						net::write_all(stream, &super::reply(request.cookie, error_code(&err)))?;
					}
				}
			}
			Command::Write => {
				if request.length == 0 || request.length > MAX_TRANSFER {
					discard_payload(stream, request.length)?;
					net::write_all(stream, &super::reply(request.cookie, EINVAL))?;
					continue;
				}
				let mut data = vec![0u8; request.length as usize];
				net::read_exact(stream, &mut data)?;
				let code = match backend.write(&data, request.offset) {
					Ok(()) => 0,
					Err(err) => {
						debug!("nbd write failed: {err}");
						error_code(&err)
					}
				};
				net::write_all(stream, &super::reply(request.cookie, code))?;
			}
			Command::Flush => {
				let code = match backend.flush() {
					Ok(()) => 0,
					Err(err) => {
						warn!("nbd flush failed: {err}");
						error_code(&err)
					}
				};
				net::write_all(stream, &super::reply(request.cookie, code))?;
			}
			Command::Trim => {
				let code = match backend.trim(request.offset, u64::from(request.length)) {
					Ok(()) => 0,
					Err(err) => {
						debug!("nbd trim failed: {err}");
						error_code(&err)
					}
				};
				net::write_all(stream, &super::reply(request.cookie, code))?;
			}
			Command::Disconnect => {
				info!("nbd client disconnected cleanly");
				return Ok(());
			}
		}
	}
}
