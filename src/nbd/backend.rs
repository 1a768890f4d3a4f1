//! Uniform block backend over files, block devices, and zvols.
//!
//! Each kind is its own store behind an enum-dispatched trait; a backend is
//! an opened store plus the geometry the session advertises. One mutex
//! serializes positional I/O; size and block size are stable for the
//! backend's lifetime.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::sync::Mutex;

use enum_dispatch::enum_dispatch;
use log::{debug, warn};

use crate::config::{NbdBackendKind, NbdSettings};
use crate::errors::{Error, Result};

// Linux block ioctls; not exposed by the libc crate.
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
const BLKDISCARD: libc::c_ulong = 0x1277;

/// Positional I/O every backend kind provides.
#[enum_dispatch]
trait BlockIo {
	fn kind(&self) -> NbdBackendKind;
	fn len(&self) -> Result<u64>;
	fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
	fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;
	fn sync(&self) -> Result<()>;
	fn discard(&self, offset: u64, length: u64) -> Result<()>;
}

fn device_size(file: &File) -> Result<u64> {
	let mut size: u64 = 0;
	// SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
	let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
	if rc != 0 {
		return Err(Error::Io(std::io::Error::last_os_error()));
	}
	Ok(size)
}

fn blkdiscard(file: &File, offset: u64, length: u64) -> Result<()> {
	let range = [offset, length];
	// SAFETY: BLKDISCARD reads a [start, length] pair of u64s.
	let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKDISCARD, range.as_ptr()) };
	if rc != 0 {
		// Not every device supports discard; stay best-effort.
		warn!("BLKDISCARD failed: {}", std::io::Error::last_os_error());
	}
	Ok(())
}

/// A regular file export.
#[derive(Debug)]
struct FileStore {
	file: File,
}

impl BlockIo for FileStore {
	fn kind(&self) -> NbdBackendKind {
		NbdBackendKind::File
	}

	fn len(&self) -> Result<u64> {
		Ok(self.file.metadata()?.len())
	}

	fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		self.file.read_exact_at(buf, offset)?;
		Ok(())
	}

	fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		self.file.write_all_at(buf, offset)?;
		Ok(())
	}

	fn sync(&self) -> Result<()> {
		self.file.sync_data()?;
		Ok(())
	}

	fn discard(&self, _offset: u64, _length: u64) -> Result<()> {
		// Trim on regular files is a no-op.
		Ok(())
	}
}

/// A raw block device export.
#[derive(Debug)]
struct DeviceStore {
	file: File,
}

impl BlockIo for DeviceStore {
	fn kind(&self) -> NbdBackendKind {
		NbdBackendKind::Device
	}

	fn len(&self) -> Result<u64> {
		device_size(&self.file)
	}

	fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		self.file.read_exact_at(buf, offset)?;
		Ok(())
	}

	fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		self.file.write_all_at(buf, offset)?;
		Ok(())
	}

	fn sync(&self) -> Result<()> {
		self.file.sync_data()?;
		Ok(())
	}

	fn discard(&self, offset: u64, length: u64) -> Result<()> {
		blkdiscard(&self.file, offset, length)
	}
}

/// A ZFS volume export; device semantics, classified by its `/dev/zvol/`
/// path.
#[derive(Debug)]
struct ZvolStore {
	file: File,
}

impl BlockIo for ZvolStore {
	fn kind(&self) -> NbdBackendKind {
		NbdBackendKind::Zvol
	}

	fn len(&self) -> Result<u64> {
		device_size(&self.file)
	}

	fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		self.file.read_exact_at(buf, offset)?;
		Ok(())
	}

	fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		self.file.write_all_at(buf, offset)?;
		Ok(())
	}

	fn sync(&self) -> Result<()> {
		self.file.sync_data()?;
		Ok(())
	}

	fn discard(&self, offset: u64, length: u64) -> Result<()> {
		blkdiscard(&self.file, offset, length)
	}
}

#[enum_dispatch(BlockIo)]
#[derive(Debug)]
enum Store {
	File(FileStore),
	Device(DeviceStore),
	Zvol(ZvolStore),
}

#[derive(Debug)]
pub struct Backend {
	store: Mutex<Store>,
	size: u64,
	block_size: u32,
	readonly: bool,
}

fn classify(path: &str, file: &File) -> Result<NbdBackendKind> {
	if path.starts_with("/dev/zvol/") {
		return Ok(NbdBackendKind::Zvol);
	}

	let file_type = file.metadata()?.file_type();
	if file_type.is_block_device() {
		Ok(NbdBackendKind::Device)
	} else if file_type.is_file() {
		Ok(NbdBackendKind::File)
	} else {
		Err(Error::InvalidArgument(format!(
			"'{path}' is neither a regular file nor a block device"
		)))
	}
}

impl Backend {
	/// Opens the export described by `settings`.
	pub fn open(settings: &NbdSettings) -> Result<Self> {
		let path = &settings.export_path;
		let file = OpenOptions::new()
			.read(true)
			.write(!settings.readonly)
			.open(path)
			.map_err(|err| match err.kind() {
				std::io::ErrorKind::NotFound => Error::NotFound { path: path.clone() },
				std::io::ErrorKind::PermissionDenied => Error::PermissionDenied { path: path.clone() },
				_ => Error::Io(err),
			})?;

		let kind = match settings.backend {
			NbdBackendKind::Auto => classify(path, &file)?,
			kind => kind,
		};
		let store: Store = match kind {
			NbdBackendKind::File => FileStore { file }.into(),
			NbdBackendKind::Device => DeviceStore { file }.into(),
			NbdBackendKind::Zvol => ZvolStore { file }.into(),
			NbdBackendKind::Auto => unreachable!("auto resolved above"),
		};

		let native_size = store.len()?;
		let size = settings.size_override.unwrap_or(native_size);
		// Export whole blocks only.
		let size = size - size % u64::from(settings.block_size);
		if size == 0 {
			return Err(Error::InvalidArgument(format!(
				"export '{path}' is smaller than one block"
			)));
		}

		debug!(
			"nbd backend '{path}' ({}) size {size} block {}{}",
			kind.as_str(),
			settings.block_size,
			if settings.readonly { ", read-only" } else { "" }
		);

		Ok(Self {
			store: Mutex::new(store),
			size,
			block_size: settings.block_size,
			readonly: settings.readonly,
		})
	}

	pub fn size(&self) -> u64 {
		self.size
	}

	pub fn block_size(&self) -> u32 {
		self.block_size
	}

	pub fn readonly(&self) -> bool {
		self.readonly
	}

	pub fn kind(&self) -> NbdBackendKind {
		self.store.lock().unwrap().kind()
	}

	fn check_bounds(&self, offset: u64, length: u64) -> Result<()> {
		let end = offset
			.checked_add(length)
			.ok_or_else(|| Error::InvalidArgument("offset + length overflows".to_string()))?;
		if end > self.size {
			return Err(Error::InvalidArgument(format!(
				"range [{offset}, {end}) exceeds export size {}",
				self.size
			)));
		}
		Ok(())
	}

	/// Positional read of exactly `buf.len()` bytes.
	pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		self.check_bounds(offset, buf.len() as u64)?;
		let store = self.store.lock().unwrap();
		store.read_at(buf, offset)
	}

	/// Positional write of the whole buffer; fails on read-only exports.
	pub fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
		if self.readonly {
			return Err(Error::PermissionDenied {
				path: "read-only export".to_string(),
			});
		}
		self.check_bounds(offset, buf.len() as u64)?;
		let store = self.store.lock().unwrap();
		store.write_at(buf, offset)
	}

	/// Synchronizes buffered writes to durable storage.
	pub fn flush(&self) -> Result<()> {
		let store = self.store.lock().unwrap();
		store.sync()
	}

	/// Best-effort discard. Block devices use the platform discard primitive;
	/// on regular files this is a no-op.
	pub fn trim(&self, offset: u64, length: u64) -> Result<()> {
		self.check_bounds(offset, length)?;
		let store = self.store.lock().unwrap();
		store.discard(offset, length)
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;
	use std::path::Path;

	use super::*;

	fn settings(path: &Path) -> NbdSettings {
		NbdSettings {
			export_path: path.to_str().unwrap().to_string(),
			block_size: 512,
			..NbdSettings::default()
		}
	}

	fn temp_export(len: usize) -> tempfile::NamedTempFile {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(&vec![0u8; len]).unwrap();
		file.flush().unwrap();
		file
	}

	#[test]
	fn classifies_regular_files_and_rounds_to_blocks() {
		let file = temp_export(4096 + 100);
		let backend = Backend::open(&settings(file.path())).unwrap();
		assert_eq!(backend.kind(), NbdBackendKind::File);
		// 4196 rounds down to a whole number of 512-byte blocks.
		assert_eq!(backend.size(), 4096);
	}

	#[test]
	fn write_then_read_round_trips() {
		let file = temp_export(4096);
		let backend = Backend::open(&settings(file.path())).unwrap();

		let pattern: Vec<u8> = (0..4096u32).map(|i| (i & 0xFF) as u8).collect();
		backend.write(&pattern, 0).unwrap();
		backend.flush().unwrap();

		let mut back = vec![0u8; 4096];
		backend.read(&mut back, 0).unwrap();
		assert_eq!(back, pattern);
	}

	#[test]
	fn bounds_are_enforced() {
		let file = temp_export(4096);
		let backend = Backend::open(&settings(file.path())).unwrap();

		let mut buf = [0u8; 512];
		assert!(matches!(
			backend.read(&mut buf, 4096 - 256),
			Err(Error::InvalidArgument(_))
		));
		assert!(matches!(
			backend.read(&mut buf, u64::MAX),
			Err(Error::InvalidArgument(_))
		));
	}

	#[test]
	fn readonly_rejects_writes() {
		let file = temp_export(4096);
		let mut cfg = settings(file.path());
		cfg.readonly = true;
		let backend = Backend::open(&cfg).unwrap();

		assert!(matches!(
			backend.write(&[1u8; 512], 0),
			Err(Error::PermissionDenied { .. })
		));
	}

	#[test]
	fn size_override_caps_the_export() {
		let file = temp_export(8192);
		let mut cfg = settings(file.path());
		cfg.size_override = Some(4096);
		let backend = Backend::open(&cfg).unwrap();
		assert_eq!(backend.size(), 4096);
	}

	#[test]
	fn trim_on_a_file_is_a_no_op() {
		let file = temp_export(4096);
		let backend = Backend::open(&settings(file.path())).unwrap();
		backend.trim(0, 512).unwrap();

		let mut buf = [0u8; 512];
		backend.read(&mut buf, 0).unwrap();
	}

	#[test]
	fn sub_block_export_is_rejected() {
		let file = temp_export(100);
		let err = Backend::open(&settings(file.path())).unwrap_err();
		assert!(matches!(err, Error::InvalidArgument(_)));
	}
}
