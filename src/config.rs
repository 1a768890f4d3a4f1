//! The configuration record that captures the entire desired runtime.
//!
//! One [`Configuration`] value is materialized at boot, mutated by argument
//! parsing, and then owned in duplicate (active/pending) by the configuration
//! manager. Validation is cross-field and names the offending field so that
//! failures are actionable from the command line and the management CLI.

use std::fmt;
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};

use crate::errors::{Error, Result};

/// Default TCP data port.
pub const DEFAULT_PORT: u16 = 7000;
/// Default management port; 0 disables the management interface.
pub const DEFAULT_MGMT_PORT: u16 = 6969;
/// Length of the generated management password.
pub const GENERATED_PASSWORD_LEN: usize = 16;

/// Baud rates the bridge accepts.
pub const BAUD_RATES: [u32; 6] = [9600, 19200, 38400, 57600, 115_200, 230_400];

/// The runtime operating mode selected by the FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Help,
	Server,
	StdClient,
	SerialClient,
	UsbClient,
	NbdServer,
}

impl Role {
	pub fn as_str(&self) -> &'static str {
		match self {
			Role::Help => "help",
			Role::Server => "server",
			Role::StdClient => "client",
			Role::SerialClient => "serial",
			Role::UsbClient => "usb",
			Role::NbdServer => "nbd",
		}
	}

	pub fn parse(s: &str) -> Result<Self> {
		match s {
			"server" => Ok(Role::Server),
			"client" => Ok(Role::StdClient),
			"serial" => Ok(Role::SerialClient),
			"usb" => Ok(Role::UsbClient),
			"nbd" => Ok(Role::NbdServer),
			_ => Err(Error::InvalidArgument(format!("unknown mode '{s}'"))),
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
	#[default]
	None,
	Odd,
	Even,
}

impl Parity {
	pub fn as_str(&self) -> &'static str {
		match self {
			Parity::None => "none",
			Parity::Odd => "odd",
			Parity::Even => "even",
		}
	}

	pub fn parse(s: &str) -> Result<Self> {
		match s {
			"none" => Ok(Parity::None),
			"odd" => Ok(Parity::Odd),
			"even" => Ok(Parity::Even),
			_ => Err(Error::InvalidArgument(format!("unknown parity '{s}'"))),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
	#[default]
	None,
	XonXoff,
	RtsCts,
}

impl FlowControl {
	pub fn as_str(&self) -> &'static str {
		match self {
			FlowControl::None => "none",
			FlowControl::XonXoff => "xonxoff",
			FlowControl::RtsCts => "rtscts",
		}
	}

	pub fn parse(s: &str) -> Result<Self> {
		match s {
			"none" => Ok(FlowControl::None),
			"xonxoff" => Ok(FlowControl::XonXoff),
			"rtscts" => Ok(FlowControl::RtsCts),
			_ => Err(Error::InvalidArgument(format!("unknown flow control '{s}'"))),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encryption {
	#[default]
	None,
	Tls12,
	Tls13,
}

impl Encryption {
	pub fn as_str(&self) -> &'static str {
		match self {
			Encryption::None => "none",
			Encryption::Tls12 => "tls12",
			Encryption::Tls13 => "tls13",
		}
	}

	pub fn parse(s: &str) -> Result<Self> {
		match s {
			"none" => Ok(Encryption::None),
			"tls12" => Ok(Encryption::Tls12),
			"tls13" => Ok(Encryption::Tls13),
			_ => Err(Error::InvalidArgument(format!("unknown encryption mode '{s}'"))),
		}
	}

	pub fn is_enabled(&self) -> bool {
		*self != Encryption::None
	}
}

/// Serial line parameters for the bridge's UART side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
	pub device: String,
	pub baud: u32,
	pub data_bits: u8,
	pub stop_bits: u8,
	pub parity: Parity,
	pub flow: FlowControl,
	/// UART read timeout in milliseconds.
	pub timeout_ms: u32,
}

impl Default for SerialSettings {
	fn default() -> Self {
		Self {
			device: String::new(),
			baud: 115_200,
			data_bits: 8,
			stop_bits: 1,
			parity: Parity::None,
			flow: FlowControl::None,
			timeout_ms: 100,
		}
	}
}

/// One USB device the bridge may attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbDeviceSpec {
	pub vendor_id: u16,
	pub product_id: u16,
	pub interface: u8,
	pub ep_in: u8,
	pub ep_out: u8,
	pub ep_int: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NbdBackendKind {
	#[default]
	Auto,
	File,
	Zvol,
	Device,
}

impl NbdBackendKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			NbdBackendKind::Auto => "auto",
			NbdBackendKind::File => "file",
			NbdBackendKind::Zvol => "zvol",
			NbdBackendKind::Device => "device",
		}
	}

	pub fn parse(s: &str) -> Result<Self> {
		match s {
			"auto" => Ok(NbdBackendKind::Auto),
			"file" => Ok(NbdBackendKind::File),
			"zvol" => Ok(NbdBackendKind::Zvol),
			"device" => Ok(NbdBackendKind::Device),
			_ => Err(Error::InvalidArgument(format!("unknown backend kind '{s}'"))),
		}
	}
}

/// Export parameters for the NBD server role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdSettings {
	pub export_path: String,
	/// Export name offered to clients, at most [`NBD_NAME_MAX`] bytes.
	pub export_name: String,
	pub backend: NbdBackendKind,
	/// Power of two in `[512, 65536]`.
	pub block_size: u32,
	/// Overrides the backend-derived size; must be a multiple of `block_size`.
	pub size_override: Option<u64>,
	pub max_connections: u8,
	pub flush: bool,
	pub trim: bool,
	pub readonly: bool,
}

/// Upper bound on the NBD export name.
pub const NBD_NAME_MAX: usize = 64;

impl Default for NbdSettings {
	fn default() -> Self {
		Self {
			export_path: String::new(),
			export_name: "default".to_string(),
			backend: NbdBackendKind::Auto,
			block_size: 4096,
			size_override: None,
			max_connections: 1,
			flush: true,
			trim: true,
			readonly: false,
		}
	}
}

/// A single value capturing the entire desired runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
	pub role: Role,
	/// `None` listens on all interfaces.
	pub listen_addr: Option<Ipv4Addr>,
	pub listen_port: u16,
	pub connect_host: Option<String>,
	pub connect_port: u16,
	pub serial: SerialSettings,
	pub usb_devices: Vec<UsbDeviceSpec>,
	pub nbd: NbdSettings,
	pub encryption: Encryption,
	pub cert_path: Option<PathBuf>,
	pub key_path: Option<PathBuf>,
	pub mgmt_port: u16,
	pub mgmt_password: String,
}

impl Default for Configuration {
	fn default() -> Self {
		Self {
			role: Role::Server,
			listen_addr: None,
			listen_port: DEFAULT_PORT,
			connect_host: None,
			connect_port: 0,
			serial: SerialSettings::default(),
			usb_devices: Vec::new(),
			nbd: NbdSettings::default(),
			encryption: Encryption::None,
			cert_path: None,
			key_path: None,
			mgmt_port: DEFAULT_MGMT_PORT,
			mgmt_password: String::new(),
		}
	}
}

/// Serial device paths must be absolute, live under `/dev/`, and contain no
/// parent-directory components.
pub fn device_path_ok(path: &str) -> bool {
	let p = Path::new(path);
	p.is_absolute()
		&& path.starts_with("/dev/")
		&& path.len() > "/dev/".len()
		&& p.components().all(|c| !matches!(c, Component::ParentDir))
}

fn readable(path: &Path) -> bool {
	File::open(path).is_ok()
}

impl Configuration {
	/// Cross-field validation. Returns the first violation found, naming the
	/// offending field.
	pub fn validate(&self) -> Result<()> {
		let invalid = |msg: String| Err(Error::InvalidArgument(msg));

		match self.role {
			Role::Help => return Ok(()),
			Role::Server | Role::NbdServer => {
				if self.listen_port == 0 {
					return invalid("listen port must be 1..65535".to_string());
				}
			}
			Role::StdClient | Role::SerialClient | Role::UsbClient => {
				if self.connect_host.is_none() {
					return invalid(format!(
						"mode '{}' requires a connect target (-c host:port)",
						self.role
					));
				}
				if self.connect_port == 0 {
					return invalid("connect port must be 1..65535".to_string());
				}
			}
		}

		if self.role == Role::SerialClient {
			let serial = &self.serial;
			if !device_path_ok(&serial.device) {
				return invalid(format!(
					"serial device '{}' must be an absolute /dev/ path without '..'",
					serial.device
				));
			}
			if !BAUD_RATES.contains(&serial.baud) {
				return invalid(format!("unsupported baud rate {}", serial.baud));
			}
			if !matches!(serial.data_bits, 7 | 8) {
				return invalid(format!("data bits must be 7 or 8, got {}", serial.data_bits));
			}
			if !matches!(serial.stop_bits, 1 | 2) {
				return invalid(format!("stop bits must be 1 or 2, got {}", serial.stop_bits));
			}
		}

		if self.role == Role::UsbClient && self.usb_devices.is_empty() {
			return invalid("usb mode requires at least one -u vid:pid device".to_string());
		}

		if self.role == Role::NbdServer {
			let nbd = &self.nbd;
			if nbd.export_path.is_empty() {
				return invalid("nbd export path is required".to_string());
			}
			if !readable(Path::new(&nbd.export_path)) {
				return invalid(format!("nbd export '{}' is not readable", nbd.export_path));
			}
			if nbd.export_name.len() > NBD_NAME_MAX {
				return invalid(format!(
					"nbd export name exceeds {NBD_NAME_MAX} bytes ({})",
					nbd.export_name.len()
				));
			}
			if !nbd.block_size.is_power_of_two() || !(512..=65536).contains(&nbd.block_size) {
				return invalid(format!(
					"nbd block size must be a power of two in [512, 65536], got {}",
					nbd.block_size
				));
			}
			if let Some(size) = nbd.size_override {
				if size == 0 || size % u64::from(nbd.block_size) != 0 {
					return invalid(format!(
						"nbd size override {size} is not a multiple of the block size"
					));
				}
			}
			if !(1..=32).contains(&nbd.max_connections) {
				return invalid(format!(
					"nbd max connections must be 1..32, got {}",
					nbd.max_connections
				));
			}
		}

		if self.encryption.is_enabled() {
			let Some(cert) = self.cert_path.as_deref() else {
				return invalid("encryption enabled but no --cert given".to_string());
			};
			let Some(key) = self.key_path.as_deref() else {
				return invalid("encryption enabled but no --key given".to_string());
			};
			if !readable(cert) {
				return invalid(format!("certificate '{}' is not readable", cert.display()));
			}
			if !readable(key) {
				return invalid(format!("private key '{}' is not readable", key.display()));
			}
		}

		if self.mgmt_port != 0 && self.mgmt_password.is_empty() {
			return invalid("management interface enabled but password is empty".to_string());
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base() -> Configuration {
		Configuration {
			mgmt_password: "secret".to_string(),
			..Configuration::default()
		}
	}

	#[test]
	fn default_server_config_validates() {
		base().validate().unwrap();
	}

	#[test]
	fn client_without_target_is_rejected() {
		let cfg = Configuration {
			role: Role::StdClient,
			..base()
		};
		let err = cfg.validate().unwrap_err();
		assert!(err.to_string().contains("connect target"));
	}

	#[test]
	fn serial_device_path_sanity() {
		assert!(device_path_ok("/dev/ttyS0"));
		assert!(device_path_ok("/dev/serial/by-id/usb-0001"));
		assert!(!device_path_ok("/dev/"));
		assert!(!device_path_ok("/tmp/ttyS0"));
		assert!(!device_path_ok("dev/ttyS0"));
		assert!(!device_path_ok("/dev/../etc/passwd"));
	}

	#[test]
	fn serial_client_checks_line_parameters() {
		let mut cfg = Configuration {
			role: Role::SerialClient,
			connect_host: Some("localhost".to_string()),
			connect_port: 7000,
			..base()
		};
		cfg.serial.device = "/dev/ttyUSB0".to_string();
		cfg.validate().unwrap();

		cfg.serial.baud = 1200;
		assert!(cfg.validate().is_err());
		cfg.serial.baud = 9600;
		cfg.serial.data_bits = 9;
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn nbd_block_size_must_be_power_of_two() {
		let file = tempfile::NamedTempFile::new().unwrap();
		let mut cfg = Configuration {
			role: Role::NbdServer,
			..base()
		};
		cfg.nbd.export_path = file.path().to_str().unwrap().to_string();
		cfg.validate().unwrap();

		cfg.nbd.block_size = 3000;
		assert!(cfg.validate().is_err());
		cfg.nbd.block_size = 131_072;
		assert!(cfg.validate().is_err());
		cfg.nbd.block_size = 512;
		cfg.nbd.size_override = Some(513);
		assert!(cfg.validate().is_err());
		cfg.nbd.size_override = Some(5120);
		cfg.validate().unwrap();
	}

	#[test]
	fn tls_requires_readable_credentials() {
		let cfg = Configuration {
			encryption: Encryption::Tls13,
			..base()
		};
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn mgmt_requires_password() {
		let cfg = Configuration::default();
		assert!(cfg.validate().is_err());

		let cfg = Configuration {
			mgmt_port: 0,
			..Configuration::default()
		};
		cfg.validate().unwrap();
	}
}
