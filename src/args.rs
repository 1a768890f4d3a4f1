//! Command-line parsing.
//!
//! This is a thin layer over `clap` that fills in the [`Configuration`]
//! record. The role is inferred from the options given: a connect target makes
//! a client, a serial device or USB spec narrows the client kind, and an NBD
//! export makes the NBD server. No options at all means plain server mode.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::{Configuration, Encryption, FlowControl, Parity, Role, UsbDeviceSpec};
use crate::errors::{Error, Result};

/// What the FSM should do after parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	Run,
	/// `--list-usb` or `--help`: output was produced, exit successfully.
	Done,
}

#[derive(Debug, Parser)]
#[command(
	name = "xoe",
	version,
	about = "Bridge serial ports, USB endpoints, and block storage over TCP"
)]
struct Cli {
	/// Listen address (default: all interfaces)
	#[arg(short = 'i', value_name = "ADDR")]
	listen: Option<Ipv4Addr>,

	/// Listen port
	#[arg(short = 'p', value_name = "PORT")]
	port: Option<u16>,

	/// Connect target; selects a client mode
	#[arg(short = 'c', value_name = "HOST:PORT")]
	connect: Option<String>,

	/// Encryption mode: none, tls12, tls13
	#[arg(short = 'e', value_name = "MODE")]
	encryption: Option<String>,

	/// Serial device to bridge; selects the serial client
	#[arg(short = 's', value_name = "DEVICE")]
	serial: Option<String>,

	/// Serial baud rate
	#[arg(short = 'b', value_name = "BAUD")]
	baud: Option<u32>,

	/// USB device to bridge (repeatable); selects the USB client
	#[arg(short = 'u', value_name = "VID:PID")]
	usb: Vec<String>,

	/// TLS certificate path (PEM)
	#[arg(long, value_name = "PATH")]
	cert: Option<PathBuf>,

	/// TLS private key path (PEM)
	#[arg(long, value_name = "PATH")]
	key: Option<PathBuf>,

	/// Serial parity: none, even, odd
	#[arg(long, value_name = "PARITY")]
	parity: Option<String>,

	/// Serial data bits: 7 or 8
	#[arg(long, value_name = "BITS")]
	databits: Option<u8>,

	/// Serial stop bits: 1 or 2
	#[arg(long, value_name = "BITS")]
	stopbits: Option<u8>,

	/// Serial flow control: none, xonxoff, rtscts
	#[arg(long, value_name = "FLOW")]
	flow: Option<String>,

	/// Serial read timeout in milliseconds
	#[arg(long, value_name = "MS")]
	timeout: Option<u32>,

	/// USB interface number for the listed devices
	#[arg(long, value_name = "N")]
	interface: Option<u8>,

	/// USB bulk-in endpoint (hex)
	#[arg(long, value_name = "HEX")]
	ep_in: Option<String>,

	/// USB bulk-out endpoint (hex)
	#[arg(long, value_name = "HEX")]
	ep_out: Option<String>,

	/// USB interrupt endpoint (hex)
	#[arg(long, value_name = "HEX")]
	ep_int: Option<String>,

	/// List visible USB devices and exit
	#[arg(long)]
	list_usb: bool,

	/// Serve this file or block device over NBD
	#[arg(long, value_name = "PATH")]
	nbd: Option<String>,

	/// NBD export name
	#[arg(long, value_name = "NAME")]
	nbd_name: Option<String>,

	/// NBD backend kind: auto, file, zvol, device
	#[arg(long, value_name = "KIND")]
	nbd_backend: Option<String>,

	/// NBD block size (power of two in [512, 65536])
	#[arg(long, value_name = "BYTES")]
	nbd_block_size: Option<u32>,

	/// Override the exported size in bytes
	#[arg(long, value_name = "BYTES")]
	nbd_size: Option<u64>,

	/// Maximum NBD connections (1..32)
	#[arg(long, value_name = "N")]
	nbd_connections: Option<u8>,

	/// Export read-only
	#[arg(long)]
	nbd_readonly: bool,

	/// Do not advertise flush support
	#[arg(long)]
	nbd_no_flush: bool,

	/// Do not advertise trim support
	#[arg(long)]
	nbd_no_trim: bool,

	/// Management port (0 disables the management interface)
	#[arg(long, value_name = "PORT")]
	mgmt_port: Option<u16>,

	/// Management password (default: generated at boot)
	#[arg(long, value_name = "PASSWORD")]
	mgmt_password: Option<String>,
}

/// Splits `host:port`, allowing a bare host to default its port later.
pub fn parse_host_port(s: &str) -> Result<(String, u16)> {
	let Some((host, port)) = s.rsplit_once(':') else {
		return Err(Error::InvalidArgument(format!(
			"connect target '{s}' must be host:port"
		)));
	};
	if host.is_empty() {
		return Err(Error::InvalidArgument(format!(
			"connect target '{s}' has an empty host"
		)));
	}
	let port = port
		.parse::<u16>()
		.map_err(|_| Error::InvalidArgument(format!("invalid port in '{s}'")))?;
	Ok((host.to_string(), port))
}

/// Parses a `vid:pid` pair of hex identifiers.
pub fn parse_usb_id(s: &str) -> Result<(u16, u16)> {
	let Some((vid, pid)) = s.split_once(':') else {
		return Err(Error::InvalidArgument(format!(
			"usb device '{s}' must be vid:pid"
		)));
	};
	let parse = |v: &str| {
		let v = v.trim_start_matches("0x");
		u16::from_str_radix(v, 16)
			.map_err(|_| Error::InvalidArgument(format!("invalid hex id in '{s}'")))
	};
	Ok((parse(vid)?, parse(pid)?))
}

fn parse_hex_u8(s: &str, what: &str) -> Result<u8> {
	let v = s.trim_start_matches("0x");
	u8::from_str_radix(v, 16)
		.map_err(|_| Error::InvalidArgument(format!("invalid hex {what} '{s}'")))
}

/// Applies argv to `config`. Parse failures and help rendering are handled
/// here; the caller only distinguishes run, done, and error.
pub fn apply<I, T>(config: &mut Configuration, argv: I) -> Result<Outcome>
where
	I: IntoIterator<Item = T>,
	T: Into<std::ffi::OsString> + Clone,
{
	let cli = match Cli::try_parse_from(argv) {
		Ok(cli) => cli,
		Err(err) if err.use_stderr() => {
			return Err(Error::InvalidArgument(err.to_string()));
		}
		Err(err) => {
			// --help / --version render to stdout and are a successful exit.
			print!("{err}");
			return Ok(Outcome::Done);
		}
	};

	if cli.list_usb {
		crate::usb::print_device_list()?;
		return Ok(Outcome::Done);
	}

	if let Some(addr) = cli.listen {
		config.listen_addr = Some(addr);
	}
	if let Some(port) = cli.port {
		config.listen_port = port;
	}
	if let Some(target) = cli.connect.as_deref() {
		let (host, port) = parse_host_port(target)?;
		config.connect_host = Some(host);
		config.connect_port = port;
	}
	if let Some(mode) = cli.encryption.as_deref() {
		config.encryption = Encryption::parse(mode)?;
	}
	config.cert_path = cli.cert.or(config.cert_path.take());
	config.key_path = cli.key.or(config.key_path.take());

	if let Some(device) = cli.serial {
		config.serial.device = device;
	}
	if let Some(baud) = cli.baud {
		config.serial.baud = baud;
	}
	if let Some(parity) = cli.parity.as_deref() {
		config.serial.parity = Parity::parse(parity)?;
	}
	if let Some(bits) = cli.databits {
		config.serial.data_bits = bits;
	}
	if let Some(bits) = cli.stopbits {
		config.serial.stop_bits = bits;
	}
	if let Some(flow) = cli.flow.as_deref() {
		config.serial.flow = FlowControl::parse(flow)?;
	}
	if let Some(ms) = cli.timeout {
		config.serial.timeout_ms = ms;
	}

	let interface = cli.interface.unwrap_or(0);
	let ep_in = cli.ep_in.as_deref().map(|s| parse_hex_u8(s, "endpoint")).transpose()?;
	let ep_out = cli.ep_out.as_deref().map(|s| parse_hex_u8(s, "endpoint")).transpose()?;
	let ep_int = cli.ep_int.as_deref().map(|s| parse_hex_u8(s, "endpoint")).transpose()?;
	for spec in &cli.usb {
		let (vendor_id, product_id) = parse_usb_id(spec)?;
		config.usb_devices.push(UsbDeviceSpec {
			vendor_id,
			product_id,
			interface,
			ep_in: ep_in.unwrap_or(0x81),
			ep_out: ep_out.unwrap_or(0x01),
			ep_int: ep_int.unwrap_or(0),
		});
	}

	if let Some(path) = cli.nbd {
		config.nbd.export_path = path;
	}
	if let Some(name) = cli.nbd_name {
		config.nbd.export_name = name;
	}
	if let Some(kind) = cli.nbd_backend.as_deref() {
		config.nbd.backend = crate::config::NbdBackendKind::parse(kind)?;
	}
	if let Some(size) = cli.nbd_block_size {
		config.nbd.block_size = size;
	}
	if let Some(size) = cli.nbd_size {
		config.nbd.size_override = Some(size);
	}
	if let Some(n) = cli.nbd_connections {
		config.nbd.max_connections = n;
	}
	if cli.nbd_readonly {
		config.nbd.readonly = true;
	}
	if cli.nbd_no_flush {
		config.nbd.flush = false;
	}
	if cli.nbd_no_trim {
		config.nbd.trim = false;
	}

	if let Some(port) = cli.mgmt_port {
		config.mgmt_port = port;
	}
	if let Some(password) = cli.mgmt_password {
		config.mgmt_password = password;
	}

	// Role inference: an NBD export or a connect target narrows the role;
	// otherwise the bridge is a plain accept server.
	config.role = if !config.nbd.export_path.is_empty() {
		Role::NbdServer
	} else if config.connect_host.is_some() {
		if !config.serial.device.is_empty() {
			Role::SerialClient
		} else if !config.usb_devices.is_empty() {
			Role::UsbClient
		} else {
			Role::StdClient
		}
	} else {
		Role::Server
	};

	Ok(Outcome::Run)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn apply_args(args: &[&str]) -> (Configuration, Outcome) {
		let mut config = Configuration::default();
		let mut argv = vec!["xoe"];
		argv.extend_from_slice(args);
		let outcome = apply(&mut config, argv).unwrap();
		(config, outcome)
	}

	#[test]
	fn no_arguments_is_server_mode() {
		let (config, outcome) = apply_args(&[]);
		assert_eq!(outcome, Outcome::Run);
		assert_eq!(config.role, Role::Server);
		assert_eq!(config.listen_port, crate::config::DEFAULT_PORT);
	}

	#[test]
	fn connect_target_selects_std_client() {
		let (config, _) = apply_args(&["-c", "bridge.example:7000"]);
		assert_eq!(config.role, Role::StdClient);
		assert_eq!(config.connect_host.as_deref(), Some("bridge.example"));
		assert_eq!(config.connect_port, 7000);
	}

	#[test]
	fn serial_device_selects_serial_client() {
		let (config, _) = apply_args(&[
			"-c",
			"10.0.0.1:7000",
			"-s",
			"/dev/ttyUSB0",
			"-b",
			"9600",
			"--parity",
			"even",
			"--stopbits",
			"2",
		]);
		assert_eq!(config.role, Role::SerialClient);
		assert_eq!(config.serial.device, "/dev/ttyUSB0");
		assert_eq!(config.serial.baud, 9600);
		assert_eq!(config.serial.parity, Parity::Even);
		assert_eq!(config.serial.stop_bits, 2);
	}

	#[test]
	fn usb_spec_selects_usb_client() {
		let (config, _) = apply_args(&[
			"-c",
			"10.0.0.1:7000",
			"-u",
			"0403:6001",
			"--interface",
			"1",
			"--ep-in",
			"81",
			"--ep-out",
			"02",
		]);
		assert_eq!(config.role, Role::UsbClient);
		assert_eq!(config.usb_devices.len(), 1);
		let dev = &config.usb_devices[0];
		assert_eq!(dev.vendor_id, 0x0403);
		assert_eq!(dev.product_id, 0x6001);
		assert_eq!(dev.interface, 1);
		assert_eq!(dev.ep_in, 0x81);
		assert_eq!(dev.ep_out, 0x02);
	}

	#[test]
	fn nbd_export_selects_nbd_server() {
		let (config, _) = apply_args(&["--nbd", "/tmp/disk.img", "--nbd-readonly"]);
		assert_eq!(config.role, Role::NbdServer);
		assert_eq!(config.nbd.export_path, "/tmp/disk.img");
		assert!(config.nbd.readonly);
	}

	#[test]
	fn bad_host_port_is_rejected() {
		let mut config = Configuration::default();
		let err = apply(&mut config, ["xoe", "-c", "noport"]).unwrap_err();
		assert!(err.to_string().contains("host:port"));
	}

	#[test]
	fn unknown_flag_is_a_parse_error() {
		let mut config = Configuration::default();
		assert!(apply(&mut config, ["xoe", "--frobnicate"]).is_err());
	}
}
