//! Wire-level tests of the NBD Fixed-Newstyle session against a file export.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

use xoe::config::NbdSettings;
use xoe::nbd::backend::Backend;
use xoe::nbd::{self, session};

const EXPORT_SIZE: usize = 1024 * 1024;

fn temp_export() -> tempfile::NamedTempFile {
	let mut file = tempfile::NamedTempFile::new().unwrap();
	file.write_all(&vec![0u8; EXPORT_SIZE]).unwrap();
	file.flush().unwrap();
	file
}

fn settings(path: &std::path::Path, readonly: bool) -> NbdSettings {
	NbdSettings {
		export_path: path.to_str().unwrap().to_string(),
		export_name: "default".to_string(),
		block_size: 512,
		readonly,
		..NbdSettings::default()
	}
}

/// Starts a single-session server and returns a connected client socket.
fn start_session(readonly: bool) -> (TcpStream, JoinHandle<()>, tempfile::NamedTempFile) {
	let export = temp_export();
	let settings = settings(export.path(), readonly);

	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = listener.local_addr().unwrap();

	let server = thread::spawn(move || {
		let (socket, _) = listener.accept().unwrap();
		let mut stream = xoe::net::Stream::Plain(socket);
		let backend = Backend::open(&settings).unwrap();
		session::run(&mut stream, &backend, &settings).unwrap();
	});

	(TcpStream::connect(addr).unwrap(), server, export)
}

fn handshake(client: &mut TcpStream) -> (u64, u16) {
	// Server greeting: NBDMAGIC, IHAVEOPT, handshake flags.
	let mut greeting = [0u8; 18];
	client.read_exact(&mut greeting).unwrap();
	assert_eq!(&greeting[0..8], b"NBDMAGIC");
	assert_eq!(&greeting[8..16], b"IHAVEOPT");
	let handshake_flags = u16::from_be_bytes(greeting[16..18].try_into().unwrap());
	assert_eq!(handshake_flags & 0x0001, 0x0001, "FIXED_NEWSTYLE missing");

	// Client flags, then NBD_OPT_EXPORT_NAME.
	client.write_all(&0x0000_0001u32.to_be_bytes()).unwrap();
	let name = b"/tmp/test.img";
	client.write_all(&nbd::IHAVEOPT.to_be_bytes()).unwrap();
	client.write_all(&1u32.to_be_bytes()).unwrap();
	client.write_all(&(name.len() as u32).to_be_bytes()).unwrap();
	client.write_all(name).unwrap();

	// Export info: size, transmission flags, 124 reserved zero bytes.
	let mut info = [0u8; 8 + 2 + 124];
	client.read_exact(&mut info).unwrap();
	let size = u64::from_be_bytes(info[0..8].try_into().unwrap());
	let flags = u16::from_be_bytes(info[8..10].try_into().unwrap());
	assert_eq!(flags & 0x0001, 0x0001, "HAS_FLAGS missing");
	assert!(info[10..].iter().all(|&b| b == 0), "reserved bytes not zero");

	(size, flags)
}

fn send_request(client: &mut TcpStream, command: u16, cookie: u64, offset: u64, length: u32) {
	let mut raw = [0u8; 28];
	raw[0..4].copy_from_slice(&nbd::REQUEST_MAGIC.to_be_bytes());
	raw[6..8].copy_from_slice(&command.to_be_bytes());
	raw[8..16].copy_from_slice(&cookie.to_be_bytes());
	raw[16..24].copy_from_slice(&offset.to_be_bytes());
	raw[24..28].copy_from_slice(&length.to_be_bytes());
	client.write_all(&raw).unwrap();
}

fn read_reply(client: &mut TcpStream, cookie: u64) -> u32 {
	let mut raw = [0u8; 16];
	client.read_exact(&mut raw).unwrap();
	assert_eq!(
		u32::from_be_bytes(raw[0..4].try_into().unwrap()),
		0x6744_6698
	);
	assert_eq!(u64::from_be_bytes(raw[8..16].try_into().unwrap()), cookie);
	u32::from_be_bytes(raw[4..8].try_into().unwrap())
}

fn disconnect(client: &mut TcpStream, server: JoinHandle<()>) {
	send_request(client, 2, 0xdead, 0, 0);
	server.join().unwrap();
}

#[test]
fn handshake_and_first_read() {
	let (mut client, server, _export) = start_session(false);

	let (size, _flags) = handshake(&mut client);
	assert_eq!(size, EXPORT_SIZE as u64);

	send_request(&mut client, 0, 0x1001, 0, 4096);
	assert_eq!(read_reply(&mut client, 0x1001), 0);
	let mut data = vec![0u8; 4096];
	client.read_exact(&mut data).unwrap();
	assert!(data.iter().all(|&b| b == 0));

	disconnect(&mut client, server);
}

#[test]
fn write_then_read_back_is_byte_identical() {
	let (mut client, server, _export) = start_session(false);
	handshake(&mut client);

	let pattern: Vec<u8> = (0..4096u32).map(|i| (i & 0xFF) as u8).collect();
	send_request(&mut client, 1, 0x2001, 0, 4096);
	client.write_all(&pattern).unwrap();
	assert_eq!(read_reply(&mut client, 0x2001), 0);

	send_request(&mut client, 3, 0x2002, 0, 0);
	assert_eq!(read_reply(&mut client, 0x2002), 0);

	send_request(&mut client, 0, 0x2003, 0, 4096);
	assert_eq!(read_reply(&mut client, 0x2003), 0);
	let mut back = vec![0u8; 4096];
	client.read_exact(&mut back).unwrap();
	assert_eq!(back, pattern);

	disconnect(&mut client, server);
}

#[test]
fn out_of_bounds_read_is_einval() {
	let (mut client, server, _export) = start_session(false);
	handshake(&mut client);

	send_request(&mut client, 0, 0x3001, (EXPORT_SIZE - 1024) as u64, 4096);
	assert_eq!(read_reply(&mut client, 0x3001), 22);

	// The session stays usable afterwards.
	send_request(&mut client, 0, 0x3002, 0, 512);
	assert_eq!(read_reply(&mut client, 0x3002), 0);
	let mut data = vec![0u8; 512];
	client.read_exact(&mut data).unwrap();

	disconnect(&mut client, server);
}

#[test]
fn write_to_readonly_export_is_eperm() {
	let (mut client, server, _export) = start_session(true);
	let (_, flags) = handshake(&mut client);
	assert_eq!(flags & 0x0002, 0x0002, "READ_ONLY missing");

	send_request(&mut client, 1, 0x4001, 0, 512);
	client.write_all(&[0xAAu8; 512]).unwrap();
	assert_eq!(read_reply(&mut client, 0x4001), 1);

	disconnect(&mut client, server);
}

#[test]
fn trim_is_accepted_on_files() {
	let (mut client, server, _export) = start_session(false);
	handshake(&mut client);

	send_request(&mut client, 4, 0x5001, 4096, 8192);
	assert_eq!(read_reply(&mut client, 0x5001), 0);

	disconnect(&mut client, server);
}

#[test]
fn unknown_command_is_einval_and_session_survives() {
	let (mut client, server, _export) = start_session(false);
	handshake(&mut client);

	send_request(&mut client, 9, 0x6001, 0, 0);
	assert_eq!(read_reply(&mut client, 0x6001), 22);

	disconnect(&mut client, server);
}
