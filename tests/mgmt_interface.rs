//! End-to-end tests of the management interface over real sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use xoe::cfgmgr::ConfigManager;
use xoe::config::Configuration;
use xoe::fsm::RuntimeStatus;
use xoe::mgmt;
use xoe::shutdown::{RestartSignal, ShutdownToken};

const PASSWORD: &str = "correct-horse-42";

struct Fixture {
	manager: Arc<ConfigManager>,
	restart: RestartSignal,
	shutdown: ShutdownToken,
	handle: Option<mgmt::Handle>,
	addr: std::net::SocketAddr,
}

impl Fixture {
	fn start() -> Self {
		let config = Configuration {
			// Port 0 binds an ephemeral port for the test.
			mgmt_port: 0,
			mgmt_password: PASSWORD.to_string(),
			..Configuration::default()
		};
		let manager = Arc::new(ConfigManager::new(config));
		let restart = RestartSignal::new();
		let shutdown = ShutdownToken::new();
		let status = Arc::new(RuntimeStatus::new());

		let handle = mgmt::start(
			Arc::clone(&manager),
			restart.clone(),
			shutdown.clone(),
			status,
		)
		.unwrap();
		let addr = handle.addr;

		Self {
			manager,
			restart,
			shutdown,
			handle: Some(handle),
			addr,
		}
	}

	fn connect(&self) -> TcpStream {
		let stream = TcpStream::connect(self.addr).unwrap();
		stream
			.set_read_timeout(Some(Duration::from_secs(5)))
			.unwrap();
		stream
	}
}

impl Drop for Fixture {
	fn drop(&mut self) {
		self.shutdown.request();
		if let Some(handle) = self.handle.take() {
			handle.join();
		}
	}
}

/// Reads until `needle` appears in the accumulated output.
fn read_until(stream: &mut TcpStream, needle: &str) -> String {
	let deadline = Instant::now() + Duration::from_secs(5);
	let mut seen = Vec::new();
	let mut buf = [0u8; 512];

	while Instant::now() < deadline {
		match stream.read(&mut buf) {
			Ok(0) => break,
			Ok(n) => {
				seen.extend_from_slice(&buf[..n]);
				let text = String::from_utf8_lossy(&seen);
				if text.contains(needle) {
					return text.into_owned();
				}
			}
			Err(err)
				if matches!(
					err.kind(),
					std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
				) => {}
			Err(err) => panic!("read failed: {err}"),
		}
	}
	panic!(
		"'{needle}' never arrived; got: {:?}",
		String::from_utf8_lossy(&seen)
	);
}

/// Reads whatever arrives until the peer closes the connection.
fn read_to_close(stream: &mut TcpStream) -> String {
	let mut seen = Vec::new();
	let mut buf = [0u8; 512];
	loop {
		match stream.read(&mut buf) {
			Ok(0) => return String::from_utf8_lossy(&seen).into_owned(),
			Ok(n) => seen.extend_from_slice(&buf[..n]),
			Err(_) => return String::from_utf8_lossy(&seen).into_owned(),
		}
	}
}

fn authenticate(stream: &mut TcpStream) {
	read_until(stream, "Password: ");
	stream.write_all(format!("{PASSWORD}\n").as_bytes()).unwrap();
	read_until(stream, "Authentication successful");
	read_until(stream, "xoe> ");
}

fn command(stream: &mut TcpStream, line: &str, expect: &str) -> String {
	stream.write_all(format!("{line}\n").as_bytes()).unwrap();
	let output = read_until(stream, expect);
	read_until(stream, "xoe> ");
	output
}

#[test]
fn set_validate_restart_raises_the_signal() {
	let fixture = Fixture::start();
	let mut stream = fixture.connect();

	authenticate(&mut stream);

	command(&mut stream, "set port 20000", "port set (pending)");
	assert!(fixture.manager.has_pending());

	let diff = command(&mut stream, "pending", "->");
	assert!(diff.contains("port: 7000 -> 20000"), "diff was: {diff}");

	command(&mut stream, "validate", "pending configuration is valid");

	assert!(!fixture.restart.is_requested());
	command(&mut stream, "restart", "restart scheduled");
	assert!(fixture.restart.is_requested());

	// The session survives the restart request.
	command(&mut stream, "show status", "pending:   yes");

	stream.write_all(b"quit\n").unwrap();
	read_until(&mut stream, "bye");
}

#[test]
fn invalid_pending_configuration_is_reported_and_not_applied() {
	let fixture = Fixture::start();
	let mut stream = fixture.connect();

	authenticate(&mut stream);

	// A client mode without a connect target cannot validate.
	command(&mut stream, "set mode serial", "mode set (pending)");
	command(&mut stream, "restart", "validation failed");
	assert!(!fixture.restart.is_requested());

	command(&mut stream, "clear", "pending changes cleared");
	command(&mut stream, "validate", "pending configuration is valid");
}

#[test]
fn wrong_password_three_times_closes_the_session() {
	let fixture = Fixture::start();
	let mut stream = fixture.connect();

	for _ in 0..3 {
		read_until(&mut stream, "Password: ");
		stream.write_all(b"nope\n").unwrap();
	}
	let rest = read_to_close(&mut stream);
	assert!(!rest.contains("xoe> "), "session reached the prompt: {rest}");
}

#[test]
fn five_failures_lock_out_the_sixth_connection() {
	let fixture = Fixture::start();

	// Connection 1: three wrong passwords.
	let mut first = fixture.connect();
	for _ in 0..3 {
		read_until(&mut first, "Password: ");
		first.write_all(b"wrong\n").unwrap();
		read_until(&mut first, "Authentication failed");
	}
	read_to_close(&mut first);

	// Connection 2: two more, reaching the lockout threshold. Waiting for
	// each rejection guarantees the failure is recorded before moving on.
	let mut second = fixture.connect();
	for _ in 0..2 {
		read_until(&mut second, "Password: ");
		second.write_all(b"wrong\n").unwrap();
		read_until(&mut second, "Authentication failed");
	}
	drop(second);

	// Connection 3 is rejected before any password prompt.
	let mut third = fixture.connect();
	let output = read_to_close(&mut third);
	assert!(
		output.contains("Too many failed attempts"),
		"missing lockout banner: {output}"
	);
	assert!(!output.contains("Password: "), "prompt leaked: {output}");
}

#[test]
fn unknown_command_and_get() {
	let fixture = Fixture::start();
	let mut stream = fixture.connect();

	authenticate(&mut stream);
	command(&mut stream, "frobnicate", "unknown command 'frobnicate'");
	command(&mut stream, "get port", "port = 7000");
	command(&mut stream, "get mode", "mode = server");
	command(&mut stream, "shutdown", "shutdown: not implemented");
}

#[test]
fn show_config_reflects_the_active_configuration() {
	let fixture = Fixture::start();
	let mut stream = fixture.connect();

	authenticate(&mut stream);
	let output = command(&mut stream, "show config", "mgmt port");
	assert!(output.contains("mode:          server"), "output: {output}");
	assert!(output.contains("encryption:    none"), "output: {output}");
}
