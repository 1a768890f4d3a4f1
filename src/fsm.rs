//! The lifecycle state machine driving the whole binary.
//!
//! A single driver loop iterates over typed states until `Exit`. Role states
//! run their internal event loops and come back with a [`RoleExit`]; the
//! restart path goes through `ModeStop` and `ApplyConfig` before landing in
//! `ModeSelect` again with the freshly applied configuration.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{error, info, warn};

use crate::args::{self, Outcome};
use crate::cfgmgr::ConfigManager;
use crate::config::{Configuration, Role, GENERATED_PASSWORD_LEN};
use crate::shutdown::{self, RestartSignal, ShutdownToken};
use crate::{entropy, mgmt, nbd, net, serial, usb};

/// Why a role loop returned to the FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleExit {
	Shutdown,
	Restart,
}

/// Runtime facts the management interface reports but does not own.
pub struct RuntimeStatus {
	started: Instant,
	role: Mutex<Role>,
	clients: Mutex<Vec<(usize, SocketAddr)>>,
}

impl RuntimeStatus {
	pub fn new() -> Self {
		Self {
			started: Instant::now(),
			role: Mutex::new(Role::Help),
			clients: Mutex::new(Vec::new()),
		}
	}

	pub fn uptime_secs(&self) -> u64 {
		self.started.elapsed().as_secs()
	}

	pub fn role(&self) -> Role {
		*self.role.lock().unwrap()
	}

	pub fn set_role(&self, role: Role) {
		*self.role.lock().unwrap() = role;
	}

	pub fn clients(&self) -> Vec<(usize, SocketAddr)> {
		self.clients.lock().unwrap().clone()
	}

	pub fn set_clients(&self, clients: Vec<(usize, SocketAddr)>) {
		*self.clients.lock().unwrap() = clients;
	}
}

impl Default for RuntimeStatus {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
	Init,
	ParseArgs,
	ValidateConfig,
	StartMgmt,
	ModeSelect,
	RunRole(Role),
	ModeStop,
	ApplyConfig,
	Cleanup,
	Exit,
}

struct Driver {
	config: Configuration,
	manager: Option<Arc<ConfigManager>>,
	mgmt: Option<mgmt::Handle>,
	shutdown: ShutdownToken,
	restart: RestartSignal,
	status: Arc<RuntimeStatus>,
	generated_password: Option<String>,
	exit_code: i32,
}

/// Runs the bridge to completion and returns the process exit code.
pub fn run(argv: Vec<String>) -> i32 {
	let mut driver = Driver {
		config: Configuration::default(),
		manager: None,
		mgmt: None,
		shutdown: ShutdownToken::new(),
		restart: RestartSignal::new(),
		status: Arc::new(RuntimeStatus::new()),
		generated_password: None,
		exit_code: 0,
	};

	let mut state = State::Init;
	loop {
		state = match state {
			State::Init => driver.init(),
			State::ParseArgs => driver.parse_args(&argv),
			State::ValidateConfig => driver.validate_config(),
			State::StartMgmt => driver.start_mgmt(),
			State::ModeSelect => driver.mode_select(),
			State::RunRole(role) => driver.run_role(role),
			State::ModeStop => driver.mode_stop(),
			State::ApplyConfig => driver.apply_config(),
			State::Cleanup => driver.cleanup(),
			State::Exit => break,
		};
	}

	driver.exit_code
}

impl Driver {
	fn init(&mut self) -> State {
		if let Err(err) = shutdown::install_signal_handlers(&self.shutdown) {
			warn!("cannot install signal handlers: {err}");
		}

		if self.config.mgmt_password.is_empty() {
			let password = entropy::alphanumeric(GENERATED_PASSWORD_LEN);
			self.config.mgmt_password = password.clone();
			self.generated_password = Some(password);
		}

		State::ParseArgs
	}

	fn parse_args(&mut self, argv: &[String]) -> State {
		match args::apply(&mut self.config, argv.iter().map(String::as_str)) {
			Ok(Outcome::Run) => State::ValidateConfig,
			Ok(Outcome::Done) => State::Cleanup,
			Err(err) => {
				eprintln!("{err}");
				self.exit_code = 2;
				State::Cleanup
			}
		}
	}

	fn validate_config(&mut self) -> State {
		match self.config.validate() {
			Ok(()) => State::StartMgmt,
			Err(err) => {
				eprintln!("configuration error: {err}");
				self.exit_code = 1;
				State::Cleanup
			}
		}
	}

	fn start_mgmt(&mut self) -> State {
		let manager = Arc::new(ConfigManager::new(self.config.clone()));
		self.manager = Some(Arc::clone(&manager));

		if self.config.mgmt_port != 0 {
			if self.generated_password.as_deref() == Some(self.config.mgmt_password.as_str()) {
				info!("generated management password: {}", self.config.mgmt_password);
			}
			match mgmt::start(
				manager,
				self.restart.clone(),
				self.shutdown.clone(),
				Arc::clone(&self.status),
			) {
				Ok(handle) => {
					info!("management interface on 127.0.0.1:{}", handle.addr.port());
					self.mgmt = Some(handle);
				}
				// Degrade gracefully: the bridge runs without management.
				Err(err) => warn!("management interface unavailable: {err}"),
			}
		}

		State::ModeSelect
	}

	fn mode_select(&mut self) -> State {
		self.status.set_role(self.config.role);
		match self.config.role {
			Role::Help => State::Cleanup,
			role => State::RunRole(role),
		}
	}

	fn run_role(&mut self, role: Role) -> State {
		info!("entering {role} mode");
		let result = match role {
			Role::Server => net::server::run(&self.config, &self.shutdown, &self.restart, &self.status),
			Role::StdClient => net::client::run(&self.config, &self.shutdown, &self.restart),
			Role::SerialClient => serial::bridge::run(&self.config, &self.shutdown, &self.restart),
			Role::UsbClient => usb::run(&self.config, &self.shutdown, &self.restart),
			Role::NbdServer => nbd::server::run(&self.config, &self.shutdown, &self.restart),
			Role::Help => unreachable!("help never runs a role loop"),
		};

		match result {
			Ok(RoleExit::Restart) => State::ModeStop,
			Ok(RoleExit::Shutdown) => State::Cleanup,
			Err(err) => {
				error!("{role} mode failed: {err}");
				self.exit_code = 1;
				State::Cleanup
			}
		}
	}

	fn mode_stop(&mut self) -> State {
		// Role loops have already drained their workers by the time they
		// return; what remains is clearing the restart edge.
		self.restart.clear();
		State::ApplyConfig
	}

	fn apply_config(&mut self) -> State {
		let Some(manager) = self.manager.as_ref() else {
			return State::Cleanup;
		};

		match manager.validate_pending() {
			Ok(()) => {
				self.config = manager.apply_pending();
				self.restart.clear();
				info!("applied pending configuration");
				State::ModeSelect
			}
			Err(err) => {
				// The restart command validated this configuration moments
				// ago; failing here means the environment changed under us.
				error!("pending configuration no longer valid: {err}");
				self.exit_code = 1;
				State::Cleanup
			}
		}
	}

	fn cleanup(&mut self) -> State {
		self.shutdown.request();
		if let Some(handle) = self.mgmt.take() {
			handle.join();
		}
		self.manager = None;
		State::Exit
	}
}
