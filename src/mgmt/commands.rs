//! Management command dispatch.
//!
//! A static table of `{name, handler, help}` entries, tokenized with
//! `shell-words`. Handlers only fail on socket errors; every user mistake is
//! reported in-band and keeps the session alive.

use std::net::Ipv4Addr;
use std::sync::Arc;

use super::session::{sendln, Session};
use crate::config::{Configuration, Encryption, Parity, Role};
use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
	Continue,
	Quit,
}

pub struct CommandSpec {
	pub name: &'static str,
	pub help: &'static str,
	run: fn(&mut Session<'_>, &[String]) -> Result<Flow>,
}

pub const COMMANDS: &[CommandSpec] = &[
	CommandSpec {
		name: "help",
		help: "List available commands",
		run: cmd_help,
	},
	CommandSpec {
		name: "show",
		help: "show {config|status|clients} - inspect runtime state",
		run: cmd_show,
	},
	CommandSpec {
		name: "get",
		help: "get <param> - read one active configuration field",
		run: cmd_get,
	},
	CommandSpec {
		name: "set",
		help: "set <param> <value> - change the pending configuration",
		run: cmd_set,
	},
	CommandSpec {
		name: "pending",
		help: "Summarize pending configuration changes",
		run: cmd_pending,
	},
	CommandSpec {
		name: "clear",
		help: "Discard pending changes",
		run: cmd_clear,
	},
	CommandSpec {
		name: "validate",
		help: "Validate the pending configuration",
		run: cmd_validate,
	},
	CommandSpec {
		name: "restart",
		help: "Validate pending changes and restart the active mode",
		run: cmd_restart,
	},
	CommandSpec {
		name: "quit",
		help: "Close this session",
		run: cmd_quit,
	},
	CommandSpec {
		name: "shutdown",
		help: "Reserved",
		run: cmd_shutdown,
	},
];

/// Parameters reachable via `get` and `set`.
pub const PARAMS: &[&str] = &[
	"mode",
	"port",
	"listen_addr",
	"connect_addr",
	"connect_port",
	"encryption",
	"serial_device",
	"serial_baud",
	"serial_parity",
	"nbd_export",
	"nbd_name",
];

pub fn dispatch(session: &mut Session<'_>, line: &str) -> Result<Flow> {
	if !session.is_authenticated() {
		sendln!(session, "not authenticated")?;
		return Ok(Flow::Quit);
	}
	if line.is_empty() {
		return Ok(Flow::Continue);
	}

	let words = match shell_words::split(line) {
		Ok(words) => words,
		Err(_) => {
			sendln!(session, "error: unbalanced quotes")?;
			return Ok(Flow::Continue);
		}
	};
	let Some((name, args)) = words.split_first() else {
		return Ok(Flow::Continue);
	};

	match COMMANDS.iter().find(|spec| spec.name == name.as_str()) {
		Some(spec) => (spec.run)(session, args),
		None => {
			sendln!(session, "unknown command '{name}' (try 'help')")?;
			Ok(Flow::Continue)
		}
	}
}

fn cmd_help(session: &mut Session<'_>, _args: &[String]) -> Result<Flow> {
	for spec in COMMANDS {
		sendln!(session, "{:10} {}", spec.name, spec.help)?;
	}
	Ok(Flow::Continue)
}

fn cmd_show(session: &mut Session<'_>, args: &[String]) -> Result<Flow> {
	match args.first().map(String::as_str) {
		Some("config") => {
			let config = session.server.manager.active();
			show_config(session, &config)?;
		}
		Some("status") => {
			let role = session.server.status.role();
			let uptime = session.server.status.uptime_secs();
			let clients = session.server.status.clients().len();
			let pending = session.server.manager.has_pending();
			sendln!(session, "mode:      {role}")?;
			sendln!(session, "uptime:    {uptime} s")?;
			sendln!(session, "clients:   {clients}")?;
			sendln!(session, "pending:   {}", if pending { "yes" } else { "no" })?;
		}
		Some("clients") => {
			let clients = session.server.status.clients();
			if clients.is_empty() {
				sendln!(session, "no connected clients")?;
			}
			for (slot, peer) in clients {
				sendln!(session, "slot {slot}: {peer}")?;
			}
		}
		_ => sendln!(session, "usage: show {{config|status|clients}}")?,
	}
	Ok(Flow::Continue)
}

fn show_config(session: &mut Session<'_>, config: &Configuration) -> Result<()> {
	sendln!(session, "mode:          {}", config.role)?;
	sendln!(
		session,
		"listen:        {}:{}",
		config
			.listen_addr
			.map(|a| a.to_string())
			.unwrap_or_else(|| "*".to_string()),
		config.listen_port
	)?;
	sendln!(
		session,
		"connect:       {}",
		match &config.connect_host {
			Some(host) => format!("{host}:{}", config.connect_port),
			None => "-".to_string(),
		}
	)?;
	sendln!(session, "encryption:    {}", config.encryption.as_str())?;
	sendln!(
		session,
		"serial:        {} @ {} ({}{}{}, {})",
		if config.serial.device.is_empty() {
			"-"
		} else {
			&config.serial.device
		},
		config.serial.baud,
		config.serial.data_bits,
		match config.serial.parity {
			Parity::None => "N",
			Parity::Odd => "O",
			Parity::Even => "E",
		},
		config.serial.stop_bits,
		config.serial.flow.as_str()
	)?;
	sendln!(session, "usb devices:   {}", config.usb_devices.len())?;
	sendln!(
		session,
		"nbd export:    {} (name '{}', {}, block {}, max {}{})",
		if config.nbd.export_path.is_empty() {
			"-"
		} else {
			&config.nbd.export_path
		},
		config.nbd.export_name,
		config.nbd.backend.as_str(),
		config.nbd.block_size,
		config.nbd.max_connections,
		if config.nbd.readonly { ", ro" } else { "" }
	)?;
	sendln!(session, "mgmt port:     {}", config.mgmt_port)?;
	Ok(())
}

fn param_value(config: &Configuration, param: &str) -> Option<String> {
	let value = match param {
		"mode" => config.role.to_string(),
		"port" => config.listen_port.to_string(),
		"listen_addr" => config
			.listen_addr
			.map(|a| a.to_string())
			.unwrap_or_else(|| "*".to_string()),
		"connect_addr" => config.connect_host.clone().unwrap_or_else(|| "-".to_string()),
		"connect_port" => config.connect_port.to_string(),
		"encryption" => config.encryption.as_str().to_string(),
		"serial_device" => config.serial.device.clone(),
		"serial_baud" => config.serial.baud.to_string(),
		"serial_parity" => config.serial.parity.as_str().to_string(),
		"nbd_export" => config.nbd.export_path.clone(),
		"nbd_name" => config.nbd.export_name.clone(),
		_ => return None,
	};
	Some(value)
}

fn cmd_get(session: &mut Session<'_>, args: &[String]) -> Result<Flow> {
	let Some(param) = args.first() else {
		sendln!(session, "usage: get <param>")?;
		return Ok(Flow::Continue);
	};

	let config = session.server.manager.active();
	match param_value(&config, param) {
		Some(value) => sendln!(session, "{param} = {value}")?,
		None => sendln!(session, "unknown parameter '{param}' (one of {})", PARAMS.join(", "))?,
	}
	Ok(Flow::Continue)
}

fn cmd_set(session: &mut Session<'_>, args: &[String]) -> Result<Flow> {
	let (Some(param), Some(value)) = (args.first(), args.get(1)) else {
		sendln!(session, "usage: set <param> <value>")?;
		return Ok(Flow::Continue);
	};

	let manager = Arc::clone(&session.server.manager);
	let outcome = match param.as_str() {
		"mode" => Role::parse(value).map(|role| manager.set_role(role)),
		"port" => parse_port(value).map(|port| manager.set_listen_port(port)),
		"listen_addr" => parse_listen_addr(value).map(|addr| manager.set_listen_addr(addr)),
		"connect_addr" => {
			manager.set_connect_host(value.clone());
			Ok(())
		}
		"connect_port" => parse_port(value).map(|port| manager.set_connect_port(port)),
		"encryption" => Encryption::parse(value).map(|mode| manager.set_encryption(mode)),
		"serial_device" => {
			manager.set_serial_device(value.clone());
			Ok(())
		}
		"serial_baud" => value
			.parse::<u32>()
			.map_err(|_| crate::errors::Error::InvalidArgument(format!("invalid baud '{value}'")))
			.map(|baud| manager.set_serial_baud(baud)),
		"serial_parity" => Parity::parse(value).map(|parity| manager.set_serial_parity(parity)),
		"nbd_export" => {
			manager.set_nbd_export(value.clone());
			Ok(())
		}
		"nbd_name" => {
			manager.set_nbd_name(value.clone());
			Ok(())
		}
		_ => {
			sendln!(session, "unknown parameter '{param}' (one of {})", PARAMS.join(", "))?;
			return Ok(Flow::Continue);
		}
	};

	match outcome {
		Ok(()) => sendln!(session, "{param} set (pending)")?,
		Err(err) => sendln!(session, "error: {err}")?,
	}
	Ok(Flow::Continue)
}

fn parse_port(value: &str) -> Result<u16> {
	match value.parse::<u16>() {
		Ok(port) if port != 0 => Ok(port),
		_ => Err(crate::errors::Error::InvalidArgument(format!(
			"invalid port '{value}'"
		))),
	}
}

fn parse_listen_addr(value: &str) -> Result<Option<Ipv4Addr>> {
	if value == "*" || value == "any" {
		return Ok(None);
	}
	value
		.parse::<Ipv4Addr>()
		.map(Some)
		.map_err(|_| crate::errors::Error::InvalidArgument(format!("invalid address '{value}'")))
}

fn cmd_pending(session: &mut Session<'_>, _args: &[String]) -> Result<Flow> {
	let manager = Arc::clone(&session.server.manager);
	if !manager.has_pending() {
		sendln!(session, "no pending changes")?;
		return Ok(Flow::Continue);
	}

	let active = manager.active();
	let pending = manager.pending();
	let mut changed = 0;
	for param in PARAMS {
		let old = param_value(&active, param);
		let new = param_value(&pending, param);
		if old != new {
			if let (Some(old), Some(new)) = (old, new) {
				sendln!(session, "{param}: {old} -> {new}")?;
				changed += 1;
			}
		}
	}
	if changed == 0 {
		sendln!(session, "pending changes outside the settable parameters")?;
	}
	Ok(Flow::Continue)
}

fn cmd_clear(session: &mut Session<'_>, _args: &[String]) -> Result<Flow> {
	session.server.manager.clear_pending();
	sendln!(session, "pending changes cleared")?;
	Ok(Flow::Continue)
}

fn cmd_validate(session: &mut Session<'_>, _args: &[String]) -> Result<Flow> {
	match session.server.manager.validate_pending() {
		Ok(()) => sendln!(session, "pending configuration is valid")?,
		Err(err) => sendln!(session, "validation failed: {err}")?,
	}
	Ok(Flow::Continue)
}

fn cmd_restart(session: &mut Session<'_>, _args: &[String]) -> Result<Flow> {
	match session.server.manager.validate_pending() {
		Ok(()) => {
			session.server.restart.request();
			sendln!(session, "restart scheduled; applying pending configuration")?;
		}
		// The active role keeps running on its current configuration.
		Err(err) => sendln!(session, "validation failed: {err}")?,
	}
	Ok(Flow::Continue)
}

fn cmd_quit(session: &mut Session<'_>, _args: &[String]) -> Result<Flow> {
	sendln!(session, "bye")?;
	Ok(Flow::Quit)
}

fn cmd_shutdown(session: &mut Session<'_>, _args: &[String]) -> Result<Flow> {
	sendln!(session, "shutdown: not implemented")?;
	Ok(Flow::Continue)
}
