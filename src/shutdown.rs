//! Cooperative cancellation.
//!
//! Two small primitives drive every loop in the bridge: the [`ShutdownToken`]
//! set by process signals (and by fatal errors inside a pipeline), and the
//! [`RestartSignal`] raised by the management interface to request a
//! configuration swap. Role loops poll both at natural quiescence points.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Cloneable cancellation token. `request` is sticky until `clear`.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn request(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_requested(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}

	pub fn clear(&self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

/// Process-wide restart flag with test-and-clear semantics.
#[derive(Debug, Clone, Default)]
pub struct RestartSignal(Arc<AtomicBool>);

impl RestartSignal {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn request(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_requested(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}

	pub fn clear(&self) {
		self.0.store(false, Ordering::SeqCst);
	}

	/// Atomically reads and clears the flag.
	pub fn check_and_clear(&self) -> bool {
		self.0.swap(false, Ordering::SeqCst)
	}
}

static SIGNAL_TOKEN: OnceLock<ShutdownToken> = OnceLock::new();

extern "C" fn on_terminate(_signum: libc::c_int) {
	// Only signal-safe work here: a single atomic store.
	if let Some(token) = SIGNAL_TOKEN.get() {
		token.0.store(true, Ordering::SeqCst);
	}
}

/// Routes SIGINT and SIGTERM to `token` and ignores SIGPIPE so that writes to
/// dead sockets surface as `EPIPE` instead of killing the process.
pub fn install_signal_handlers(token: &ShutdownToken) -> io::Result<()> {
	SIGNAL_TOKEN.get_or_init(|| token.clone());

	unsafe {
		let mut action: libc::sigaction = mem::zeroed();
		action.sa_sigaction = on_terminate as usize;
		libc::sigemptyset(&mut action.sa_mask);

		for signum in [libc::SIGINT, libc::SIGTERM] {
			if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
				return Err(io::Error::last_os_error());
			}
		}

		let mut ignore: libc::sigaction = mem::zeroed();
		ignore.sa_sigaction = libc::SIG_IGN;
		libc::sigemptyset(&mut ignore.sa_mask);
		if libc::sigaction(libc::SIGPIPE, &ignore, std::ptr::null_mut()) != 0 {
			return Err(io::Error::last_os_error());
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn shutdown_token_is_shared_between_clones() {
		let token = ShutdownToken::new();
		let clone = token.clone();
		assert!(!clone.is_requested());
		token.request();
		assert!(clone.is_requested());
		clone.clear();
		assert!(!token.is_requested());
	}

	#[test]
	fn restart_signal_check_and_clear() {
		let signal = RestartSignal::new();
		assert!(!signal.check_and_clear());
		signal.request();
		assert!(signal.is_requested());
		assert!(signal.check_and_clear());
		assert!(!signal.is_requested());
		assert!(!signal.check_and_clear());
	}
}
