//! Per-source-IP authentication failure tracking.
//!
//! A small fixed table under one mutex. Five recorded failures lock the
//! address out for thirty seconds; the lockout expiring or a successful
//! authentication resets the counter. When the table is full the first slot
//! is overwritten.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const MAX_ENTRIES: usize = 16;
pub const LOCKOUT_THRESHOLD: u32 = 5;
pub const LOCKOUT_WINDOW: Duration = Duration::from_secs(30);

#[derive(Clone, Copy)]
struct Entry {
	ip: IpAddr,
	failures: u32,
	locked_until: Option<Instant>,
}

pub struct RateLimiter {
	entries: Mutex<[Option<Entry>; MAX_ENTRIES]>,
}

impl Default for RateLimiter {
	fn default() -> Self {
		Self::new()
	}
}

impl RateLimiter {
	pub fn new() -> Self {
		Self {
			entries: Mutex::new([None; MAX_ENTRIES]),
		}
	}

	/// True while `ip` is inside its lockout window. An expired lockout
	/// clears the entry.
	pub fn is_locked(&self, ip: IpAddr) -> bool {
		let mut entries = self.entries.lock().unwrap();
		for slot in entries.iter_mut() {
			let Some(entry) = slot else { continue };
			if entry.ip != ip {
				continue;
			}
			match entry.locked_until {
				Some(until) if Instant::now() < until => return true,
				Some(_) => {
					*slot = None;
					return false;
				}
				None => return false,
			}
		}
		false
	}

	/// Records one failed authentication attempt from `ip`.
	pub fn record_failure(&self, ip: IpAddr) {
		let mut entries = self.entries.lock().unwrap();

		let slot = match entries.iter_mut().position(|slot| {
			slot.map(|entry| entry.ip == ip).unwrap_or(false)
		}) {
			Some(index) => index,
			None => entries
				.iter()
				.position(Option::is_none)
				// Table full: evict the first slot.
				.unwrap_or(0),
		};

		let entry = entries[slot].filter(|entry| entry.ip == ip).unwrap_or(Entry {
			ip,
			failures: 0,
			locked_until: None,
		});
		let failures = entry.failures + 1;
		entries[slot] = Some(Entry {
			ip,
			failures,
			locked_until: if failures >= LOCKOUT_THRESHOLD {
				Some(Instant::now() + LOCKOUT_WINDOW)
			} else {
				entry.locked_until
			},
		});
	}

	/// Forgets `ip` entirely, called after a successful authentication.
	pub fn clear(&self, ip: IpAddr) {
		let mut entries = self.entries.lock().unwrap();
		for slot in entries.iter_mut() {
			if slot.map(|entry| entry.ip == ip).unwrap_or(false) {
				*slot = None;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;

	use super::*;

	fn ip(last: u8) -> IpAddr {
		IpAddr::V4(Ipv4Addr::new(127, 0, 0, last))
	}

	#[test]
	fn five_failures_lock_the_address() {
		let limiter = RateLimiter::new();
		for _ in 0..LOCKOUT_THRESHOLD - 1 {
			limiter.record_failure(ip(1));
			assert!(!limiter.is_locked(ip(1)));
		}
		limiter.record_failure(ip(1));
		assert!(limiter.is_locked(ip(1)));
		assert!(!limiter.is_locked(ip(2)));
	}

	#[test]
	fn success_before_the_threshold_resets_the_counter() {
		let limiter = RateLimiter::new();
		for _ in 0..LOCKOUT_THRESHOLD - 1 {
			limiter.record_failure(ip(1));
		}
		limiter.clear(ip(1));
		for _ in 0..LOCKOUT_THRESHOLD - 1 {
			limiter.record_failure(ip(1));
		}
		assert!(!limiter.is_locked(ip(1)));
	}

	#[test]
	fn table_overflow_overwrites_the_first_slot() {
		let limiter = RateLimiter::new();
		for last in 0..MAX_ENTRIES as u8 {
			limiter.record_failure(ip(last));
		}
		// A 17th address claims slot 0; the table keeps working.
		for _ in 0..LOCKOUT_THRESHOLD {
			limiter.record_failure(ip(200));
		}
		assert!(limiter.is_locked(ip(200)));
	}
}
