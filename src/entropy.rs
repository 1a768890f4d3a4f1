//! Random data generation for the management password.
//!
//! This uses a ChaCha-based generator seeded from the operating system. If the
//! OS refuses to hand out entropy the pool falls back to a time-derived seed,
//! which is logged loudly because the resulting password is guessable.

use std::process;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};

static POOL: Mutex<Option<ChaCha20Rng>> = Mutex::new(None);

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn fallback_seed() -> [u8; 32] {
	let nanos = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_nanos())
		.unwrap_or_default();

	let mut seed = [0u8; 32];
	seed[..16].copy_from_slice(&nanos.to_le_bytes());
	seed[16..20].copy_from_slice(&process::id().to_le_bytes());
	seed
}

/// Fills `buf` with random data from the process-wide pool.
pub fn fill(buf: &mut [u8]) {
	let pool = &mut *POOL.lock().unwrap();
	let rng = match pool {
		Some(rng) => rng,
		pool @ None => {
			let rng = match ChaCha20Rng::try_from_os_rng() {
				Ok(rng) => rng,
				Err(err) => {
					warn!("no OS entropy available ({err}), falling back to a time-based seed");
					warn!("generated secrets are NOT cryptographically random");
					ChaCha20Rng::from_seed(fallback_seed())
				}
			};
			pool.insert(rng)
		}
	};

	rng.fill_bytes(buf);
}

/// Returns `len` random alphanumeric characters, suitable for a generated
/// management password.
pub fn alphanumeric(len: usize) -> String {
	let mut out = String::with_capacity(len);
	let mut raw = [0u8; 64];

	while out.len() < len {
		fill(&mut raw);
		for &byte in raw.iter() {
			// Rejection sampling keeps the distribution uniform.
			if usize::from(byte) < ALPHABET.len() * (256 / ALPHABET.len()) {
				out.push(char::from(ALPHABET[usize::from(byte) % ALPHABET.len()]));
				if out.len() == len {
					break;
				}
			}
		}
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn alphanumeric_length_and_charset() {
		let pw = alphanumeric(16);
		assert_eq!(pw.len(), 16);
		assert!(pw.bytes().all(|b| ALPHABET.contains(&b)));
	}

	#[test]
	fn fill_is_not_constant() {
		let mut a = [0u8; 32];
		let mut b = [0u8; 32];
		fill(&mut a);
		fill(&mut b);
		assert_ne!(a, b);
	}
}
