//! Bounded, closable, blocking byte ring buffer.
//!
//! Mediates the speed mismatch between a TCP socket and a UART. One mutex
//! protects head, tail, count, and the closed flag; two condition variables
//! wake blocked producers and consumers. After `close`, writes fail with 0
//! and reads drain the remaining bytes before returning 0, so a closed buffer
//! never deadlocks its consumer.

use std::sync::{Condvar, Mutex};

/// Default capacity, roughly sixteen seconds of traffic at 9600 baud.
pub const DEFAULT_CAPACITY: usize = 16 * 1024;

struct State {
	storage: Box<[u8]>,
	head: usize,
	tail: usize,
	count: usize,
	closed: bool,
}

pub struct RingBuffer {
	state: Mutex<State>,
	not_empty: Condvar,
	not_full: Condvar,
}

impl RingBuffer {
	/// Creates a buffer with the given capacity; 0 selects the default.
	pub fn new(capacity: usize) -> Self {
		let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
		Self {
			state: Mutex::new(State {
				storage: vec![0u8; capacity].into_boxed_slice(),
				head: 0,
				tail: 0,
				count: 0,
				closed: false,
			}),
			not_empty: Condvar::new(),
			not_full: Condvar::new(),
		}
	}

	/// Copies up to `buf.len()` bytes into the ring, blocking while the ring
	/// is full. Returns the number of bytes accepted, or 0 once closed.
	pub fn write(&self, buf: &[u8]) -> usize {
		if buf.is_empty() {
			return 0;
		}

		let mut state = self.state.lock().unwrap();
		loop {
			if state.closed {
				return 0;
			}
			if state.count < state.storage.len() {
				break;
			}
			state = self.not_full.wait(state).unwrap();
		}

		let capacity = state.storage.len();
		let n = buf.len().min(capacity - state.count);
		let tail = state.tail;
		let first = n.min(capacity - tail);
		state.storage[tail..tail + first].copy_from_slice(&buf[..first]);
		state.storage[..n - first].copy_from_slice(&buf[first..n]);
		state.tail = (tail + n) % capacity;
		state.count += n;

		self.not_empty.notify_all();
		n
	}

	/// Copies up to `buf.len()` bytes out of the ring, blocking while the ring
	/// is empty and open. Returns 0 only when the ring is closed and drained.
	pub fn read(&self, buf: &mut [u8]) -> usize {
		if buf.is_empty() {
			return 0;
		}

		let mut state = self.state.lock().unwrap();
		while state.count == 0 {
			if state.closed {
				return 0;
			}
			state = self.not_empty.wait(state).unwrap();
		}

		let capacity = state.storage.len();
		let n = buf.len().min(state.count);
		let head = state.head;
		let first = n.min(capacity - head);
		buf[..first].copy_from_slice(&state.storage[head..head + first]);
		buf[first..n].copy_from_slice(&state.storage[..n - first]);
		state.head = (head + n) % capacity;
		state.count -= n;

		self.not_full.notify_all();
		n
	}

	/// Bytes currently queued.
	pub fn available(&self) -> usize {
		self.state.lock().unwrap().count
	}

	/// Bytes that can be written without blocking.
	pub fn free_space(&self) -> usize {
		let state = self.state.lock().unwrap();
		state.storage.len() - state.count
	}

	pub fn capacity(&self) -> usize {
		self.state.lock().unwrap().storage.len()
	}

	pub fn is_closed(&self) -> bool {
		self.state.lock().unwrap().closed
	}

	/// Closes the ring and wakes every blocked reader and writer.
	pub fn close(&self) {
		self.state.lock().unwrap().closed = true;
		self.not_empty.notify_all();
		self.not_full.notify_all();
	}
}
