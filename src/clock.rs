// SPDX-License-Identifier: MIT OR Apache-2.0

//! Millisecond-granularity sleep, injected so the engine's poll loops
//! (`engine.rs`, `dfuse.rs`) can be driven instantly in tests instead of
//! waiting on real device poll timeouts.

use std::cell::RefCell;
use std::time::Duration;

/// The one operation the engine needs from a clock.
pub trait Clock
{
	fn sleep_ms(&self, ms: u64);
}

/// Production [`Clock`], backed by a real thread sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock
{
	fn sleep_ms(&self, ms: u64)
	{
		std::thread::sleep(Duration::from_millis(ms));
	}
}

/// Test [`Clock`] that records requested sleeps instead of waiting on them.
#[derive(Debug, Default)]
pub struct RecordingClock
{
	pub slept_ms: RefCell<Vec<u64>>,
}

impl Clock for RecordingClock
{
	fn sleep_ms(&self, ms: u64)
	{
		self.slept_ms.borrow_mut().push(ms);
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn recording_clock_keeps_requested_order()
	{
		let clock = RecordingClock::default();
		clock.sleep_ms(5);
		clock.sleep_ms(100);
		assert_eq!(*clock.slept_ms.borrow(), vec![5, 100]);
	}
}
