// SPDX-License-Identifier: MIT OR Apache-2.0

//! Progress reporting sink, injected behind a trait so the protocol engine
//! stays usable without a terminal.
//!
//! [`IndicatifSink`] wraps an `indicatif::ProgressBar` in an `Rc` so it can
//! be moved into a `'static` download closure.

use std::rc::Rc;

use indicatif::{ProgressBar, ProgressStyle};

/// Sink for upload/download progress. One method per event the engine needs
/// to report.
pub trait ProgressSink
{
	fn set_length(&self, total_bytes: u64);
	fn inc(&self, delta_bytes: u64);
	fn finish(&self);
}

/// Production sink backed by `indicatif`.
pub struct IndicatifSink
{
	bar: Rc<ProgressBar>,
}

impl IndicatifSink
{
	pub fn new() -> Self
	{
		let bar = ProgressBar::new(0).with_style(
			ProgressStyle::default_bar()
				.template(" {percent:>3}% |{bar:50}| {bytes}/{total_bytes} [{binary_bytes_per_sec} {elapsed}]")
				.unwrap(),
		);
		Self { bar: Rc::new(bar) }
	}
}

impl Default for IndicatifSink
{
	fn default() -> Self
	{
		Self::new()
	}
}

impl ProgressSink for IndicatifSink
{
	fn set_length(&self, total_bytes: u64)
	{
		self.bar.set_length(total_bytes);
	}

	fn inc(&self, delta_bytes: u64)
	{
		self.bar.inc(delta_bytes);
	}

	fn finish(&self)
	{
		self.bar.finish();
	}
}

/// No-op sink for `--quiet`/non-interactive runs and tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink
{
	fn set_length(&self, _total_bytes: u64) {}

	fn inc(&self, _delta_bytes: u64) {}

	fn finish(&self) {}
}
