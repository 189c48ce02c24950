// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parser for the DfuSe memory-layout grammar ST packs into the alt-setting
//! name string, e.g. `@Internal Flash/0x08000000/04*016Kg,01*064Kg,07*128Kg`.
//!
//! Parsed with a hand-rolled tokenizer rather than pulling in `regex`, which
//! nothing else in this crate's dependency stack needs.

use crate::error::{Error, ErrorKind};

/// A single contiguous run of same-sized, same-permission pages within a
/// memory segment, e.g. the `04*016Kg` part of `04*016Kg,01*064Kg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPageRun
{
	pub page_count: u32,
	pub page_size: u32,
	pub readable: bool,
	pub erasable: bool,
	pub writable: bool,
}

impl MemoryPageRun
{
	pub fn total_size(&self) -> u64
	{
		u64::from(self.page_count) * u64::from(self.page_size)
	}
}

/// One `@name/address/runs` memory segment, as found in a DfuSe alt-setting
/// name string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySegment
{
	pub name: String,
	pub start_address: u32,
	pub runs: Vec<MemoryPageRun>,
}

impl MemorySegment
{
	/// Total size in bytes spanned by all runs in this segment.
	pub fn total_size(&self) -> u64
	{
		self.runs.iter().map(MemoryPageRun::total_size).sum()
	}

	/// `true` if `[address, address + len)` lies entirely within one erasable
	/// run of this segment.
	pub fn contains_erasable(&self, address: u32, len: u32) -> bool
	{
		let end = match address.checked_add(len) {
			Some(end) => end,
			None => return false,
		};

		let mut run_start = self.start_address;
		for run in &self.runs {
			let run_end = run_start.wrapping_add(run.total_size() as u32);
			if address >= run_start && end <= run_end {
				return run.erasable;
			}
			run_start = run_end;
		}
		false
	}
}

/// Parse the full memory-layout string of an alt-setting (possibly several
/// `@segment` descriptions are not supported upstream; DfuSe encodes exactly
/// one segment per alt-setting name, per ST AN3156 §7).
pub fn parse(name: &str) -> Result<MemorySegment, Error>
{
	let name = name.trim();
	let rest = name
		.strip_prefix('@')
		.ok_or_else(|| ErrorKind::Data(format!("memory layout string {name:?} missing leading '@'")).error())?;

	let mut parts = rest.split('/');
	let segment_name = parts
		.next()
		.ok_or_else(|| ErrorKind::Data("empty memory layout string".into()).error())?
		.trim()
		.to_string();

	let address_str = parts
		.next()
		.ok_or_else(|| ErrorKind::Data(format!("memory layout {name:?} missing address field")).error())?
		.trim();
	let address_str = address_str.strip_prefix("0x").unwrap_or(address_str);
	let start_address = u32::from_str_radix(address_str, 16)
		.map_err(|_| ErrorKind::Data(format!("memory layout {name:?} has malformed address")).error())?;

	let runs_str = parts
		.next()
		.ok_or_else(|| ErrorKind::Data(format!("memory layout {name:?} missing run list")).error())?;

	let mut runs = Vec::new();
	for token in runs_str.split(',') {
		let token = token.trim();
		if token.is_empty() {
			continue;
		}
		runs.push(parse_run(token, name)?);
	}

	if runs.is_empty() {
		return Err(ErrorKind::Data(format!("memory layout {name:?} has no page runs")).error());
	}

	Ok(MemorySegment { name: segment_name, start_address, runs })
}

/// Parse one `NN*SSSUt` run token, e.g. `04*016Kg`: `NN` page count, `SSS`
/// page size, `U` an optional unit multiplier (`K`/`M`), `t` the permission
/// letter.
fn parse_run(token: &str, context: &str) -> Result<MemoryPageRun, Error>
{
	let bad = || ErrorKind::Data(format!("memory layout {context:?} has malformed run {token:?}")).error();

	let (count_str, rest) = token.split_once('*').ok_or_else(bad)?;
	let page_count: u32 = count_str.parse().map_err(|_| bad())?;

	// rest is digits, then an optional K/M multiplier, then exactly one type letter.
	let type_char = rest.chars().last().ok_or_else(bad)?;
	if !type_char.is_ascii_alphabetic() {
		return Err(bad());
	}
	let digits_and_unit = &rest[..rest.len() - type_char.len_utf8()];

	let (size_str, multiplier) = match digits_and_unit.chars().last() {
		Some('K') => (&digits_and_unit[..digits_and_unit.len() - 1], 1024u32),
		Some('M') => (&digits_and_unit[..digits_and_unit.len() - 1], 1024 * 1024),
		_ => (digits_and_unit, 1),
	};
	let page_size: u32 = size_str.parse().map_err(|_| bad())?;
	let page_size = page_size.checked_mul(multiplier).ok_or_else(bad)?;

	let (readable, erasable, writable) = match type_char {
		'a' => (true, false, false),
		'b' => (false, true, false),
		'c' => (true, true, false),
		'd' => (false, false, true),
		'e' => (true, false, true),
		'f' => (false, true, true),
		'g' => (true, true, true),
		_ => return Err(bad()),
	};

	Ok(MemoryPageRun { page_count, page_size, readable, erasable, writable })
}

/// A single contiguous, uniform-permission, uniform-page-size run of device
/// address space, as consumed by the DfuSe engine's erase/write passes and
/// `find_segment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment
{
	pub start_address: u32,
	/// Inclusive.
	pub end_address: u32,
	pub page_size: u32,
	pub readable: bool,
	pub erasable: bool,
	pub writable: bool,
}

impl Segment
{
	pub fn contains(&self, address: u32) -> bool
	{
		address >= self.start_address && address <= self.end_address
	}

	/// Address of the page covering `address`, rounded down to `page_size`.
	pub fn page_of(&self, address: u32) -> u32
	{
		let offset = address - self.start_address;
		self.start_address + (offset / self.page_size) * self.page_size
	}
}

/// Expand a parsed [`MemorySegment`]'s page runs into the flat,
/// non-overlapping, address-sorted [`Segment`] list the DfuSe engine and
/// `find_segment` operate on.
pub fn flatten(segment: &MemorySegment) -> Vec<Segment>
{
	let mut flat = Vec::with_capacity(segment.runs.len());
	let mut address = segment.start_address;

	for run in &segment.runs {
		for _ in 0..run.page_count {
			let end = address + run.page_size - 1;
			flat.push(Segment {
				start_address: address,
				end_address: end,
				page_size: run.page_size,
				readable: run.readable,
				erasable: run.erasable,
				writable: run.writable,
			});
			address += run.page_size;
		}
	}

	flat
}

/// Find the flattened segment containing `address`.
pub fn find_segment(layout: &[Segment], address: u32) -> Option<&Segment>
{
	layout.iter().find(|seg| seg.contains(address))
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn parses_stm32_style_segment()
	{
		let segment = parse("@Internal Flash/0x08000000/04*016Kg,01*064Kg,07*128Kg").unwrap();

		assert_eq!(segment.name, "Internal Flash");
		assert_eq!(segment.start_address, 0x0800_0000);
		assert_eq!(segment.runs.len(), 3);
		assert_eq!(segment.runs[0], MemoryPageRun { page_count: 4, page_size: 16 * 1024, readable: true, erasable: true, writable: true });
		assert_eq!(segment.runs[1].page_size, 64 * 1024);
		assert_eq!(segment.runs[2].page_count, 7);
	}

	#[test]
	fn total_size_sums_all_runs()
	{
		let segment = parse("@Flash/0x08000000/04*016Kg").unwrap();
		assert_eq!(segment.total_size(), 4 * 16 * 1024);
	}

	#[test]
	fn contains_erasable_respects_run_boundaries()
	{
		let segment = parse("@Flash/0x08000000/02*016Ka,02*016Kg").unwrap();
		// first run is readable-only, not erasable
		assert!(!segment.contains_erasable(0x0800_0000, 16 * 1024));
		// second run (offset 32K) is fully erasable
		assert!(segment.contains_erasable(0x0800_0000 + 2 * 16 * 1024, 16 * 1024));
	}

	#[test]
	fn rejects_missing_at_sign()
	{
		assert!(parse("Internal Flash/0x08000000/04*016Kg").is_err());
	}

	#[test]
	fn rejects_malformed_run()
	{
		assert!(parse("@Flash/0x08000000/04x016Kg").is_err());
	}

	#[test]
	fn flatten_expands_each_page_as_its_own_segment()
	{
		let segment = parse("@Flash/0x08000000/02*016Kg,01*064Kg").unwrap();
		let flat = flatten(&segment);

		assert_eq!(flat.len(), 3);
		assert_eq!(flat[0].start_address, 0x0800_0000);
		assert_eq!(flat[0].end_address, 0x0800_0000 + 16 * 1024 - 1);
		assert_eq!(flat[1].start_address, 0x0800_0000 + 16 * 1024);
		assert_eq!(flat[2].start_address, 0x0800_0000 + 2 * 16 * 1024);
		assert_eq!(flat[2].page_size, 64 * 1024);

		// non-overlapping, strictly increasing start addresses
		for pair in flat.windows(2) {
			assert!(pair[1].start_address > pair[0].start_address);
			assert!(pair[1].start_address > pair[0].end_address);
		}
	}

	#[test]
	fn find_segment_locates_containing_page()
	{
		let segment = parse("@Flash/0x08000000/04*016Kg").unwrap();
		let flat = flatten(&segment);

		let found = find_segment(&flat, 0x0800_0000 + 16 * 1024 + 10).unwrap();
		assert_eq!(found.start_address, 0x0800_0000 + 16 * 1024);
	}

	#[test]
	fn find_segment_returns_none_outside_layout()
	{
		let segment = parse("@Flash/0x08000000/01*016Kg").unwrap();
		let flat = flatten(&segment);
		assert!(find_segment(&flat, 0x0900_0000).is_none());
	}
}
