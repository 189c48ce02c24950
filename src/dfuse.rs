// SPDX-License-Identifier: MIT OR Apache-2.0

//! The ST DfuSe extension: special commands, the per-element erase-then-
//! write pass, and the DfuSe file container format.

use crate::clock::Clock;
use crate::engine::{clear_status, dnload, get_status};
use crate::error::{Error, ErrorKind};
use crate::memory_layout::{self, Segment};
use crate::quirks::Quirk;
use crate::status::State;
use crate::transport::Transport;

const CMD_SET_ADDRESS: u8 = 0x21;
const CMD_ERASE_PAGE: u8 = 0x41;
const CMD_MASS_ERASE: u8 = 0x41;
const CMD_READ_UNPROTECT: u8 = 0x92;

/// STM32F405 erratum: reports `bwPollTimeout == 100` for `MASS_ERASE` when
/// the real erase takes much longer.
const MASS_ERASE_POLL_OVERRIDE_MS: u32 = 35_000;
/// Pipe-stall retries tolerated while polling a special command.
const STALL_RETRY_LIMIT: u32 = 3;
/// Consecutive `bwPollTimeout == 0` polls tolerated before giving up.
const ZERO_TIMEOUT_POLL_LIMIT: u32 = 100;
/// Polls an `ERASE_PAGE` on STM32H7 is allowed to sit in `dfuERROR` before
/// the engine unsticks it with `CLRSTATUS`.
const STM32H7_ERASE_STALL_POLLS: u32 = 4;

fn command_payload(command: u8, address: u32) -> [u8; 5]
{
	let addr = address.to_le_bytes();
	[command, addr[0], addr[1], addr[2], addr[3]]
}

/// Issue one special command (a single-transaction `DNLOAD` with
/// `wValue=0`) and poll `GETSTATUS` to completion, applying the known
/// device-specific quirks.
fn send_special_command(transport: &dyn Transport, clock: &dyn Clock, quirks: Quirk, payload: &[u8]) -> Result<(), Error>
{
	dnload(transport, 0, payload)?;
	poll_special_command(transport, clock, quirks, payload[0])
}

fn poll_special_command(transport: &dyn Transport, clock: &dyn Clock, quirks: Quirk, command_byte: u8) -> Result<(), Error>
{
	let mut status = get_status(transport)?;
	let mut error_polls = 0u32;
	let mut zero_timeout_polls = 0u32;

	loop {
		if status.state == State::DfuDnloadIdle || status.state == State::DfuIdle {
			return Ok(());
		}

		if status.state.is_error() {
			let is_stuck_erase = command_byte == CMD_ERASE_PAGE && quirks.contains(Quirk::Stm32H7EraseStall);
			if is_stuck_erase && error_polls >= STM32H7_ERASE_STALL_POLLS {
				clear_status(transport)?;
				error_polls = 0;
				status = get_status(transport)?;
				continue;
			}

			error_polls += 1;
			return Err(ErrorKind::Protocol(format!("device reported {} executing DfuSe command {command_byte:#04x}", status.status)).error());
		}

		let mut poll_timeout = status.poll_timeout_ms;
		if command_byte == CMD_MASS_ERASE && poll_timeout == 100 {
			poll_timeout = MASS_ERASE_POLL_OVERRIDE_MS;
		}

		if poll_timeout == 0 {
			zero_timeout_polls += 1;
			if zero_timeout_polls > ZERO_TIMEOUT_POLL_LIMIT {
				return Err(ErrorKind::Protocol("device stuck with bwPollTimeout=0 executing DfuSe command".into()).error());
			}
		} else {
			zero_timeout_polls = 0;
		}

		clock.sleep_ms(u64::from(poll_timeout));

		status = match get_status(transport) {
			Ok(next) => next,
			Err(err) if status.poll_timeout_ms != 0 && error_polls < STALL_RETRY_LIMIT => {
				error_polls += 1;
				clock.sleep_ms(u64::from(status.poll_timeout_ms));
				let _ = err;
				status
			},
			Err(err) => return Err(err),
		};
	}
}

pub fn set_address(transport: &dyn Transport, clock: &dyn Clock, quirks: Quirk, address: u32) -> Result<(), Error>
{
	send_special_command(transport, clock, quirks, &command_payload(CMD_SET_ADDRESS, address))
}

/// Requires the target segment be erasable; records `addr & ~(pageSize-1)`
/// as the caller's `last_erased_page` to avoid re-erasing.
pub fn erase_page(transport: &dyn Transport, clock: &dyn Clock, quirks: Quirk, address: u32) -> Result<(), Error>
{
	send_special_command(transport, clock, quirks, &command_payload(CMD_ERASE_PAGE, address))
}

pub fn mass_erase(transport: &dyn Transport, clock: &dyn Clock, quirks: Quirk) -> Result<(), Error>
{
	send_special_command(transport, clock, quirks, &[CMD_MASS_ERASE])
}

/// Device disconnects and resets after acknowledgment, so the engine doesn't
/// wait for status beyond the first poll; a failed poll is swallowed.
pub fn read_unprotect(transport: &dyn Transport) -> Result<(), Error>
{
	dnload(transport, 0, &[CMD_READ_UNPROTECT])?;
	let _ = get_status(transport);
	Ok(())
}

/// Write one element, erasing first unless `mass_erase_mode` already cleared
/// the target.
#[allow(clippy::too_many_arguments)]
pub fn dnload_element(
	transport: &dyn Transport,
	clock: &dyn Clock,
	quirks: Quirk,
	layout: &[Segment],
	address: u32,
	data: &[u8],
	transfer_size: u16,
	mass_erase_mode: bool,
	force: bool,
) -> Result<(), Error>
{
	if data.is_empty() {
		return Ok(());
	}

	let end_address = address + (data.len() as u32 - 1);
	let final_segment = memory_layout::find_segment(layout, end_address)
		.ok_or_else(|| ErrorKind::Protocol(format!("no memory segment covers address {end_address:#010x}")).error())?;
	if !final_segment.writable && !force {
		return Err(ErrorKind::Protocol(format!("segment at {:#010x} is not writable", final_segment.start_address)).error());
	}

	let chunk_size = usize::from(transfer_size).max(1);
	let mut last_erased_page: Option<u32> = None;

	if !mass_erase_mode {
		for chunk_start in (0..data.len()).step_by(chunk_size) {
			let chunk_len = chunk_size.min(data.len() - chunk_start);
			let chunk_addr = address + chunk_start as u32;
			let chunk_end = chunk_addr + (chunk_len as u32 - 1);

			let Some(segment) = memory_layout::find_segment(layout, chunk_addr) else { continue };
			if !segment.erasable {
				continue;
			}

			let first_page = segment.page_of(chunk_addr);
			if last_erased_page != Some(first_page) {
				erase_page(transport, clock, quirks, first_page)?;
				last_erased_page = Some(first_page);
			}

			// The chunk spilled into the next page; erase that one too.
			let last_page = segment.page_of(chunk_end);
			if last_page != first_page && last_erased_page != Some(last_page) {
				erase_page(transport, clock, quirks, last_page)?;
				last_erased_page = Some(last_page);
			}
		}
	}

	for chunk_start in (0..data.len()).step_by(chunk_size) {
		let chunk_end = (chunk_start + chunk_size).min(data.len());
		let chunk = &data[chunk_start..chunk_end];
		let chunk_addr = address + chunk_start as u32;

		set_address(transport, clock, quirks, chunk_addr)?;
		// DfuSe always uses transaction=2 for data transfers; the address is
		// set explicitly each time instead of incrementing a counter.
		dnload(transport, 2, chunk)?;
		poll_dfuse_write(transport, clock)?;
	}

	Ok(())
}

fn poll_dfuse_write(transport: &dyn Transport, clock: &dyn Clock) -> Result<(), Error>
{
	loop {
		let status = get_status(transport)?;
		match status.state {
			State::DfuDnloadIdle | State::DfuManifest => return Ok(()),
			State::DfuDnbusy | State::DfuDnloadSync => clock.sleep_ms(u64::from(status.poll_timeout_ms)),
			State::DfuError => return Err(ErrorKind::Protocol(format!("device reported {} writing element", status.status)).error()),
			other => return Err(ErrorKind::Protocol(format!("unexpected device state {other} writing element")).error()),
		}
	}
}

/// `SET_ADDRESS(dfuseAddress)` (if an address is known) followed by a
/// zero-length `DNLOAD` with `transaction=2`.
pub fn leave(transport: &dyn Transport, clock: &dyn Clock, quirks: Quirk, dfuse_address: Option<u32>) -> Result<(), Error>
{
	if let Some(address) = dfuse_address {
		set_address(transport, clock, quirks, address)?;
	}

	match dnload(transport, 2, &[]) {
		Ok(_) => Ok(()),
		Err(err) if quirks.contains(Quirk::DfuseLeave) => {
			log::debug!("ignoring leave-request error under the dfuseLeave quirk: {err}");
			Ok(())
		},
		Err(err) => Err(err),
	}
}

/// One element of a DfuSe file container target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuSeElement
{
	pub address: u32,
	pub data: Vec<u8>,
}

/// One target of a DfuSe file container, selecting the interface whose
/// `altsetting == alt_setting`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuSeTarget
{
	pub alt_setting: u8,
	pub name: Option<String>,
	pub elements: Vec<DfuSeElement>,
}

/// A parsed DfuSe file container, with the DFU suffix already stripped by
/// the caller (`file::DfuFile`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DfuSeContainer
{
	pub targets: Vec<DfuSeTarget>,
}

const PREFIX_SIGNATURE: &[u8; 5] = b"DfuSe";
const TARGET_SIGNATURE: &[u8; 6] = b"Target";
const TARGET_NAME_LEN: usize = 255;
/// `"Target"(6) + bAlternateSetting(1) + bTargetNamed(1) + szTargetName(255)
/// + dwTargetSize(4) + dwNbElements(4)`.
const TARGET_HEADER_LEN: usize = 6 + 1 + 1 + TARGET_NAME_LEN + 4 + 4;

pub fn parse_container(payload: &[u8]) -> Result<DfuSeContainer, Error>
{
	if payload.len() < 11 || &payload[0..5] != PREFIX_SIGNATURE {
		return Err(ErrorKind::Data("missing \"DfuSe\" container prefix".into()).error());
	}

	let version = payload[5];
	if version != 1 {
		log::warn!("unexpected DfuSe container version {version}, parsing anyway");
	}

	let num_targets = payload[10];
	let mut offset = 11usize;
	let mut targets = Vec::with_capacity(usize::from(num_targets));

	for _ in 0..num_targets {
		if payload.len() < offset + TARGET_HEADER_LEN {
			return Err(ErrorKind::Data("truncated DfuSe target header".into()).error());
		}
		if &payload[offset..offset + 6] != TARGET_SIGNATURE {
			return Err(ErrorKind::Data("missing \"Target\" signature".into()).error());
		}

		let alt_setting = payload[offset + 6];
		let named = payload[offset + 7] != 0;
		let name_bytes = &payload[offset + 8..offset + 8 + TARGET_NAME_LEN];
		let name = named.then(|| {
			let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
			String::from_utf8_lossy(&name_bytes[..end]).into_owned()
		});

		let elements_offset = offset + 6 + 1 + 1 + TARGET_NAME_LEN;
		let num_elements = u32::from_le_bytes(payload[elements_offset + 4..elements_offset + 8].try_into().unwrap());

		offset += TARGET_HEADER_LEN;

		let mut elements = Vec::with_capacity(num_elements as usize);
		for _ in 0..num_elements {
			if payload.len() < offset + 8 {
				return Err(ErrorKind::Data("truncated DfuSe element header".into()).error());
			}
			let address = u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap());
			let size = u32::from_le_bytes(payload[offset + 4..offset + 8].try_into().unwrap()) as usize;
			offset += 8;

			if payload.len() < offset + size {
				return Err(ErrorKind::Data("truncated DfuSe element payload".into()).error());
			}
			let data = payload[offset..offset + size].to_vec();
			offset += size;

			elements.push(DfuSeElement { address, data });
		}

		targets.push(DfuSeTarget { alt_setting, name, elements });
	}

	if offset != payload.len() {
		log::warn!("DfuSe container parse left {} trailing bytes unconsumed", payload.len() - offset);
	}

	Ok(DfuSeContainer { targets })
}

/// Re-serialize a container, the inverse of [`parse_container`].
pub fn write_container(container: &DfuSeContainer) -> Vec<u8>
{
	let mut out = Vec::new();
	out.extend_from_slice(PREFIX_SIGNATURE);
	out.push(1); // version
	let size_offset = out.len();
	out.extend_from_slice(&[0u8; 4]); // total size, patched below
	out.push(container.targets.len() as u8);

	for target in &container.targets {
		out.extend_from_slice(TARGET_SIGNATURE);
		out.push(target.alt_setting);
		out.push(target.name.is_some() as u8);

		let mut name_field = [0u8; TARGET_NAME_LEN];
		if let Some(name) = &target.name {
			let bytes = name.as_bytes();
			let n = bytes.len().min(TARGET_NAME_LEN);
			name_field[..n].copy_from_slice(&bytes[..n]);
		}
		out.extend_from_slice(&name_field);

		let target_size_offset = out.len();
		out.extend_from_slice(&[0u8; 4]);
		out.extend_from_slice(&(target.elements.len() as u32).to_le_bytes());

		let elements_start = out.len();
		for element in &target.elements {
			out.extend_from_slice(&element.address.to_le_bytes());
			out.extend_from_slice(&(element.data.len() as u32).to_le_bytes());
			out.extend_from_slice(&element.data);
		}
		let target_size = (out.len() - elements_start) as u32;
		out[target_size_offset..target_size_offset + 4].copy_from_slice(&target_size.to_le_bytes());
	}

	let total_size = out.len() as u32;
	out[size_offset..size_offset + 4].copy_from_slice(&total_size.to_le_bytes());
	out
}

#[cfg(test)]
mod tests
{
	use super::*;
	use crate::clock::RecordingClock;
	use crate::status::State as DfuState;
	use crate::transport::mock::MockDevice;

	#[test]
	fn container_roundtrips_through_parse_and_write()
	{
		let container = DfuSeContainer {
			targets: vec![DfuSeTarget {
				alt_setting: 0,
				name: Some("ST...".to_string()),
				elements: vec![DfuSeElement { address: 0x0800_0000, data: vec![0xDE, 0xAD, 0xBE, 0xEF] }],
			}],
		};

		let bytes = write_container(&container);
		let parsed = parse_container(&bytes).unwrap();

		assert_eq!(parsed.targets.len(), 1);
		assert_eq!(parsed.targets[0].elements[0].address, 0x0800_0000);
		assert_eq!(parsed.targets[0].elements[0].data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
	}

	#[test]
	fn rejects_missing_prefix_signature()
	{
		assert!(parse_container(&[0u8; 20]).is_err());
	}

	#[test]
	fn set_address_sends_command_byte_and_four_address_bytes()
	{
		let mock = MockDevice::new(DfuState::DfuIdle);
		*mock.poll_timeout_ms.borrow_mut() = 0;
		let clock = RecordingClock::default();

		set_address(&mock, &clock, Quirk::none(), 0x0800_0000).unwrap();

		let downloaded = mock.downloaded.borrow();
		assert_eq!(downloaded[0], CMD_SET_ADDRESS);
		assert_eq!(&downloaded[1..5], &0x0800_0000u32.to_le_bytes());
	}

	#[test]
	fn erase_and_write_element_spanning_two_pages()
	{
		let segment = memory_layout::parse("@Flash/0x08000000/02*001Kg").unwrap();
		let layout = memory_layout::flatten(&segment);

		let mock = MockDevice::new(DfuState::DfuIdle);
		*mock.poll_timeout_ms.borrow_mut() = 0;
		let clock = RecordingClock::default();

		let data = vec![0x5Au8; 1500];
		dnload_element(&mock, &clock, Quirk::none(), &layout, 0x0800_0000, &data, 1024, false, false).unwrap();

		// last write leaves the device's downloaded buffer holding only the final chunk
		// (each SET_ADDRESS+DNLOAD pair starts a fresh transfer in the mock)
		assert!(!mock.downloaded.borrow().is_empty());
	}
}
