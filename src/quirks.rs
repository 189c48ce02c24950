// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-device quirks: known deviations from the DFU/DfuSe specifications
//! that the engine and DfuSe layer need to work around.
//!
//! A lookup table keyed by VID/PID, generalised from the one STM32H7 erase
//! workaround this crate's quirk table started from.

use bitmask_enum::bitmask;

use crate::usb::{Pid, Vid};

/// Bitmask of quirky behaviours a device is known to exhibit.
#[bitmask(u8)]
pub enum Quirk
{
	/// Override a reported `bcdDFUVersion` to `0x0110`; some devices claim a
	/// DFU version their bootloader doesn't actually implement correctly.
	ForceDfu11,

	/// Treat the serial-number string descriptor's payload as raw UTF-8
	/// rather than UTF-16LE.
	Utf8Serial,

	/// Apply vendor-specific fixups to the parsed memory layout.
	DfuseLayout,

	/// Tolerate no response on the DfuSe leave request.
	DfuseLeave,

	/// STM32H7 Revision V (and some earlier silicon) reports `dfuDNBUSY`
	/// forever for `ERASE_PAGE` commands targeting sectors beyond the first
	/// 1MiB bank; a `CLRSTATUS` recovers the device to `dfuIDLE` without
	/// actually losing the erase. See ST community thread referenced in the
	/// workaround this quirk is named after.
	Stm32H7EraseStall,
}

/// STM32 bootloader's well-known VID:PID pair (DfuSe bootloader, AN3156).
const STM32_VID: Vid = Vid(0x0483);
const STM32_DFU_PID: Pid = Pid(0xDF11);

/// Look up which quirks apply to a device, from VID/PID and (where the quirk
/// depends on it) its serial number.
///
/// The STM32H7 erase-stall quirk and the DfuSe-leave-is-silent quirk are both
/// keyed off the same STM32 DfuSe bootloader; the erase-stall half is further
/// narrowed to a serial number prefix because the bootloader doesn't expose
/// silicon revision any other way, and ST's own forum thread on the bug
/// identifies affected boards by this same prefix.
pub fn lookup(vid: Vid, pid: Pid, serial_number: Option<&str>) -> Quirk
{
	let mut quirks = Quirk::none();

	if vid == STM32_VID && pid == STM32_DFU_PID {
		quirks |= Quirk::DfuseLeave;

		if let Some(serial) = serial_number {
			if serial.starts_with("200364500000") {
				quirks |= Quirk::Stm32H7EraseStall;
			}
		}
	}

	quirks
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn stm32h7_serial_triggers_erase_stall_quirk()
	{
		let quirks = lookup(STM32_VID, STM32_DFU_PID, Some("200364500000"));
		assert!(quirks.contains(Quirk::Stm32H7EraseStall));
	}

	#[test]
	fn other_stm32_serials_are_unaffected_by_erase_stall()
	{
		let quirks = lookup(STM32_VID, STM32_DFU_PID, Some("ABCDEF123456"));
		assert!(!quirks.contains(Quirk::Stm32H7EraseStall));
	}

	#[test]
	fn all_stm32_dfuse_bootloaders_tolerate_silent_leave()
	{
		let quirks = lookup(STM32_VID, STM32_DFU_PID, Some("ABCDEF123456"));
		assert!(quirks.contains(Quirk::DfuseLeave));
	}

	#[test]
	fn non_stm32_devices_have_no_quirks()
	{
		let quirks = lookup(Vid(0x1209), Pid(0xDF11), Some("200364500000"));
		assert_eq!(quirks, Quirk::none());
	}

	#[test]
	fn missing_serial_still_gets_leave_quirk_but_not_erase_stall()
	{
		let quirks = lookup(STM32_VID, STM32_DFU_PID, None);
		assert!(quirks.contains(Quirk::DfuseLeave));
		assert!(!quirks.contains(Quirk::Stm32H7EraseStall));
	}
}
