// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration coverage over the public, hardware-free surface: match
//! criteria parsing, the memory-layout grammar, DfuSe container round-trips,
//! and the quirks table.

#[cfg(test)]
mod tests
{
	use dfu_util_rs::dfuse::{self, DfuSeContainer, DfuSeElement, DfuSeTarget};
	use dfu_util_rs::file::{DfuFile, BCD_DFUSE};
	use dfu_util_rs::matcher::{self, MatchCriteria, MatchToken};
	use dfu_util_rs::memory_layout;
	use dfu_util_rs::quirks::{self, Quirk};
	use dfu_util_rs::usb::{Pid, Vid};

	#[test]
	fn device_spec_with_dual_pairs_overrides_only_dfu_side()
	{
		let m = matcher::parse_device_spec("0483:df11,1209:df11").unwrap();
		assert_eq!(m.vendor_runtime, MatchToken::Exact(Vid(0x0483)));
		assert_eq!(m.vendor_dfu, MatchToken::Exact(Vid(0x1209)));
		assert_eq!(m.product_dfu, MatchToken::Exact(Pid(0xDF11)));
	}

	#[test]
	fn empty_match_criteria_is_the_default_wildcard()
	{
		let criteria = MatchCriteria::default();
		assert!(criteria.device.is_none());
		assert!(criteria.path.is_none());
		assert!(matches!(criteria.serial_runtime, MatchToken::Any));
	}

	#[test]
	fn memory_layout_parses_stm32_style_alt_name_and_finds_segments()
	{
		let layout = memory_layout::parse("@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg").unwrap();
		let flat = memory_layout::flatten(&layout);

		// 4 * 16KiB + 1 * 64KiB + 7 * 128KiB = 64KiB + 64KiB + 896KiB worth of segments.
		assert_eq!(flat.len(), 4 + 1 + 7);

		let first = memory_layout::find_segment(&flat, 0x0800_0000).unwrap();
		assert_eq!(first.start_address, 0x0800_0000);
		assert!(first.erasable);
		assert!(first.writable);

		let last_bank_addr = 0x0800_0000 + 4 * 16 * 1024 + 64 * 1024;
		let in_large_sector = memory_layout::find_segment(&flat, last_bank_addr).unwrap();
		assert_eq!(in_large_sector.page_size, 128 * 1024);
	}

	#[test]
	fn dfu_file_round_trips_through_write_and_parse()
	{
		let payload = b"firmware-bytes".to_vec();
		let raw = DfuFile::write(&payload, 0x1209, 0xDF11, 0x0100, BCD_DFUSE);

		let file = DfuFile::parse(raw).unwrap();
		assert_eq!(file.payload(), payload.as_slice());
		assert!(file.is_dfuse());
		assert_eq!(file.id_vendor, 0x1209);
	}

	#[test]
	fn dfuse_container_round_trips_with_multiple_targets()
	{
		let container = DfuSeContainer {
			targets: vec![
				DfuSeTarget {
					alt_setting: 0,
					name: Some("Internal Flash".to_string()),
					elements: vec![DfuSeElement { address: 0x0800_0000, data: vec![1, 2, 3, 4] }],
				},
				DfuSeTarget { alt_setting: 1, name: None, elements: vec![DfuSeElement { address: 0x0900_0000, data: vec![0xAA; 64] }] },
			],
		};

		let bytes = dfuse::write_container(&container);
		let parsed = dfuse::parse_container(&bytes).unwrap();

		assert_eq!(parsed.targets.len(), 2);
		assert_eq!(parsed.targets[0].name.as_deref(), Some("Internal Flash"));
		assert!(parsed.targets[1].name.is_none());
		assert_eq!(parsed.targets[1].elements[0].data.len(), 64);
	}

	#[test]
	fn stm32_dfuse_bootloader_quirks_are_keyed_off_vid_pid_and_serial()
	{
		let with_erratum_serial = quirks::lookup(Vid(0x0483), Pid(0xDF11), Some("200364500000ABCDEF"));
		assert!(with_erratum_serial.contains(Quirk::Stm32H7EraseStall));
		assert!(with_erratum_serial.contains(Quirk::DfuseLeave));

		let unrelated_device = quirks::lookup(Vid(0x1209), Pid(0xDF11), Some("200364500000ABCDEF"));
		assert_eq!(unrelated_device, Quirk::none());
	}
}
