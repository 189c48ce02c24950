// SPDX-License-Identifier: MIT OR Apache-2.0

//! Descriptor walker: enumerates USB devices and their DFU-class alt
//! settings, recovers each one's DFU functional descriptor by whichever of
//! three fallback methods succeeds first, and applies mode detection and the
//! quirks table.

use std::time::Duration;

use nusb::transfer::{Control, ControlType, Recipient};
use nusb::DeviceInfo;

use crate::error::{Error, ErrorKind};
use crate::memory_layout::{self, Segment};
use crate::quirks::{self, Quirk};
use crate::usb::{
	DfuFunctionalDescriptor, DfuOperatingMode, Pid, Vid, DFU_FUNCTIONAL_DESCRIPTOR_TYPE, DFU_INTERFACE_CLASS,
	DFU_INTERFACE_SUBCLASS, DFU_PROTOCOL_DFU, DFU_PROTOCOL_RUNTIME,
};

const GET_DESCRIPTOR: u8 = 0x06;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Bitset over `{isDfuMode, hasMultipleAlts}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceFlags
{
	pub is_dfu_mode: bool,
	pub has_multiple_alts: bool,
}

/// One DFU-capable alt setting found on some device, not yet claimed.
///
/// A plain `Vec<DfuInterface>` is built by [`walk`] and handed to the
/// matcher.
#[derive(Debug, Clone)]
pub struct DfuInterface
{
	pub device_info: DeviceInfo,
	pub vid: Vid,
	pub pid: Pid,
	pub configuration_value: u8,
	pub interface_number: u8,
	pub alt_setting: u8,
	pub alt_setting_name: Option<String>,
	pub serial_name: Option<String>,
	pub operating_mode: DfuOperatingMode,
	pub flags: InterfaceFlags,
	pub functional_descriptor: DfuFunctionalDescriptor,
	pub quirks: Quirk,
	pub memory_layout: Option<Vec<Segment>>,
	/// `bMaxPacketSize0` from the device descriptor; floors the negotiated
	/// transfer size alongside `wTransferSize`.
	pub max_packet_size0: u8,
}

impl DfuInterface
{
	/// `"bus-port.port.port…"`, the USB path filter format.
	pub fn path(&self) -> String
	{
		let chain = self.device_info.port_chain();
		let ports = chain.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(".");
		format!("{}-{}", self.device_info.bus_number(), ports)
	}
}

/// Enumerate all USB devices currently attached and return every DFU-class
/// alt setting found on any of them, in DFU mode or still running.
pub fn walk() -> Result<Vec<DfuInterface>, Error>
{
	let devices = nusb::list_devices().map_err(|e| Error::from(e).with_ctx("listing USB devices"))?;

	let mut found = Vec::new();
	for device_info in devices {
		if let Err(err) = walk_device(&device_info, &mut found) {
			log::debug!("skipping device {:04x}:{:04x}: {err}", device_info.vendor_id(), device_info.product_id());
		}
	}

	Ok(found)
}

fn walk_device(device_info: &DeviceInfo, found: &mut Vec<DfuInterface>) -> Result<(), Error>
{
	let device = device_info.open().map_err(Error::from)?;
	let vid = Vid(device_info.vendor_id());
	let pid = Pid(device_info.product_id());
	let max_packet_size0 = fetch_max_packet_size0(&device);

	for config in device.configurations() {
		// Step 1: extra bytes trailing the configuration descriptor, before the first
		// interface descriptor.
		let config_level_functional = find_functional_descriptor_before_first_interface(&config);

		let interfaces: Vec<_> = config.interfaces().collect();
		let interfaces_in_config = interfaces.len();

		for interface in &interfaces {
			let alts: Vec<_> = interface.alt_settings().collect();
			let has_multiple_alts = alts.len() > 1;

			for alt in &alts {
				if !is_dfu_alt(alt) {
					continue;
				}

				// Step 2: extra bytes after this DFU interface descriptor.
				let interface_level_functional =
					alt.descriptors().find(|d| d.descriptor_type() == DFU_FUNCTIONAL_DESCRIPTOR_TYPE).map(|d| d.to_vec());

				let raw_functional = config_level_functional.clone().or(interface_level_functional).or_else(|| {
					// Step 3: explicit GET_DESCRIPTOR(type=DFU, index=0) on the open device.
					fetch_functional_descriptor_explicit(&device, alt.interface_number())
				});

				let saw_dfu_interface = true;
				let mut functional_descriptor = synthesize_functional_descriptor(raw_functional.as_deref(), saw_dfu_interface);

				let alt_setting_name = alt.string_index().and_then(|index| {
					fetch_string_descriptor(&device, u8::from(index), false)
				});

				let serial_quirks_hint = quirks::lookup(vid, pid, None);
				let serial_name = device_info.serial_number().map(|s| s.to_string()).or_else(|| {
					device_info
						.serial_number()
						.is_none()
						.then(|| fetch_device_serial(&device, serial_quirks_hint))
						.flatten()
				});

				let quirks = quirks::lookup(vid, pid, serial_name.as_deref());

				// `forceDfu11` overrides a reported bcdDFUVersion.
				if quirks.contains(Quirk::ForceDfu11) {
					functional_descriptor.dfu_version = 0x0110;
				}

				let mut operating_mode = detect_operating_mode(vid, pid, alt.protocol(), &functional_descriptor, interfaces_in_config);

				// A functional descriptor we had to synthesize from nothing still counts as
				// "a DFU interface was seen"; mode detection above already used its bLength=7
				// default version, so nothing further to adjust here.
				if functional_descriptor.length == 0 {
					operating_mode = DfuOperatingMode::Runtime;
				}

				let memory_layout = alt_setting_name.as_deref().and_then(|name| {
					memory_layout::parse(name).ok().map(|segment| {
						let mut flat = memory_layout::flatten(&segment);
						if quirks.contains(Quirk::DfuseLayout) {
							// Vendor-specific layout fixups would be rewritten into `flat`
							// here; no device in this crate's quirks table needs one yet.
						}
						flat.drain(..).collect::<Vec<_>>()
					})
				});

				found.push(DfuInterface {
					device_info: device_info.clone(),
					vid,
					pid,
					configuration_value: config.configuration_value(),
					interface_number: alt.interface_number(),
					alt_setting: alt.alternate_setting(),
					alt_setting_name,
					serial_name,
					operating_mode,
					flags: InterfaceFlags { is_dfu_mode: operating_mode == DfuOperatingMode::Dfu, has_multiple_alts },
					functional_descriptor,
					quirks,
					memory_layout,
					max_packet_size0,
				});
			}
		}
	}

	Ok(())
}

fn is_dfu_alt(alt: &nusb::descriptors::InterfaceAltSetting) -> bool
{
	alt.class() == DFU_INTERFACE_CLASS && alt.subclass() == DFU_INTERFACE_SUBCLASS
}

fn find_functional_descriptor_before_first_interface(config: &nusb::descriptors::Configuration) -> Option<Vec<u8>>
{
	for descriptor in config.descriptors() {
		if descriptor.descriptor_type() == 0x04 {
			// Reached the first interface descriptor; functional descriptors after this
			// point belong to step 2 (per-interface extra bytes), not this step.
			break;
		}
		if descriptor.descriptor_type() == DFU_FUNCTIONAL_DESCRIPTOR_TYPE {
			return Some(descriptor.to_vec());
		}
	}
	None
}

fn fetch_functional_descriptor_explicit(device: &nusb::Device, interface_number: u8) -> Option<Vec<u8>>
{
	let mut buffer = [0u8; 9];
	let control = Control {
		control_type: ControlType::Standard,
		recipient: Recipient::Interface,
		request: GET_DESCRIPTOR,
		value: u16::from(DFU_FUNCTIONAL_DESCRIPTOR_TYPE) << 8,
		index: u16::from(interface_number),
	};

	match device.control_in_blocking(control, &mut buffer, CONTROL_TIMEOUT) {
		Ok(n) if n >= 7 => Some(buffer[..n].to_vec()),
		_ => None,
	}
}

/// `GET_DESCRIPTOR(type=DEVICE)`, just far enough to read `bMaxPacketSize0` at
/// offset 7. Falls back to the USB low-speed floor of 8 if the device won't
/// answer.
fn fetch_max_packet_size0(device: &nusb::Device) -> u8
{
	const DEVICE_DESCRIPTOR_TYPE: u16 = 0x01;

	let mut buffer = [0u8; 8];
	let control = Control { control_type: ControlType::Standard, recipient: Recipient::Device, request: GET_DESCRIPTOR, value: DEVICE_DESCRIPTOR_TYPE << 8, index: 0 };

	match device.control_in_blocking(control, &mut buffer, CONTROL_TIMEOUT) {
		Ok(n) if n >= 8 => buffer[7],
		_ => 8,
	}
}

/// No descriptor at all synthesizes a minimal `bLength=7` stand-in; a genuine
/// 7-byte descriptor (pre-DFU-1.1, no `bcdDFUVersion` field) gets `0x0100`
/// filled in; anything shorter than 9 and not exactly 7 is malformed and
/// falls back to the same defaults with a warning.
fn synthesize_functional_descriptor(raw: Option<&[u8]>, saw_dfu_interface: bool) -> DfuFunctionalDescriptor
{
	match raw {
		Some(bytes) if bytes.len() >= 9 => {
			DfuFunctionalDescriptor::copy_from_bytes(bytes).unwrap_or(default_functional_descriptor())
		},
		Some(bytes) if bytes.len() == 7 => DfuFunctionalDescriptor {
			length: 7,
			descriptor_type: DFU_FUNCTIONAL_DESCRIPTOR_TYPE,
			attributes: bytes[2],
			detach_timeout_ms: u16::from_le_bytes([bytes[3], bytes[4]]),
			transfer_size: u16::from_le_bytes([bytes[5], bytes[6]]),
			dfu_version: 0x0100,
		},
		Some(bytes) => {
			log::warn!("DFU functional descriptor has unexpected bLength {}, defaulting version/transfer size", bytes.len());
			default_functional_descriptor()
		},
		None if saw_dfu_interface => default_functional_descriptor(),
		None => DfuFunctionalDescriptor {
			length: 0,
			descriptor_type: 0,
			attributes: 0,
			detach_timeout_ms: 0,
			transfer_size: 0,
			dfu_version: 0,
		},
	}
}

fn default_functional_descriptor() -> DfuFunctionalDescriptor
{
	DfuFunctionalDescriptor {
		length: 7,
		descriptor_type: DFU_FUNCTIONAL_DESCRIPTOR_TYPE,
		attributes: 0,
		detach_timeout_ms: 0,
		transfer_size: 0,
		dfu_version: 0x0100,
	}
}

/// `isDfuMode := (bInterfaceProtocol == 2)`, with three compatibility
/// overrides for bootloaders that mislabel their protocol byte.
fn detect_operating_mode(
	vid: Vid,
	pid: Pid,
	protocol: u8,
	func: &DfuFunctionalDescriptor,
	interfaces_in_config: usize,
) -> DfuOperatingMode
{
	if protocol == DFU_PROTOCOL_DFU {
		return DfuOperatingMode::Dfu;
	}

	// DfuSe devices that mislabel their protocol byte.
	if func.dfu_version == 0x011A && protocol == 0 {
		return DfuOperatingMode::Dfu;
	}

	// LPC bootloader.
	if vid == Vid(0x1FC9) && pid == Pid(0x000C) && protocol == 1 {
		return DfuOperatingMode::Dfu;
	}

	// Old Jabra devices.
	if vid == Vid(0x0B0E) && protocol == 0 && interfaces_in_config == 1 {
		return DfuOperatingMode::Dfu;
	}

	if protocol == DFU_PROTOCOL_RUNTIME {
		DfuOperatingMode::Runtime
	} else {
		DfuOperatingMode::Runtime
	}
}

/// Fetch and decode a string descriptor, tolerating bootloaders that
/// misreport `bLength`: if fewer bytes came back than `bLength` claims, the
/// claimed length is patched down to what was actually read before decoding.
fn fetch_string_descriptor(device: &nusb::Device, index: u8, as_utf8: bool) -> Option<String>
{
	if index == 0 {
		return None;
	}

	let mut buffer = [0u8; 255];
	let control = Control {
		control_type: ControlType::Standard,
		recipient: Recipient::Device,
		request: GET_DESCRIPTOR,
		value: (0x03u16 << 8) | u16::from(index),
		index: 0x0409,
	};

	let n = device.control_in_blocking(control, &mut buffer, CONTROL_TIMEOUT).ok()?;
	if n < 2 {
		return None;
	}

	if as_utf8 {
		return std::str::from_utf8(&buffer[2..n]).ok().map(str::to_string);
	}

	Some(decode_utf16le_ascii(&buffer[2..n]))
}

fn fetch_device_serial(device: &nusb::Device, quirks: Quirk) -> Option<String>
{
	// Without a cached serial-number string index from the device descriptor (not
	// retained on `DeviceInfo` by this crate's nusb version), fall back to index 3,
	// the overwhelmingly common `iSerialNumber` slot for DFU-class devices.
	fetch_string_descriptor(device, 3, quirks.contains(Quirk::Utf8Serial))
}

/// UTF-16LE → ASCII, mapping non-ASCII high bytes to `'?'`.
fn decode_utf16le_ascii(bytes: &[u8]) -> String
{
	char::decode_utf16(bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])))
		.map(|r| match r {
			Ok(c) if c.is_ascii() => c,
			_ => '?',
		})
		.collect()
}

/// Claim the interface this [`DfuInterface`] describes and select its alt
/// setting, ready for protocol-engine use.
pub fn claim(device_info: &DeviceInfo, iface: &DfuInterface) -> Result<(nusb::Device, nusb::Interface), Error>
{
	let device = device_info.open().map_err(Error::from)?;
	claim_on(device, iface)
}

fn claim_on(device: nusb::Device, iface: &DfuInterface) -> Result<(nusb::Device, nusb::Interface), Error>
{
	let interface = device
		.claim_interface(iface.interface_number)
		.map_err(Error::from)
		.map_err(|e| e.with_ctx("claiming DFU interface"))?;

	interface
		.set_alt_setting(iface.alt_setting)
		.map_err(Error::from)
		.map_err(|e| e.with_ctx("selecting DFU alt setting"))?;

	Ok((device, interface))
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn synthesizes_default_when_no_descriptor_found()
	{
		let func = synthesize_functional_descriptor(None, true);
		assert_eq!(func.length, 7);
		assert_eq!(func.dfu_version, 0x0100);
	}

	#[test]
	fn forces_dfu_1_0_on_bare_7_byte_descriptor()
	{
		let bytes = [0x07, 0x21, 0x0D, 0xFF, 0x00, 0x00, 0x08];
		let func = synthesize_functional_descriptor(Some(&bytes), true);
		assert_eq!(func.length, 7);
		assert_eq!(func.dfu_version, 0x0100);
		assert_eq!(func.transfer_size, 2048);
	}

	#[test]
	fn mode_detection_dfuse_mislabeled_protocol()
	{
		let func = DfuFunctionalDescriptor {
			length: 9,
			descriptor_type: 0x21,
			attributes: 0,
			detach_timeout_ms: 0,
			transfer_size: 0,
			dfu_version: 0x011A,
		};
		let mode = detect_operating_mode(Vid(0x0483), Pid(0xDF11), 0, &func, 1);
		assert_eq!(mode, DfuOperatingMode::Dfu);
	}

	#[test]
	fn mode_detection_lpc_bootloader_override()
	{
		let func = default_functional_descriptor();
		let mode = detect_operating_mode(Vid(0x1FC9), Pid(0x000C), 1, &func, 1);
		assert_eq!(mode, DfuOperatingMode::Dfu);
	}

	#[test]
	fn mode_detection_jabra_single_interface_override()
	{
		let func = default_functional_descriptor();
		let mode = detect_operating_mode(Vid(0x0B0E), Pid(0x1234), 0, &func, 1);
		assert_eq!(mode, DfuOperatingMode::Dfu);
	}

	#[test]
	fn mode_detection_jabra_multi_interface_is_runtime()
	{
		let func = default_functional_descriptor();
		let mode = detect_operating_mode(Vid(0x0B0E), Pid(0x1234), 0, &func, 2);
		assert_eq!(mode, DfuOperatingMode::Runtime);
	}

	#[test]
	fn decodes_ascii_string_descriptor()
	{
		// "Hi" as UTF-16LE
		let bytes = [b'H', 0, b'i', 0];
		assert_eq!(decode_utf16le_ascii(&bytes), "Hi");
	}

	#[test]
	fn replaces_non_ascii_with_question_mark()
	{
		// U+00E9 'é' as UTF-16LE
		let bytes = [0xE9, 0x00];
		assert_eq!(decode_utf16le_ascii(&bytes), "?");
	}
}
