// SPDX-License-Identifier: MIT OR Apache-2.0

//! USB-level newtypes and the DFU class request/descriptor constants.
//!
//! Small `Copy` newtypes around the raw integers USB descriptors are built
//! from, so a `Vid` can never be compared against a `Pid` by accident.

use std::fmt::{self, Display, Formatter};

/// USB vendor ID.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vid(pub u16);

/// USB product ID.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u16);

impl Display for Vid
{
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result
	{
		write!(f, "{:04x}", self.0)
	}
}

impl Display for Pid
{
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result
	{
		write!(f, "{:04x}", self.0)
	}
}

/// `bInterfaceClass` for the DFU class (USB DFU spec §4.2.3).
pub const DFU_INTERFACE_CLASS: u8 = 0xFE;
/// `bInterfaceSubClass` for DFU.
pub const DFU_INTERFACE_SUBCLASS: u8 = 0x01;
/// `bInterfaceProtocol` while the device is still running its normal application.
pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
/// `bInterfaceProtocol` once the device is in a DFU-mode configuration.
pub const DFU_PROTOCOL_DFU: u8 = 0x02;

/// `bDescriptorType` of the DFU functional descriptor.
pub const DFU_FUNCTIONAL_DESCRIPTOR_TYPE: u8 = 0x21;

/// The operating mode a DFU-class interface was found in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DfuOperatingMode
{
	/// Interface was found attached to the device's normal runtime configuration
	/// (`bInterfaceProtocol == 1`); a `DFU_DETACH` is needed before it is usable.
	Runtime,
	/// Interface was found in a configuration the device re-enumerated into after
	/// detaching (`bInterfaceProtocol == 2`); DFU requests can be issued directly.
	Dfu,
}

/// `bRequest` values of the DFU class-specific control requests (USB DFU spec §3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DfuRequest
{
	Detach = 0x00,
	Dnload = 0x01,
	Upload = 0x02,
	GetStatus = 0x03,
	ClrStatus = 0x04,
	GetState = 0x05,
	Abort = 0x06,
}

impl DfuRequest
{
	pub const fn request_value(self) -> u8
	{
		self as u8
	}
}

/// The DFU functional descriptor (USB DFU spec §4.1.3), copied out of a
/// configuration descriptor's extra bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DfuFunctionalDescriptor
{
	pub length: u8,
	pub descriptor_type: u8,
	pub attributes: u8,
	pub detach_timeout_ms: u16,
	pub transfer_size: u16,
	pub dfu_version: u16,
}

impl DfuFunctionalDescriptor
{
	pub const LENGTH: usize = 9;

	/// `bmAttributes` bit 0: device will not generate a detach-detect pulse;
	/// host must issue a USB reset to return the device to its run-time mode.
	pub fn will_detach(&self) -> bool
	{
		self.attributes & 0b0000_1000 != 0
	}

	/// `bmAttributes` bit 1: device can communicate during manifestation.
	pub fn manifestation_tolerant(&self) -> bool
	{
		self.attributes & 0b0000_0100 != 0
	}

	/// `bmAttributes` bit 2: device is capable of `UPLOAD`.
	pub fn can_upload(&self) -> bool
	{
		self.attributes & 0b0000_0010 != 0
	}

	/// `bmAttributes` bit 3: device is capable of `DNLOAD`.
	pub fn can_download(&self) -> bool
	{
		self.attributes & 0b0000_0001 != 0
	}

	/// `true` if `bcdDFUVersion` is the ST DfuSe 1.1a extension (`0x011A`)
	/// rather than plain USB DFU 1.0/1.1 (`0x0100`/`0x0110`).
	pub fn is_dfuse(&self) -> bool
	{
		self.dfu_version == 0x011A
	}

	/// Parse a functional descriptor out of its 9 raw bytes, as found in a
	/// configuration descriptor's class-specific extra data.
	pub fn copy_from_bytes(bytes: &[u8]) -> Option<Self>
	{
		if bytes.len() < Self::LENGTH {
			return None;
		}

		if bytes[1] != DFU_FUNCTIONAL_DESCRIPTOR_TYPE {
			return None;
		}

		Some(Self {
			length: bytes[0],
			descriptor_type: bytes[1],
			attributes: bytes[2],
			detach_timeout_ms: u16::from_le_bytes([bytes[3], bytes[4]]),
			transfer_size: u16::from_le_bytes([bytes[5], bytes[6]]),
			dfu_version: u16::from_le_bytes([bytes[7], bytes[8]]),
		})
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn parses_dfuse_functional_descriptor()
	{
		// bLength=9, bDescriptorType=0x21, bmAttributes=0x0B (will_detach|can_upload|can_download),
		// wDetachTimeOut=255, wTransferSize=2048, bcdDFUVersion=0x011A
		let bytes = [0x09, 0x21, 0x0B, 0xFF, 0x00, 0x00, 0x08, 0x1A, 0x01];
		let desc = DfuFunctionalDescriptor::copy_from_bytes(&bytes).unwrap();

		assert_eq!(desc.detach_timeout_ms, 255);
		assert_eq!(desc.transfer_size, 2048);
		assert!(desc.is_dfuse());
		assert!(desc.will_detach());
		assert!(desc.can_upload());
		assert!(desc.can_download());
		assert!(!desc.manifestation_tolerant());
	}

	#[test]
	fn rejects_wrong_descriptor_type()
	{
		let bytes = [0x09, 0x04, 0, 0, 0, 0, 0, 0, 0];
		assert!(DfuFunctionalDescriptor::copy_from_bytes(&bytes).is_none());
	}

	#[test]
	fn rejects_short_buffer()
	{
		let bytes = [0x09, 0x21, 0x0D];
		assert!(DfuFunctionalDescriptor::copy_from_bytes(&bytes).is_none());
	}
}
