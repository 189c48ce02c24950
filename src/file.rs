// SPDX-License-Identifier: MIT OR Apache-2.0

//! The DFU file-suffix/prefix reader.
//!
//! Wire layout: a 16-byte suffix (`bcdDevice, idProduct, idVendor, bcdDFU,
//! "UFD", bLength, dwCRC`, all little-endian except the 3-byte ASCII
//! signature) trailing the firmware payload, CRC32 (IEEE, inverted) computed
//! over everything preceding the CRC field itself.

use crc32fast::Hasher;

use crate::error::{Error, ErrorKind};

/// `{firmware, prefixLen, suffixLen, idVendor, idProduct, bcdDevice, bcdDFU}`.
#[derive(Debug, Clone)]
pub struct DfuFile
{
	pub firmware: Vec<u8>,
	pub prefix_len: usize,
	pub suffix_len: usize,
	pub id_vendor: u16,
	pub id_product: u16,
	pub bcd_device: u16,
	pub bcd_dfu: u16,
}

/// `bcdDFU` value identifying a DfuSe (ST extension) container rather than a
/// plain DFU 1.0/1.1 payload.
pub const BCD_DFUSE: u16 = 0x011A;

const SUFFIX_SIGNATURE: &[u8; 3] = b"UFD";
const SUFFIX_LEN: usize = 16;

impl DfuFile
{
	/// The payload bytes once prefix and suffix framing are stripped.
	pub fn payload(&self) -> &[u8]
	{
		&self.firmware[self.prefix_len..self.firmware.len() - self.suffix_len]
	}

	/// `true` if this file's `bcdDFU` marks it as a DfuSe container.
	pub fn is_dfuse(&self) -> bool
	{
		self.bcd_dfu == BCD_DFUSE
	}

	/// Parse a DFU file suffix off the tail of `raw`, with no vendor-specific
	/// prefix (`prefix_len = 0`). Callers that need a nonzero prefix can
	/// construct `DfuFile` directly.
	pub fn parse(raw: Vec<u8>) -> Result<Self, Error>
	{
		if raw.len() < SUFFIX_LEN {
			return Err(ErrorKind::Data(format!("firmware file too short to hold a DFU suffix ({} bytes)", raw.len())).error());
		}

		let suffix = &raw[raw.len() - SUFFIX_LEN..];
		if &suffix[10..13] != SUFFIX_SIGNATURE {
			return Err(ErrorKind::Data("firmware file is missing the \"UFD\" DFU suffix signature".into()).error());
		}

		let suffix_len = usize::from(suffix[13]);
		if suffix_len != SUFFIX_LEN {
			return Err(ErrorKind::Data(format!("unsupported DFU suffix length {suffix_len} (expected {SUFFIX_LEN})")).error());
		}

		let stored_crc = u32::from_le_bytes(suffix[12..16].try_into().unwrap());
		let mut hasher = Hasher::new();
		hasher.update(&raw[..raw.len() - 4]);
		let computed_crc = !hasher.finalize();
		if stored_crc != computed_crc {
			return Err(ErrorKind::Data(format!("DFU suffix CRC mismatch: file has {stored_crc:#010x}, computed {computed_crc:#010x}")).error());
		}

		let bcd_device = u16::from_le_bytes(suffix[0..2].try_into().unwrap());
		let id_product = u16::from_le_bytes(suffix[2..4].try_into().unwrap());
		let id_vendor = u16::from_le_bytes(suffix[4..6].try_into().unwrap());
		let bcd_dfu = u16::from_le_bytes(suffix[6..8].try_into().unwrap());

		Ok(Self { firmware: raw, prefix_len: 0, suffix_len: SUFFIX_LEN, id_vendor, id_product, bcd_device, bcd_dfu })
	}

	/// Append a suffix to `payload` and return the finished file bytes, the
	/// inverse of [`Self::parse`].
	pub fn write(payload: &[u8], id_vendor: u16, id_product: u16, bcd_device: u16, bcd_dfu: u16) -> Vec<u8>
	{
		let mut out = Vec::with_capacity(payload.len() + SUFFIX_LEN);
		out.extend_from_slice(payload);
		out.extend_from_slice(&bcd_device.to_le_bytes());
		out.extend_from_slice(&id_product.to_le_bytes());
		out.extend_from_slice(&id_vendor.to_le_bytes());
		out.extend_from_slice(&bcd_dfu.to_le_bytes());
		out.extend_from_slice(SUFFIX_SIGNATURE);
		out.push(SUFFIX_LEN as u8);

		let mut hasher = Hasher::new();
		hasher.update(&out);
		let crc = !hasher.finalize();
		out.extend_from_slice(&crc.to_le_bytes());

		out
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn write_then_parse_roundtrips()
	{
		let payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
		let raw = DfuFile::write(&payload, 0x1209, 0xDF11, 0x0200, BCD_DFUSE);

		let file = DfuFile::parse(raw).unwrap();
		assert_eq!(file.payload(), payload.as_slice());
		assert_eq!(file.id_vendor, 0x1209);
		assert_eq!(file.id_product, 0xDF11);
		assert_eq!(file.bcd_device, 0x0200);
		assert!(file.is_dfuse());
	}

	#[test]
	fn rejects_bad_crc()
	{
		let payload = vec![1, 2, 3];
		let mut raw = DfuFile::write(&payload, 0x1209, 0xDF11, 0, 0x0100);
		let last = raw.len() - 1;
		raw[last] ^= 0xFF;

		assert!(DfuFile::parse(raw).is_err());
	}

	#[test]
	fn rejects_missing_signature()
	{
		let raw = vec![0u8; 16];
		assert!(DfuFile::parse(raw).is_err());
	}

	#[test]
	fn rejects_too_short_file()
	{
		assert!(DfuFile::parse(vec![0u8; 4]).is_err());
	}
}
