// SPDX-License-Identifier: MIT OR Apache-2.0

//! Match-criteria parsing and the filter the descriptor walker's output is
//! run through before anything becomes user-visible: a criteria bundle
//! assembled from CLI flags, then applied as a single filter pass over
//! discovered interfaces, with separate run-time and DFU-mode vendor,
//! product, and serial fields.

use crate::descriptor::DfuInterface;
use crate::error::{Error, ErrorKind};
use crate::usb::{DfuOperatingMode, Pid, Vid};

/// One matched field: "anything" (`*`), "impossible" (`-`/absent-on-the-
/// impossible-side), or an exact value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchToken<T>
{
	Any,
	Impossible,
	Exact(T),
}

impl<T> Default for MatchToken<T>
{
	fn default() -> Self
	{
		MatchToken::Any
	}
}

impl<T: PartialEq> MatchToken<T>
{
	pub fn matches(&self, value: &T) -> bool
	{
		match self {
			MatchToken::Any => true,
			MatchToken::Impossible => false,
			MatchToken::Exact(expected) => expected == value,
		}
	}
}

fn parse_string_token(token: &str) -> MatchToken<String>
{
	match token {
		"*" => MatchToken::Any,
		"-" => MatchToken::Impossible,
		other => MatchToken::Exact(other.to_string()),
	}
}

fn parse_vid_token(token: &str) -> Result<MatchToken<Vid>, Error>
{
	match token {
		"*" => Ok(MatchToken::Any),
		"-" => Ok(MatchToken::Impossible),
		hex => {
			let value = u16::from_str_radix(hex, 16)
				.map_err(|_| ErrorKind::Usage(format!("malformed vendor id {hex:?}")).error())?;
			Ok(MatchToken::Exact(Vid(value)))
		},
	}
}

fn parse_pid_token(token: &str) -> Result<MatchToken<Pid>, Error>
{
	match token {
		"*" => Ok(MatchToken::Any),
		"-" => Ok(MatchToken::Impossible),
		hex => {
			let value = u16::from_str_radix(hex, 16)
				.map_err(|_| ErrorKind::Usage(format!("malformed product id {hex:?}")).error())?;
			Ok(MatchToken::Exact(Pid(value)))
		},
	}
}

/// Parsed `-d/--device` value: `V:P` applied to both modes, or
/// `Vrun:Prun,Vdfu:Pdfu` where the second pair overrides for DFU-mode
/// candidates.
#[derive(Debug, Clone)]
pub struct DeviceMatch
{
	pub vendor_runtime: MatchToken<Vid>,
	pub product_runtime: MatchToken<Pid>,
	pub vendor_dfu: MatchToken<Vid>,
	pub product_dfu: MatchToken<Pid>,
}

fn parse_vp_pair(token: &str) -> Result<(MatchToken<Vid>, MatchToken<Pid>), Error>
{
	let (vendor, product) = token
		.split_once(':')
		.ok_or_else(|| ErrorKind::Usage(format!("malformed vendor:product pair {token:?}, expected V:P")).error())?;
	Ok((parse_vid_token(vendor)?, parse_pid_token(product)?))
}

pub fn parse_device_spec(spec: &str) -> Result<DeviceMatch, Error>
{
	let mut groups = spec.split(',');
	let first = groups.next().ok_or_else(|| ErrorKind::Usage("empty --device value".into()).error())?;
	let (vendor_runtime, product_runtime) = parse_vp_pair(first)?;

	match groups.next() {
		Some(second) => {
			let (vendor_dfu, product_dfu) = parse_vp_pair(second)?;
			Ok(DeviceMatch { vendor_runtime, product_runtime, vendor_dfu, product_dfu })
		},
		None => Ok(DeviceMatch {
			vendor_dfu: vendor_runtime.clone(),
			product_dfu: product_runtime.clone(),
			vendor_runtime,
			product_runtime,
		}),
	}
}

/// Parsed `-S/--serial` value: `S[,Sd]`, split the same way as `-d`.
pub fn parse_serial_spec(spec: &str) -> (MatchToken<String>, MatchToken<String>)
{
	let mut parts = spec.split(',');
	let runtime = parts.next().map(parse_string_token).unwrap_or(MatchToken::Any);
	let dfu = parts.next().map(parse_string_token).unwrap_or(runtime.clone());
	(runtime, dfu)
}

/// The full match-criteria bundle. Every field defaults to "match anything"
/// so an empty `MatchCriteria` selects every DFU-class interface found.
#[derive(Debug, Clone, Default)]
pub struct MatchCriteria
{
	pub path: Option<String>,
	pub device: Option<DeviceMatch>,
	pub config_index: Option<u8>,
	pub interface_index: Option<u8>,
	pub alt_index: Option<u8>,
	pub alt_name: Option<String>,
	pub devnum: Option<u8>,
	pub serial_runtime: MatchToken<String>,
	pub serial_dfu: MatchToken<String>,
}

/// Run every interface the walker found through `criteria`, keeping only
/// those that pass.
pub fn filter(interfaces: &[DfuInterface], criteria: &MatchCriteria) -> Vec<DfuInterface>
{
	interfaces.iter().filter(|iface| matches_criteria(iface, criteria)).cloned().collect()
}

fn matches_criteria(iface: &DfuInterface, criteria: &MatchCriteria) -> bool
{
	if let Some(path) = &criteria.path {
		if &iface.path() != path {
			return false;
		}
	}

	if let Some(devnum) = criteria.devnum {
		if iface.device_info.device_address() != devnum {
			return false;
		}
	}

	// A configIndex of zero is treated as absent.
	if let Some(config_index) = criteria.config_index {
		if config_index != 0 && iface.configuration_value != config_index {
			return false;
		}
	}

	if let Some(interface_index) = criteria.interface_index {
		if iface.interface_number != interface_index {
			return false;
		}
	}

	if let Some(alt_index) = criteria.alt_index {
		if iface.alt_setting != alt_index {
			return false;
		}
	}

	if let Some(alt_name) = &criteria.alt_name {
		if iface.alt_setting_name.as_deref() != Some(alt_name.as_str()) {
			return false;
		}
	}

	if let Some(device) = &criteria.device {
		let (vendor, product) = match iface.operating_mode {
			DfuOperatingMode::Dfu => (&device.vendor_dfu, &device.product_dfu),
			DfuOperatingMode::Runtime => (&device.vendor_runtime, &device.product_runtime),
		};
		if !vendor.matches(&iface.vid) || !product.matches(&iface.pid) {
			return false;
		}
	}

	let serial = match iface.operating_mode {
		DfuOperatingMode::Dfu => &criteria.serial_dfu,
		DfuOperatingMode::Runtime => &criteria.serial_runtime,
	};
	if !matches!(serial, MatchToken::Any) {
		let serial_name = iface.serial_name.clone().unwrap_or_default();
		if !serial.matches(&serial_name) {
			return false;
		}
	}

	true
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn wildcard_device_spec_matches_both_modes()
	{
		let m = parse_device_spec("*:*").unwrap();
		assert!(matches!(m.vendor_runtime, MatchToken::Any));
		assert!(matches!(m.vendor_dfu, MatchToken::Any));
	}

	#[test]
	fn single_pair_applies_to_both_modes()
	{
		let m = parse_device_spec("1234:5678").unwrap();
		assert_eq!(m.vendor_runtime, MatchToken::Exact(Vid(0x1234)));
		assert_eq!(m.vendor_dfu, MatchToken::Exact(Vid(0x1234)));
		assert_eq!(m.product_dfu, MatchToken::Exact(Pid(0x5678)));
	}

	#[test]
	fn dual_pair_overrides_dfu_side()
	{
		let m = parse_device_spec("1234:5678,0483:df11").unwrap();
		assert_eq!(m.vendor_runtime, MatchToken::Exact(Vid(0x1234)));
		assert_eq!(m.vendor_dfu, MatchToken::Exact(Vid(0x0483)));
		assert_eq!(m.product_dfu, MatchToken::Exact(Pid(0xDF11)));
	}

	#[test]
	fn impossible_token_forces_no_match()
	{
		let m = parse_device_spec("-:-").unwrap();
		assert!(matches!(m.vendor_runtime, MatchToken::Impossible));
		assert!(!m.vendor_runtime.matches(&Vid(0x1234)));
	}

	#[test]
	fn serial_spec_splits_on_comma()
	{
		let (runtime, dfu) = parse_serial_spec("ABC123,XYZ789");
		assert_eq!(runtime, MatchToken::Exact("ABC123".to_string()));
		assert_eq!(dfu, MatchToken::Exact("XYZ789".to_string()));
	}

	#[test]
	fn serial_spec_without_comma_reuses_first_for_dfu()
	{
		let (runtime, dfu) = parse_serial_spec("ABC123");
		assert_eq!(runtime, dfu);
	}

	#[test]
	fn rejects_malformed_vendor_product_pair()
	{
		assert!(parse_device_spec("not-a-pair").is_err());
	}
}
