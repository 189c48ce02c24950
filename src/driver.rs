// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command dispatcher composing the descriptor walker, matcher, protocol
//! engine, and DfuSe engine into the four user-visible operations. The one
//! place in this crate allowed to print user-facing status — everything it
//! calls into returns data or errors only, so it stays testable without a
//! terminal.

use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::descriptor::{self, DfuInterface};
use crate::dfuse;
use crate::engine;
use crate::error::{Error, ErrorKind};
use crate::file::DfuFile;
use crate::matcher::{self, MatchCriteria};
use crate::progress::ProgressSink;
use crate::quirks::Quirk;
use crate::transport::{NusbTransport, Transport};
use crate::usb::DfuOperatingMode;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
const DETACH_TIMEOUT_MS: u16 = 1000;
const DEFAULT_DETACH_DELAY_MS: u64 = 5000;

/// The driver's finite state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState
{
	Probing,
	RunTimeDetected,
	WaitingForDfu,
	DfuReady,
	Operating,
	ResettingOrLeaving,
	Done,
}

/// Options governing a DfuSe-mode session, derived from `-s/--dfuse-address`
/// and its colon-separated tokens.
#[derive(Debug, Clone, Default)]
pub struct DfuSeOptions
{
	pub address: Option<u32>,
	pub force: bool,
	pub leave: bool,
	pub mass_erase: bool,
	pub unprotect: bool,
	pub will_reset: bool,
	pub upload_limit: Option<u64>,
}

/// Threads the match criteria and discovered interfaces explicitly through a
/// command instead of relying on process-wide state.
pub struct Session
{
	pub criteria: MatchCriteria,
	pub interfaces: Vec<DfuInterface>,
	pub state: SessionState,
}

impl Session
{
	pub fn new(criteria: MatchCriteria) -> Self
	{
		Self { criteria, interfaces: Vec::new(), state: SessionState::Probing }
	}

	/// Walk every USB device and keep the ones matching this session's criteria.
	pub fn probe(&mut self) -> Result<(), Error>
	{
		let all = descriptor::walk()?;
		self.interfaces = matcher::filter(&all, &self.criteria);

		self.state = match self.interfaces.first() {
			None => SessionState::Probing,
			Some(iface) if iface.operating_mode == DfuOperatingMode::Dfu => SessionState::DfuReady,
			Some(_) => SessionState::RunTimeDetected,
		};

		Ok(())
	}
}

fn select_single(interfaces: &[DfuInterface]) -> Result<&DfuInterface, Error>
{
	match interfaces.len() {
		0 => Err(ErrorKind::NotFound.error()),
		1 => Ok(&interfaces[0]),
		_ => Err(ErrorKind::Protocol(
			"more than one DFU-capable interface matched; narrow the selection with --device/--path/--serial".into(),
		)
		.error()),
	}
}

fn open_transport(iface: &DfuInterface) -> Result<NusbTransport, Error>
{
	let (device, interface) = descriptor::claim(&iface.device_info, iface)?;
	Ok(NusbTransport::new(device, interface, CONTROL_TIMEOUT))
}

/// Run-time → DFU transition: claiming and alt-setting selection already
/// happened in [`open_transport`] via [`descriptor::claim`].
fn run_detach_sequence(transport: &dyn Transport, clock: &dyn Clock, iface: &DfuInterface) -> Result<(), Error>
{
	let status = engine::get_status(transport).unwrap_or(crate::status::DfuStatus {
		status: crate::status::Status::Ok,
		poll_timeout_ms: 0,
		state: crate::status::State::AppIdle,
		string_index: 0,
	});

	clock.sleep_ms(u64::from(status.poll_timeout_ms));

	match status.state {
		crate::status::State::AppIdle | crate::status::State::AppDetach => {
			engine::detach(transport, DETACH_TIMEOUT_MS)?;

			if iface.functional_descriptor.will_detach() {
				log::debug!("device will self-detach; not issuing a USB bus reset");
			} else if let Err(err) = transport.usb_reset() {
				if !matches!(err.kind, ErrorKind::NotFound) {
					return Err(err);
				}
				log::debug!("device vanished on bus reset, as expected after detach");
			}
		},
		crate::status::State::DfuError => {
			// Already in DFU mode; clear the stale error and proceed.
			engine::clear_status(transport)?;
		},
		_ => {},
	}

	Ok(())
}

/// Transition a run-time interface into DFU mode and re-probe for the
/// resulting (now DFU-mode) interface, requiring exactly one survivor.
fn enter_dfu_mode(session: &mut Session, clock: &dyn Clock, detach_delay_ms: u64) -> Result<DfuInterface, Error>
{
	let runtime_iface = select_single(&session.interfaces)?.clone();

	if runtime_iface.operating_mode == DfuOperatingMode::Dfu {
		return Ok(runtime_iface);
	}

	{
		let transport = open_transport(&runtime_iface)?;
		run_detach_sequence(&transport, clock, &runtime_iface)?;
	}

	session.state = SessionState::WaitingForDfu;
	clock.sleep_ms(detach_delay_ms);

	// Force the run-time side to "impossible" so only DFU-mode candidates match.
	let mut dfu_criteria = session.criteria.clone();
	if let Some(device) = &mut dfu_criteria.device {
		device.vendor_runtime = matcher::MatchToken::Impossible;
		device.product_runtime = matcher::MatchToken::Impossible;
	}

	let all = descriptor::walk()?;
	let matched = matcher::filter(&all, &dfu_criteria);
	let dfu_iface = select_single(&matched)?.clone();

	session.interfaces = matched;
	session.state = SessionState::DfuReady;
	Ok(dfu_iface)
}

/// `-l/--list`: enumerate and print every matched interface.
pub fn cmd_list(criteria: &MatchCriteria) -> Result<(), Error>
{
	let all = descriptor::walk()?;
	let matched = matcher::filter(&all, criteria);

	if matched.is_empty() {
		println!("No DFU capable USB devices found");
		return Ok(());
	}

	for iface in &matched {
		let mode = match iface.operating_mode {
			DfuOperatingMode::Runtime => "Runtime",
			DfuOperatingMode::Dfu => "DFU",
		};
		println!(
			"Found {mode}: [{:04x}:{:04x}] devnum={}, cfg={}, intf={}, alt={}, name=\"{}\", serial=\"{}\"",
			iface.vid.0,
			iface.pid.0,
			iface.device_info.device_address(),
			iface.configuration_value,
			iface.interface_number,
			iface.alt_setting,
			iface.alt_setting_name.as_deref().unwrap_or("UNKNOWN"),
			iface.serial_name.as_deref().unwrap_or("UNKNOWN"),
		);
	}

	Ok(())
}

/// `-e/--detach`: transition a run-time device into DFU mode and stop.
pub fn cmd_detach(criteria: &MatchCriteria, detach_delay_ms: u64) -> Result<(), Error>
{
	let clock = SystemClock;
	let mut session = Session::new(criteria.clone());
	session.probe()?;

	let iface = select_single(&session.interfaces)?.clone();
	let transport = open_transport(&iface)?;
	run_detach_sequence(&transport, &clock, &iface)?;
	clock.sleep_ms(detach_delay_ms);

	session.state = SessionState::Done;
	println!("Device successfully detached");
	Ok(())
}

/// `-U/--upload`: read firmware out of a device already in DFU mode.
///
/// When `dfuse_options.address` is set on a DfuSe-mode interface, the read
/// starts from that address (`SET_ADDRESS` before the upload loop); when
/// `dfuse_options.upload_limit` is set and `expected_size` isn't, it governs
/// how many bytes are read before the loop stops early.
pub fn cmd_upload(
	criteria: &MatchCriteria,
	detach_delay_ms: u64,
	transfer_size_override: Option<u16>,
	expected_size: Option<u64>,
	dfuse_options: &DfuSeOptions,
	progress: &dyn ProgressSink,
) -> Result<Vec<u8>, Error>
{
	let clock = SystemClock;
	let mut session = Session::new(criteria.clone());
	session.probe()?;

	let iface = enter_dfu_mode(&mut session, &clock, detach_delay_ms)?;
	let transport = open_transport(&iface)?;

	let transfer_size = engine::negotiate_transfer_size(
		iface.functional_descriptor.transfer_size,
		transfer_size_override,
		iface.max_packet_size0,
	);

	if iface.functional_descriptor.is_dfuse() {
		if let Some(address) = dfuse_options.address {
			dfuse::set_address(&transport, &clock, iface.quirks, address)?;
		}
	}

	let expected_size = expected_size.or(dfuse_options.upload_limit);

	session.state = SessionState::Operating;
	let firmware = engine::upload_loop(&transport, &clock, progress, transfer_size, expected_size)?;
	session.state = SessionState::Done;

	Ok(firmware)
}

/// `-D/--download`: write `file` to a device already in DFU mode, routing
/// through the DfuSe engine when the file's `bcdDFU` marks it as such.
pub fn cmd_download(
	criteria: &MatchCriteria,
	detach_delay_ms: u64,
	transfer_size_override: Option<u16>,
	file: &DfuFile,
	dfuse_options: &DfuSeOptions,
	reset_after: bool,
	progress: &dyn ProgressSink,
) -> Result<(), Error>
{
	let clock = SystemClock;
	let mut session = Session::new(criteria.clone());
	session.probe()?;

	let iface = enter_dfu_mode(&mut session, &clock, detach_delay_ms)?;
	let transport = open_transport(&iface)?;

	let transfer_size = engine::negotiate_transfer_size(
		iface.functional_descriptor.transfer_size,
		transfer_size_override,
		iface.max_packet_size0,
	);

	session.state = SessionState::Operating;

	if file.is_dfuse() || iface.functional_descriptor.is_dfuse() {
		download_dfuse(&session, &transport, &clock, file, dfuse_options, transfer_size, progress)?;
	} else {
		let manifestation_tolerant = iface.functional_descriptor.manifestation_tolerant();
		engine::download_loop(&transport, &clock, progress, file.payload(), transfer_size, manifestation_tolerant)?;
	}

	session.state = SessionState::ResettingOrLeaving;
	if reset_after {
		if let Err(err) = transport.usb_reset() {
			if !matches!(err.kind, ErrorKind::NotFound) {
				return Err(err);
			}
		}
	}

	session.state = SessionState::Done;
	Ok(())
}

fn download_dfuse(
	session: &Session,
	transport: &dyn Transport,
	clock: &dyn Clock,
	file: &DfuFile,
	options: &DfuSeOptions,
	transfer_size: u16,
	progress: &dyn ProgressSink,
) -> Result<(), Error>
{
	let iface = select_single(&session.interfaces)?;
	let quirks = iface.quirks;

	if options.unprotect {
		dfuse::read_unprotect(transport)?;
		return Ok(());
	}

	if options.mass_erase {
		dfuse::mass_erase(transport, clock, quirks)?;
	}

	let container = dfuse::parse_container(file.payload())?;
	progress.set_length(container.targets.iter().flat_map(|t| &t.elements).map(|e| e.data.len() as u64).sum());

	let mut dfuse_address = options.address;

	for target in &container.targets {
		let Some(target_iface) = session.interfaces.iter().find(|i| i.alt_setting == target.alt_setting) else {
			log::warn!("no matching alt-setting {} for DfuSe target {:?}; skipping", target.alt_setting, target.name);
			continue;
		};

		let layout = target_iface.memory_layout.clone().unwrap_or_default();
		transport.set_alt_setting(target.alt_setting)?;

		for element in &target.elements {
			if dfuse_address.is_none() {
				dfuse_address = Some(element.address);
			}

			dfuse::dnload_element(
				transport,
				clock,
				quirks,
				&layout,
				element.address,
				&element.data,
				transfer_size,
				options.mass_erase,
				options.force,
			)?;
			progress.inc(element.data.len() as u64);
		}
	}

	progress.finish();

	if options.leave || options.will_reset {
		dfuse::leave(transport, clock, quirks, dfuse_address)?;
	}

	Ok(())
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn dfuse_options_default_to_no_special_behavior()
	{
		let options = DfuSeOptions::default();
		assert!(options.address.is_none());
		assert!(!options.force);
		assert!(!options.leave);
	}

	#[test]
	fn select_single_reports_not_found_on_empty_list()
	{
		let interfaces: Vec<DfuInterface> = Vec::new();
		let err = select_single(&interfaces).unwrap_err();
		assert!(matches!(err.kind, ErrorKind::NotFound));
	}
}
