// SPDX-License-Identifier: MIT OR Apache-2.0

//! The DFU protocol engine: the class request vocabulary, the state-machine
//! polling helpers, and the baseline upload/download loops. Driven through
//! this crate's [`Transport`]/[`Clock`] traits so it runs identically
//! against real hardware or the in-memory mock.

use crate::clock::Clock;
use crate::error::{Error, ErrorKind};
use crate::progress::ProgressSink;
use crate::status::{DfuStatus, State};
use crate::transport::{RequestType, Transport};
use crate::usb::DfuRequest;

/// Safety cap on `GETSTATUS` polls while waiting for `dfuIDLE` after
/// `ABORT` — several seconds at typical poll intervals.
const ABORT_TO_IDLE_MAX_POLLS: u32 = 64;

/// Linux `usbfs` URB size limit; `wTransferSize` is clamped to this
/// regardless of what the device advertises.
const LINUX_URB_LIMIT: u16 = 4096;

pub fn detach(transport: &dyn Transport, timeout_ms: u16) -> Result<(), Error>
{
	transport.control_out(RequestType::CLASS_OUT, DfuRequest::Detach.request_value(), timeout_ms, &[])?;
	Ok(())
}

pub fn get_status(transport: &dyn Transport) -> Result<DfuStatus, Error>
{
	let mut buffer = [0u8; DfuStatus::WIRE_LENGTH];
	let n = transport.control_in(RequestType::CLASS_IN, DfuRequest::GetStatus.request_value(), 0, &mut buffer)?;
	if n < DfuStatus::WIRE_LENGTH {
		return Err(ErrorKind::Protocol(format!("short GETSTATUS response ({n} of {} bytes)", DfuStatus::WIRE_LENGTH)).error());
	}
	Ok(DfuStatus::from_bytes(&buffer))
}

pub fn get_state(transport: &dyn Transport) -> Result<State, Error>
{
	let mut buffer = [0u8; 1];
	transport.control_in(RequestType::CLASS_IN, DfuRequest::GetState.request_value(), 0, &mut buffer)?;
	Ok(State::from_byte(buffer[0]))
}

pub fn clear_status(transport: &dyn Transport) -> Result<(), Error>
{
	transport.control_out(RequestType::CLASS_OUT, DfuRequest::ClrStatus.request_value(), 0, &[])?;
	Ok(())
}

pub fn abort(transport: &dyn Transport) -> Result<(), Error>
{
	transport.control_out(RequestType::CLASS_OUT, DfuRequest::Abort.request_value(), 0, &[])?;
	Ok(())
}

pub fn dnload(transport: &dyn Transport, transaction: u16, data: &[u8]) -> Result<usize, Error>
{
	transport.control_out(RequestType::CLASS_OUT, DfuRequest::Dnload.request_value(), transaction, data)
}

pub fn upload(transport: &dyn Transport, transaction: u16, buffer: &mut [u8]) -> Result<usize, Error>
{
	transport.control_in(RequestType::CLASS_IN, DfuRequest::Upload.request_value(), transaction, buffer)
}

/// Issue `ABORT`, then poll `GETSTATUS` until the device reaches `dfuIDLE`,
/// sleeping `bwPollTimeout` between polls.
pub fn abort_to_idle(transport: &dyn Transport, clock: &dyn Clock) -> Result<DfuStatus, Error>
{
	abort(transport)?;

	let mut status = get_status(transport)?;
	let mut polls = 0u32;

	while !status.state.is_dfu_idle() {
		if status.state.is_error() {
			clear_status(transport)?;
		}

		clock.sleep_ms(u64::from(status.poll_timeout_ms));
		status = get_status(transport)?;

		polls += 1;
		if polls > ABORT_TO_IDLE_MAX_POLLS {
			return Err(ErrorKind::Protocol("device did not return to dfuIDLE after ABORT".into()).error());
		}
	}

	Ok(status)
}

/// Adopt the device's `wTransferSize` unless overridden, clamp to the Linux
/// URB limit, and floor at `bMaxPacketSize0`.
pub fn negotiate_transfer_size(device_transfer_size: u16, user_override: Option<u16>, max_packet_size0: u8) -> u16
{
	let base = user_override.unwrap_or(device_transfer_size);
	base.min(LINUX_URB_LIMIT).max(u16::from(max_packet_size0))
}

/// Baseline DFU upload: transactions start at 2, terminate on a short read
/// or when `expected_size` is reached, then return to `dfuIDLE`.
pub fn upload_loop(
	transport: &dyn Transport,
	clock: &dyn Clock,
	progress: &dyn ProgressSink,
	transfer_size: u16,
	expected_size: Option<u64>,
) -> Result<Vec<u8>, Error>
{
	let mut firmware = Vec::new();
	let mut transaction: u16 = 2;

	progress.set_length(expected_size.unwrap_or(0));

	loop {
		let mut chunk = vec![0u8; usize::from(transfer_size)];
		let n = upload(transport, transaction, &mut chunk)?;
		chunk.truncate(n);
		firmware.extend_from_slice(&chunk);
		progress.inc(n as u64);
		transaction = transaction.wrapping_add(1);

		let reached_expected = expected_size.is_some_and(|size| firmware.len() as u64 >= size);
		if n < usize::from(transfer_size) || reached_expected {
			break;
		}
	}

	progress.finish();
	abort_to_idle(transport, clock)?;
	Ok(firmware)
}

/// Baseline DFU download: chunked `DNLOAD` + `GETSTATUS` polling, a trailing
/// zero-length `DNLOAD`, then manifestation.
pub fn download_loop(
	transport: &dyn Transport,
	clock: &dyn Clock,
	progress: &dyn ProgressSink,
	payload: &[u8],
	transfer_size: u16,
	manifestation_tolerant: bool,
) -> Result<(), Error>
{
	progress.set_length(payload.len() as u64);
	let mut transaction: u16 = 0;

	for chunk in payload.chunks(usize::from(transfer_size).max(1)) {
		dnload(transport, transaction, chunk)?;
		poll_until_dnload_idle(transport, clock)?;
		progress.inc(chunk.len() as u64);
		transaction = transaction.wrapping_add(1);
	}

	// Zero-length DNLOAD signals end-of-transfer.
	dnload(transport, transaction, &[])?;
	progress.finish();

	manifest(transport, clock, manifestation_tolerant)
}

fn poll_until_dnload_idle(transport: &dyn Transport, clock: &dyn Clock) -> Result<(), Error>
{
	loop {
		let status = get_status(transport)?;

		if status.state.is_error() {
			return Err(ErrorKind::Protocol(format!("device reported {} while downloading", status.status)).error());
		}

		match status.state {
			State::DfuDnloadIdle | State::DfuManifest => return Ok(()),
			State::DfuDnloadSync | State::DfuDnbusy => clock.sleep_ms(u64::from(status.poll_timeout_ms)),
			other => return Err(ErrorKind::Protocol(format!("unexpected device state {other} while downloading")).error()),
		}
	}
}

fn manifest(transport: &dyn Transport, clock: &dyn Clock, manifestation_tolerant: bool) -> Result<(), Error>
{
	if !manifestation_tolerant {
		// The device resets and re-enumerates; there's nothing left to poll.
		return Ok(());
	}

	loop {
		let status = get_status(transport)?;
		if status.state.is_dfu_idle() {
			return Ok(());
		}
		if status.state.is_error() {
			return Err(ErrorKind::Protocol(format!("device reported {} during manifestation", status.status)).error());
		}
		clock.sleep_ms(u64::from(status.poll_timeout_ms));
	}
}

#[cfg(test)]
mod tests
{
	use super::*;
	use crate::clock::RecordingClock;
	use crate::progress::NullSink;
	use crate::status::Status;
	use crate::transport::mock::MockDevice;

	#[test]
	fn transfer_size_adopts_device_value()
	{
		assert_eq!(negotiate_transfer_size(2048, None, 8), 2048);
	}

	#[test]
	fn transfer_size_clamps_to_linux_urb_limit()
	{
		assert_eq!(negotiate_transfer_size(16384, None, 8), 4096);
	}

	#[test]
	fn transfer_size_floors_at_max_packet_size0()
	{
		assert_eq!(negotiate_transfer_size(0, None, 64), 64);
	}

	#[test]
	fn transfer_size_zero_floors_at_low_speed_max_packet_size0()
	{
		assert_eq!(negotiate_transfer_size(0, None, 8), 8);
	}

	#[test]
	fn transfer_size_honours_user_override()
	{
		assert_eq!(negotiate_transfer_size(2048, Some(128), 8), 128);
	}

	#[test]
	fn upload_loop_terminates_on_short_read()
	{
		let mut mock = MockDevice::new(State::DfuUploadIdle);
		mock.uploaded_data = vec![0xAA; 100];
		let clock = RecordingClock::default();
		let progress = NullSink;

		let firmware = upload_loop(&mock, &clock, &progress, 256, None).unwrap();
		assert_eq!(firmware.len(), 100);
	}

	#[test]
	fn download_loop_sends_four_chunks_then_empty_dnload()
	{
		let mock = MockDevice::new(State::DfuIdle);
		*mock.poll_timeout_ms.borrow_mut() = 0;
		let clock = RecordingClock::default();
		let progress = NullSink;

		let payload = vec![0x55u8; 1024];
		download_loop(&mock, &clock, &progress, &payload, 256, false).unwrap();

		assert_eq!(mock.downloaded.borrow().len(), 1024);
	}

	#[test]
	fn abort_to_idle_clears_error_state_before_retrying()
	{
		let mock = MockDevice::new(State::DfuError);
		*mock.status.borrow_mut() = Status::ErrVerify;
		let clock = RecordingClock::default();

		// ABORT moves the mock straight to dfuIDLE; this also exercises the
		// error branch being skipped once state is no longer dfuERROR.
		let status = abort_to_idle(&mock, &clock).unwrap();
		assert!(status.state.is_dfu_idle());
	}
}
