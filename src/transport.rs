// SPDX-License-Identifier: MIT OR Apache-2.0

//! The synchronous control-transfer boundary between the protocol engine and
//! the underlying USB stack.
//!
//! Wraps `nusb::Interface::control_in_blocking`/`control_out_blocking` behind
//! a trait so the engine (`engine.rs`, `dfuse.rs`) can be driven by an
//! in-memory mock in tests.

use std::time::Duration;

use nusb::transfer::{Control, ControlType, Recipient};
use nusb::Interface;

use crate::error::{Error, ErrorKind, ErrorSource};

/// Direction + recipient + request-type triple bundled as the raw
/// `bmRequestType` byte the DFU spec and USB spec both describe it as.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RequestType(pub u8);

impl RequestType
{
	/// Host-to-device, class request, recipient interface: `0b00100001`.
	pub const CLASS_OUT: RequestType = RequestType(0b0010_0001);
	/// Device-to-host, class request, recipient interface: `0b10100001`.
	pub const CLASS_IN: RequestType = RequestType(0b1010_0001);

	fn control_type(self) -> ControlType
	{
		match (self.0 >> 5) & 0b11 {
			0 => ControlType::Standard,
			1 => ControlType::Class,
			_ => ControlType::Vendor,
		}
	}

	fn recipient(self) -> Recipient
	{
		match self.0 & 0b11 {
			0 => Recipient::Device,
			1 => Recipient::Interface,
			2 => Recipient::Endpoint,
			_ => Recipient::Other,
		}
	}
}

/// Everything the protocol engine needs from the USB layer: blocking control
/// transfers in and out, and a bus reset. Implemented for a real `nusb`
/// interface and, in tests, for an in-memory fake.
pub trait Transport
{
	/// Issue a control transfer reading `buffer.len()` bytes from the device.
	/// Returns the number of bytes actually transferred.
	fn control_in(&self, request_type: RequestType, request: u8, value: u16, buffer: &mut [u8]) -> Result<usize, Error>;

	/// Issue a control transfer writing `buffer` to the device.
	/// Returns the number of bytes actually transferred.
	fn control_out(&self, request_type: RequestType, request: u8, value: u16, buffer: &[u8]) -> Result<usize, Error>;

	/// Issue a USB bus reset on the device owning this interface.
	fn usb_reset(&self) -> Result<(), Error>;

	/// Select an alternate setting on the already-claimed interface, for
	/// DfuSe multi-target files picking a new memory region.
	fn set_alt_setting(&self, alt_setting: u8) -> Result<(), Error>;

	/// Interface number this transport issues requests against, for `wIndex`.
	fn interface_number(&self) -> u16;
}

/// Production [`Transport`] backed by a claimed `nusb` interface.
pub struct NusbTransport
{
	device: nusb::Device,
	interface: Interface,
	timeout: Duration,
}

impl NusbTransport
{
	pub fn new(device: nusb::Device, interface: Interface, timeout: Duration) -> Self
	{
		Self { device, interface, timeout }
	}
}

impl Transport for NusbTransport
{
	fn control_in(&self, request_type: RequestType, request: u8, value: u16, buffer: &mut [u8]) -> Result<usize, Error>
	{
		let control = Control {
			control_type: request_type.control_type(),
			recipient: request_type.recipient(),
			request,
			value,
			index: self.interface_number(),
		};

		self.interface
			.control_in_blocking(control, buffer, self.timeout)
			.map_err(|e| ErrorKind::External(ErrorSource::Usb(e.to_string())).error())
	}

	fn control_out(&self, request_type: RequestType, request: u8, value: u16, buffer: &[u8]) -> Result<usize, Error>
	{
		let control = Control {
			control_type: request_type.control_type(),
			recipient: request_type.recipient(),
			request,
			value,
			index: self.interface_number(),
		};

		self.interface
			.control_out_blocking(control, buffer, self.timeout)
			.map_err(|e| ErrorKind::External(ErrorSource::Usb(e.to_string())).error())
	}

	fn usb_reset(&self) -> Result<(), Error>
	{
		self.device
			.reset()
			.map_err(|e| ErrorKind::External(ErrorSource::Usb(e.to_string())).error())
	}

	fn set_alt_setting(&self, alt_setting: u8) -> Result<(), Error>
	{
		self.interface
			.set_alt_setting(alt_setting)
			.map_err(|e| ErrorKind::External(ErrorSource::Usb(e.to_string())).error())
	}

	fn interface_number(&self) -> u16
	{
		u16::from(self.interface.interface_number())
	}
}

#[cfg(test)]
pub(crate) mod mock
{
	//! A fake [`Transport`] that runs a tiny device-side DFU state machine in
	//! memory, for exercising `engine.rs`/`dfuse.rs` without real hardware.

	use std::cell::RefCell;

	use super::*;
	use crate::status::{DfuStatus, State, Status};

	/// One scripted step a test wants the mock device to take in response to
	/// the next request it receives.
	pub struct MockDevice
	{
		pub state: RefCell<State>,
		pub status: RefCell<Status>,
		pub poll_timeout_ms: RefCell<u32>,
		pub uploaded_data: Vec<u8>,
		pub downloaded: RefCell<Vec<u8>>,
		pub reset_count: RefCell<u32>,
		pub alt_setting: RefCell<u8>,
	}

	impl MockDevice
	{
		pub fn new(initial_state: State) -> Self
		{
			Self {
				state: RefCell::new(initial_state),
				status: RefCell::new(Status::Ok),
				poll_timeout_ms: RefCell::new(0),
				uploaded_data: Vec::new(),
				downloaded: RefCell::new(Vec::new()),
				reset_count: RefCell::new(0),
				alt_setting: RefCell::new(0),
			}
		}
	}

	impl Transport for MockDevice
	{
		fn control_in(&self, _request_type: RequestType, request: u8, _value: u16, buffer: &mut [u8]) -> Result<usize, Error>
		{
			use crate::usb::DfuRequest;

			if request == DfuRequest::GetStatus.request_value() {
				// Simulate the one-poll synchronization a real device performs: a
				// GETSTATUS immediately after DNLOAD/SET_ADDRESS reports the settled
				// state rather than the transient `*_SYNC` one.
				{
					let mut state = self.state.borrow_mut();
					*state = match *state {
						State::DfuDnloadSync => State::DfuDnloadIdle,
						State::DfuManifestSync => State::DfuIdle,
						other => other,
					};
				}

				let status = DfuStatus { status: *self.status.borrow(), poll_timeout_ms: *self.poll_timeout_ms.borrow(), state: *self.state.borrow(), string_index: 0 };
				let bytes = [
					status.status.to_byte(),
					status.poll_timeout_ms.to_le_bytes()[0],
					status.poll_timeout_ms.to_le_bytes()[1],
					status.poll_timeout_ms.to_le_bytes()[2],
					status.state.to_byte(),
					status.string_index,
				];
				let n = bytes.len().min(buffer.len());
				buffer[..n].copy_from_slice(&bytes[..n]);
				return Ok(n);
			}

			if request == DfuRequest::GetState.request_value() {
				buffer[0] = self.state.borrow().to_byte();
				return Ok(1);
			}

			if request == DfuRequest::Upload.request_value() {
				let n = self.uploaded_data.len().min(buffer.len());
				buffer[..n].copy_from_slice(&self.uploaded_data[..n]);
				return Ok(n);
			}

			Ok(0)
		}

		fn control_out(&self, _request_type: RequestType, request: u8, _value: u16, buffer: &[u8]) -> Result<usize, Error>
		{
			use crate::usb::DfuRequest;

			if request == DfuRequest::Dnload.request_value() {
				self.downloaded.borrow_mut().extend_from_slice(buffer);
				*self.state.borrow_mut() = if buffer.is_empty() { State::DfuManifestSync } else { State::DfuDnloadSync };
			} else if request == DfuRequest::Abort.request_value() {
				*self.state.borrow_mut() = State::DfuIdle;
			} else if request == DfuRequest::ClrStatus.request_value() {
				*self.status.borrow_mut() = Status::Ok;
				*self.state.borrow_mut() = State::DfuIdle;
			} else if request == DfuRequest::Detach.request_value() {
				*self.state.borrow_mut() = State::AppDetach;
			}

			Ok(buffer.len())
		}

		fn usb_reset(&self) -> Result<(), Error>
		{
			*self.reset_count.borrow_mut() += 1;
			Ok(())
		}

		fn set_alt_setting(&self, alt_setting: u8) -> Result<(), Error>
		{
			*self.alt_setting.borrow_mut() = alt_setting;
			Ok(())
		}

		fn interface_number(&self) -> u16
		{
			0
		}
	}
}
