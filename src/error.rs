// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error handling for the DFU engine and driver: a closed set of kinds that
//! map onto distinct CLI exit codes (`sysexits(3)`), wrapping an optional
//! source error and an optional human-readable context string.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};

use thiserror::Error;

/// Kinds of errors the engine and driver can produce. Each maps to exactly
/// one `sysexits` exit code via [`ErrorKind::exit_code`].
#[derive(Debug)]
pub enum ErrorKind
{
	/// Malformed arguments, contradictory options, missing required flag.
	Usage(String),

	/// No matching device found (retryable under `--wait`).
	NotFound,

	/// USB transport failure, lost device, or file I/O.
	Io(String),

	/// Device reported `dfuERROR` with no clear recovery, or an unexpected
	/// state was observed after a command.
	Protocol(String),

	/// Malformed DfuSe file: bad signature, inconsistent size fields.
	Data(String),

	/// Allocation failure, unhandled mode, or other internal bug.
	Software(String),

	/// Couldn't create an output file (e.g. the `-U/--upload` destination).
	CantCreate(String),

	/// USB open failed for what looks like a permissions reason. Surfaced
	/// via the same `IoError` exit code (see `DESIGN.md`).
	Permission(String),

	/// Unhandled error from an external crate.
	External(ErrorSource),
}

impl ErrorKind
{
	/// Wrap this kind into an [`Error`] with no source.
	#[inline]
	pub fn error(self) -> Error
	{
		Error::new(self, None)
	}

	/// Wrap this kind into an [`Error`], recording `source` as the cause.
	#[inline]
	pub fn error_from<E: StdError + Send + Sync + 'static>(self, source: E) -> Error
	{
		Error::new(self, Some(Box::new(source)))
	}

	/// The `sysexits(3)` exit code this kind maps to (0 ok, 64 usage, 65
	/// data, 66 no input, 70 software, 73 can't create, 74 I/O, 76
	/// protocol). There's no separate code for permission errors;
	/// `DESIGN.md` records the decision to fold those into `EX_IOERR`
	/// rather than invent a ninth exit status.
	pub fn exit_code(&self) -> i32
	{
		match self {
			ErrorKind::Usage(_) => 64,
			ErrorKind::Data(_) => 65,
			ErrorKind::NotFound => 66,
			ErrorKind::Software(_) => 70,
			ErrorKind::CantCreate(_) => 73,
			ErrorKind::Io(_) => 74,
			ErrorKind::Permission(_) => 74,
			ErrorKind::Protocol(_) => 76,
			ErrorKind::External(_) => 70,
		}
	}
}

impl From<ErrorKind> for Error
{
	fn from(kind: ErrorKind) -> Self
	{
		kind.error()
	}
}

impl Display for ErrorKind
{
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result
	{
		use ErrorKind::*;
		match self {
			Usage(why) => write!(f, "usage error: {why}"),
			NotFound => write!(f, "no matching DFU-capable device found"),
			Io(why) => write!(f, "I/O error: {why}"),
			Protocol(why) => write!(f, "DFU protocol error: {why}"),
			Data(why) => write!(f, "malformed firmware data: {why}"),
			Software(why) => write!(f, "internal error: {why}"),
			CantCreate(why) => write!(f, "couldn't create output file: {why}"),
			Permission(why) => write!(f, "permission error: {why}"),
			External(source) => write!(f, "{source}"),
		}
	}
}

/// Top-level error type. Easily constructed from [`ErrorKind`].
#[derive(Debug)]
pub struct Error
{
	pub kind: ErrorKind,
	pub source: Option<Box<dyn StdError + Send + Sync>>,
	/// Additional context about what was being attempted, e.g. "claiming the DFU interface".
	pub context: Option<String>,
}

impl Error
{
	pub fn new(kind: ErrorKind, source: Option<Box<dyn StdError + Send + Sync>>) -> Self
	{
		Self { kind, source, context: None }
	}

	/// Attach context describing what was being attempted when this error occurred.
	#[must_use]
	pub fn with_ctx(mut self, ctx: &str) -> Self
	{
		self.context = Some(ctx.to_string());
		self
	}

	/// The exit code this error should cause the process to terminate with.
	pub fn exit_code(&self) -> i32
	{
		self.kind.exit_code()
	}
}

impl Display for Error
{
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result
	{
		if let Some(ctx) = &self.context {
			write!(f, "(while {ctx}): {}", self.kind)?;
		} else {
			write!(f, "{}", self.kind)?;
		}

		if let Some(source) = &self.source {
			write!(f, "\nCaused by: {source}")?;
		}

		Ok(())
	}
}

impl StdError for Error
{
	fn source(&self) -> Option<&(dyn StdError + 'static)>
	{
		self.source.as_deref().map(|e| e as &dyn StdError)
	}
}

/// Sources of external error this crate doesn't otherwise have a more specific kind for.
#[derive(Debug, Error)]
pub enum ErrorSource
{
	#[error(transparent)]
	StdIo(#[from] std::io::Error),

	#[error("USB transport error: {0}")]
	Usb(String),
}

impl From<std::io::Error> for Error
{
	fn from(other: std::io::Error) -> Self
	{
		use std::io::ErrorKind as IoKind;
		match other.kind() {
			IoKind::PermissionDenied => ErrorKind::Permission(other.to_string()).error_from(other),
			IoKind::NotFound => ErrorKind::NotFound.error_from(other),
			_ => ErrorKind::External(ErrorSource::StdIo(other)).error(),
		}
	}
}

/// Extension trait to pull the [`ErrorKind`] out of a `Result<T, Error>`
/// without consuming it.
pub trait ResErrorKind<T>
{
	fn err_kind(&self) -> Result<&T, &ErrorKind>;
}

impl<T> ResErrorKind<T> for Result<T, Error>
{
	fn err_kind(&self) -> Result<&T, &ErrorKind>
	{
		self.as_ref().map_err(|e| &e.kind)
	}
}
