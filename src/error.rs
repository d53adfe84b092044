// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2023 1BitSquared <info@1bitsquared.com>
// SPDX-FileContributor: Written by Mikaela Szekely <mikaela.szekely@qyriad.me>
//! Module for error handling code.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};

use thiserror::Error;

/// More convenient alias for `Box<dyn StdError + Send + Sync>`, which shows up in a few
/// signatures and structs.
type BoxedError = Box<dyn StdError + Send + Sync>;

/// Kinds of errors for [Error]. Use [ErrorKind::error] and [ErrorKind::error_from] to generate
/// the [Error] value for this ErrorKind.
///
/// These map directly onto the error taxonomy the fleet manager uses to decide what's
/// recoverable: a failed allocation or spawn is reported and carried on from, a board
/// disappearing mid-wait collapses to [ErrorKind::NotFound], and so on.
#[derive(Debug)]
pub enum ErrorKind
{
	/// Allocation or resource exhaustion failure.
	Memory,

	/// A caller-supplied argument was malformed (e.g. an unparsable identity string).
	Param(String),

	/// A caller-supplied value was out of range (e.g. firmware larger than flash).
	Range(String),

	/// The requested capability is not currently exposed by any interface of the board.
	Mode(Capability),

	/// The board, interface, or file being operated on could not be found.
	NotFound(String),

	/// Failed to read or write a file.
	Io(Option<String>),

	/// Access to the device was denied (permissions, or already claimed by another process).
	Access,

	/// The device or pool is busy and cannot currently accept the request.
	Busy,

	/// The firmware image is invalid, or incompatible with the detected board model.
	Firmware(String),

	/// Unhandled external error.
	External(ErrorSource),

	/// Anything else.
	Other(String),
}

use crate::capability::Capability;

impl ErrorKind
{
	/// Creates a new [Error] from this error kind.
	///
	/// Enables convenient code like:
	/// ```
	/// # use tyboard::error::ErrorKind;
	/// return Err(ErrorKind::Busy.error());
	/// # fn return_type() -> Result<(), tyboard::error::Error> { unreachable!() }
	/// ```
	#[inline(always)]
	pub fn error(self) -> Error
	{
		Error::new(self, None)
	}

	/// Creates a new [Error] from this error kind, with the passed error as the source.
	#[inline(always)]
	pub fn error_from<E: StdError + Send + Sync + 'static>(self, source: E) -> Error
	{
		Error::new(self, Some(Box::new(source)))
	}
}

impl From<ErrorKind> for Error
{
	fn from(other: ErrorKind) -> Self
	{
		other.error()
	}
}

impl Display for ErrorKind
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		use ErrorKind::*;
		match self {
			Memory => write!(f, "allocation failed")?,
			Param(why) => write!(f, "invalid parameter: {}", why)?,
			Range(why) => write!(f, "value out of range: {}", why)?,
			Mode(cap) => write!(f, "capability '{}' is not currently available on this board", cap)?,
			NotFound(what) => write!(f, "not found: {}", what)?,
			Io(None) => write!(f, "I/O error")?,
			Io(Some(path)) => write!(f, "I/O error accessing {}", path)?,
			Access => write!(f, "access denied")?,
			Busy => write!(f, "device or pool busy")?,
			Firmware(why) => write!(f, "firmware rejected: {}", why)?,
			External(source) => {
				use ErrorSource::*;
				match source {
					StdIo(e) => write!(f, "unhandled std::io::Error: {}", e)?,
					Usb(e) => write!(f, "unhandled USB error: {}", e)?,
					Dfu(e) => write!(f, "unhandled DFU error: {}", e)?,
					Goblin(e) => write!(f, "unhandled ELF parsing error: {}", e)?,
				};
			},
			Other(why) => write!(f, "{}", why)?,
		};

		Ok(())
	}
}

#[derive(Debug)]
/// Error type for fleet manager operations. Easily constructed from [ErrorKind].
pub struct Error
{
	pub kind: ErrorKind,
	pub source: Option<BoxedError>,

	/// A string for additional context about what was being attempted when this error occurred.
	///
	/// Example: "uploading firmware".
	pub context: Option<String>,
}

impl Error
{
	#[inline(always)]
	pub fn new(kind: ErrorKind, source: Option<BoxedError>) -> Self
	{
		Self { kind, source, context: None }
	}

	/// Add additional context about what was being attempted when this error occurred.
	pub fn with_ctx(mut self, ctx: &str) -> Self
	{
		self.context = Some(ctx.to_string());
		self
	}
}

impl Display for Error
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		if let Some(ctx) = &self.context {
			write!(f, "(while {}): {}", ctx, self.kind)?;
		} else {
			write!(f, "{}", self.kind)?;
		}

		if let Some(source) = &self.source {
			write!(f, "\nCaused by: {}", source)?;
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

impl From<nusb::Error> for Error
{
	fn from(other: nusb::Error) -> Self
	{
		use std::io::ErrorKind as IoKind;
		match other.kind() {
			IoKind::NotFound => ErrorKind::NotFound(String::from("USB device")).error_from(other),
			IoKind::PermissionDenied => ErrorKind::Access.error_from(other),
			_ => ErrorKind::External(ErrorSource::Usb(other.to_string())).error(),
		}
	}
}

impl From<dfu_core::Error> for Error
{
	fn from(other: dfu_core::Error) -> Self
	{
		ErrorKind::External(ErrorSource::Dfu(other.to_string())).error()
	}
}

impl From<goblin::error::Error> for Error
{
	fn from(other: goblin::error::Error) -> Self
	{
		ErrorKind::Firmware(String::from("malformed ELF image")).error_from(ErrorSource::Goblin(other))
	}
}

impl From<std::io::Error> for Error
{
	fn from(other: std::io::Error) -> Self
	{
		ErrorKind::Io(None).error_from(other)
	}
}

/// Sources of external error in this library.
#[derive(Debug, Error)]
pub enum ErrorSource
{
	#[error(transparent)]
	StdIo(#[from] std::io::Error),

	/// nusb reports its errors as plain [`std::io::Error`]; we stash the formatted message
	/// rather than the original so this variant stays `Send + Sync + 'static` independent of
	/// the `nusb` version.
	#[error("{0}")]
	Usb(String),

	#[error("{0}")]
	Dfu(String),

	#[error(transparent)]
	Goblin(#[from] goblin::error::Error),
}

/// Extension trait to enable getting the error kind from a Result<T, Error> with one method.
pub trait ResErrorKind<T>
{
	type Kind;
	fn err_kind(&self) -> Result<&T, &Self::Kind>;
}

impl<T> ResErrorKind<T> for Result<T, Error>
{
	type Kind = ErrorKind;

	fn err_kind(&self) -> Result<&T, &Self::Kind>
	{
		self.as_ref().map_err(|e| &e.kind)
	}
}

#[macro_export]
macro_rules! log_and_return
{
	($err:expr) => {
		let err = $err;
		log::error!("{}", err);
		return Err(err);
	}
}
