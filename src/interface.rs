// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2022-2025 1BitSquared <info@1bitsquared.com>
// SPDX-FileContributor: Written by Mikaela Szekely <mikaela.szekely@qyriad.me>
//! Wraps one opened USB interface of a board and exposes its capability vtable.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use log::{debug, warn};

use crate::capability::{Capabilities, Capability};
use crate::error::{Error, ErrorKind};
use crate::model::Model;
use crate::monitor::{DeviceId, RawDevice};

/// Progress callback for [CapabilityOps::upload]: called with the number of bytes just written.
pub type ProgressFn<'p> = dyn FnMut(u64) + 'p;

/// The operations a vendor driver must provide for whichever capabilities it claims.
///
/// None of these are required to be thread-safe across interfaces, but each must tolerate being
/// called while the owning board's lock is held, since the capability façades on [crate::board::Board]
/// acquire that lock before delegating here.
pub trait CapabilityOps: Send + Sync
{
	fn upload(&self, _image: &[u8], _progress: &mut ProgressFn) -> Result<(), Error>
	{
		Err(ErrorKind::Mode(Capability::Upload).error())
	}

	fn reset(&self) -> Result<(), Error>
	{
		Err(ErrorKind::Mode(Capability::Reset).error())
	}

	fn reboot(&self) -> Result<(), Error>
	{
		Err(ErrorKind::Mode(Capability::Reboot).error())
	}

	fn serial_read(&self, _buf: &mut [u8], _timeout: Duration) -> Result<usize, Error>
	{
		Err(ErrorKind::Mode(Capability::Serial).error())
	}

	fn serial_write(&self, _buf: &[u8]) -> Result<usize, Error>
	{
		Err(ErrorKind::Mode(Capability::Serial).error())
	}

	fn serial_set_attributes(&self, _baud: u32) -> Result<(), Error>
	{
		Err(ErrorKind::Mode(Capability::Serial).error())
	}
}

/// One opened USB interface (HID, serial, or DFU bootloader endpoint) of a board.
pub struct Interface
{
	pub device_id: DeviceId,
	pub location: String,
	pub vid: u16,
	pub pid: u16,
	/// Inferred model; `None` if unrecognized.
	pub model: Option<&'static Model>,
	/// Decimal serial number parsed from the USB string descriptor; `0` if unreadable.
	pub serial: u64,
	pub capabilities: Capabilities,
	ops: Box<dyn CapabilityOps>,
}

impl Interface
{
	pub fn new(
		device_id: DeviceId,
		location: String,
		vid: u16,
		pid: u16,
		model: Option<&'static Model>,
		serial: u64,
		capabilities: Capabilities,
		ops: Box<dyn CapabilityOps>,
	) -> Self
	{
		Self { device_id, location, vid, pid, model, serial, capabilities, ops }
	}

	pub fn has_capability(&self, cap: Capability) -> bool
	{
		self.capabilities.has(cap)
	}

	pub fn ops(&self) -> &dyn CapabilityOps
	{
		self.ops.as_ref()
	}
}

impl Display for Interface
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		match self.model {
			Some(model) => write!(f, "{} at {}", model, self.location),
			None => write!(f, "unknown device ({:04x}:{:04x}) at {}", self.vid, self.pid, self.location),
		}
	}
}

/// What a vendor driver reports after being offered a raw device.
pub enum DriverOutcome
{
	/// This driver recognizes the device and has opened it.
	Opened(Interface),
	/// This device isn't one this driver knows how to talk to; try the next one.
	NotFound,
}

/// A vendor driver recognizes a particular device family and knows how to open it into an
/// [Interface] exposing the right capability vtable. `open_interface` below tries each
/// registered driver in turn.
pub trait VendorDriver: Send + Sync
{
	fn try_open(&self, device: &RawDevice) -> Result<DriverOutcome, Error>;
}

/// Attempts to open `device` against every registered vendor driver in order.
///
/// Each driver may return [DriverOutcome::Opened] (claims it, handle now open), [DriverOutcome::NotFound]
/// (soft failure, try the next driver), or a hard [Error]. `NotFound` from every driver means
/// the device is not a managed board and should be silently ignored by the caller.
pub fn open_interface(device: &RawDevice, drivers: &[Box<dyn VendorDriver>]) -> Result<Option<Interface>, Error>
{
	for driver in drivers {
		match driver.try_open(device) {
			Ok(DriverOutcome::Opened(iface)) => {
				debug!("opened {} via vendor driver", iface);
				return Ok(Some(iface));
			},
			Ok(DriverOutcome::NotFound) => continue,
			Err(e) => return Err(e),
		}
	}

	Ok(None)
}

/// A DFU-class driver: claims devices in DFU mode and exposes the `upload` capability via
/// `dfu-core`/`dfu-nusb`, the same stack the reference tool uses to flash its own probes.
pub mod dfu
{
	use std::io::Cursor;

	use dfu_nusb::DfuNusb;

	use super::*;
	use crate::model;

	pub struct DfuVendorDriver
	{
		pub vid: u16,
		pub pid: u16,
		pub interface_number: u8,
	}

	impl VendorDriver for DfuVendorDriver
	{
		fn try_open(&self, device: &RawDevice) -> Result<DriverOutcome, Error>
		{
			if device.vid != self.vid || device.pid != self.pid {
				return Ok(DriverOutcome::NotFound);
			}

			let serial = device
				.serial_number
				.as_deref()
				.and_then(|s| s.parse::<u64>().ok())
				.unwrap_or(0);

			let ops = DfuOps { vid: device.vid, pid: device.pid, interface_number: self.interface_number };

			Ok(DriverOutcome::Opened(Interface::new(
				device.id,
				device.location.clone(),
				device.vid,
				device.pid,
				None,
				serial,
				Capabilities::Upload,
				Box::new(ops),
			)))
		}
	}

	struct DfuOps
	{
		vid: u16,
		pid: u16,
		interface_number: u8,
	}

	impl CapabilityOps for DfuOps
	{
		fn upload(&self, image: &[u8], progress: &mut ProgressFn) -> Result<(), Error>
		{
			let nusb_device = nusb::list_devices()?
				.find(|d| d.vendor_id() == self.vid && d.product_id() == self.pid)
				.ok_or_else(|| ErrorKind::NotFound(String::from("DFU device vanished before upload")).error())?
				.open()?;

			let mut dfu_dev = DfuNusb::open(nusb_device, self.interface_number, 0)?;

			let mut written = 0u64;
			dfu_dev.with_progress(move |chunk: usize| {
				written += chunk as u64;
				progress(written);
			});

			let mut reader = Cursor::new(image);
			dfu_dev.download(&mut reader, image.len() as u32)?;

			Ok(())
		}

		fn reboot(&self) -> Result<(), Error>
		{
			// DFU devices self-reboot once the final download block is acknowledged; nothing
			// further to request here.
			Ok(())
		}
	}

	/// Cross-checks a firmware image's detected model (if any) against the board's detected
	/// model, per the upload driver's step 5.
	pub fn cross_check(detected_board_model: Option<&model::Model>, image: &[u8], nocheck: bool) -> Result<(), Error>
	{
		match model::test_firmware(image) {
			Some(firmware_model) => {
				if let Some(board_model) = detected_board_model {
					if firmware_model.name != board_model.name {
						return Err(ErrorKind::Firmware(format!(
							"firmware appears to be for {} but board is {}",
							firmware_model, board_model
						))
						.error());
					}
				}
			},
			None if !nocheck => {
				return Err(ErrorKind::Firmware(String::from(
					"firmware does not match any known model signature (pass --nocheck to override)",
				))
				.error());
			},
			None => warn!("firmware does not match any known model signature; proceeding because --nocheck was given"),
		}

		Ok(())
	}

	impl std::fmt::Debug for DfuOps
	{
		fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result
		{
			write!(f, "DfuOps({:04x}:{:04x} if{})", self.vid, self.pid, self.interface_number)
		}
	}
}

/// A serial-port driver: claims devices in runtime/application mode that enumerate a CDC-ACM
/// tty, and exposes `serial`, `reset`, and `reboot` (via a 134-baud touch, the same trick
/// Teensy/Arduino bootloaders use to request a reboot into DFU mode over the same port the
/// application uses for its own serial traffic).
///
/// Built on `termios`, which per `Cargo.toml` is only pulled in on Linux/Android/macOS; this
/// module is gated the same way.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
pub mod serial
{
	use std::fs::OpenOptions;
	use std::io::{Read, Write};
	use std::os::unix::io::AsRawFd;

	use super::*;

	pub struct SerialVendorDriver
	{
		pub vid: u16,
		pub pid: u16,
	}

	impl VendorDriver for SerialVendorDriver
	{
		fn try_open(&self, device: &RawDevice) -> Result<DriverOutcome, Error>
		{
			if device.vid != self.vid || device.pid != self.pid {
				return Ok(DriverOutcome::NotFound);
			}

			let path = device
				.path
				.clone()
				.ok_or_else(|| ErrorKind::NotFound(String::from("no tty path for serial device")).error())?;

			let serial = device
				.serial_number
				.as_deref()
				.and_then(|s| s.parse::<u64>().ok())
				.unwrap_or(0);

			let ops = SerialOps { path };

			Ok(DriverOutcome::Opened(Interface::new(
				device.id,
				device.location.clone(),
				device.vid,
				device.pid,
				None,
				serial,
				Capabilities::Reset | Capabilities::Reboot | Capabilities::Serial,
				Box::new(ops),
			)))
		}
	}

	struct SerialOps
	{
		path: String,
	}

	impl SerialOps
	{
		/// Touches the port at a magic baud rate to ask the device to reboot. `1200` requests a
		/// reboot into the bootloader; `134` (this crate's convention) requests an application
		/// reset without entering the bootloader.
		fn touch(&self, baud: u32) -> Result<(), Error>
		{
			let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
			let fd = file.as_raw_fd();

			let mut attrs = termios::Termios::from_fd(fd).map_err(|e| ErrorKind::Io(Some(self.path.clone())).error_from(e))?;
			termios::cfsetspeed(&mut attrs, baud as termios::os::target::speed_t)
				.map_err(|e| ErrorKind::Io(Some(self.path.clone())).error_from(e))?;
			termios::tcsetattr(fd, termios::TCSANOW, &attrs).map_err(|e| ErrorKind::Io(Some(self.path.clone())).error_from(e))?;

			// Dropping `file` here closes the port, which is what actually triggers the
			// microcontroller's bootloader ROM to notice the magic baud rate and reboot.
			drop(file);
			Ok(())
		}
	}

	impl CapabilityOps for SerialOps
	{
		fn reset(&self) -> Result<(), Error>
		{
			self.touch(134)
		}

		fn reboot(&self) -> Result<(), Error>
		{
			self.touch(1200)
		}

		fn serial_read(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize, Error>
		{
			let mut file = OpenOptions::new().read(true).open(&self.path)?;
			Ok(file.read(buf)?)
		}

		fn serial_write(&self, buf: &[u8]) -> Result<usize, Error>
		{
			let mut file = OpenOptions::new().write(true).open(&self.path)?;
			Ok(file.write(buf)?)
		}

		fn serial_set_attributes(&self, baud: u32) -> Result<(), Error>
		{
			let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
			let fd = file.as_raw_fd();

			let mut attrs = termios::Termios::from_fd(fd).map_err(|e| ErrorKind::Io(Some(self.path.clone())).error_from(e))?;
			termios::cfmakeraw(&mut attrs);
			termios::cfsetspeed(&mut attrs, baud as termios::os::target::speed_t)
				.map_err(|e| ErrorKind::Io(Some(self.path.clone())).error_from(e))?;
			termios::tcsetattr(fd, termios::TCSANOW, &attrs).map_err(|e| ErrorKind::Io(Some(self.path.clone())).error_from(e))
		}
	}
}
