// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
// SPDX-FileContributor: Written by Rachel Mant <git@dragonmux.network>
//! Firmware image loading: sniffs a file's format (ELF, Intel HEX, or raw binary) and flattens
//! it into one contiguous image ready to hand to a [crate::interface::CapabilityOps::upload].

use std::fs::{self, File};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::debug;

use crate::error::{Error, ErrorKind};

mod elf;
mod ihex;
mod raw;

use self::elf::ELFFirmwareFile;
use self::ihex::IntelHexFirmwareFile;
use self::raw::RawFirmwareFile;

trait FirmwareStorage
{
	fn load_address(&self) -> Option<u32>;
	fn firmware_data(&self) -> &[u8];
}

struct FirmwareFile
{
	inner: Box<dyn FirmwareStorage>,
}

impl FirmwareFile
{
	/// Sniffs `file_name`'s format from its first few bytes and parses it accordingly.
	fn from_path(file_name: &Path) -> Result<Self, Error>
	{
		let mut file = File::open(file_name).map_err(|e| ErrorKind::Io(Some(file_name.display().to_string())).error_from(e))?;

		let mut signature = [0u8; 4];
		let _ = file.read(&mut signature).map_err(|e| ErrorKind::Io(Some(file_name.display().to_string())).error_from(e))?;
		file.rewind().map_err(|e| ErrorKind::Io(Some(file_name.display().to_string())).error_from(e))?;

		let storage: Box<dyn FirmwareStorage> = if &signature == b"\x7fELF" {
			Box::new(ELFFirmwareFile::try_from(file)?)
		} else if &signature[0..1] == b":" {
			Box::new(IntelHexFirmwareFile::try_from(file)?)
		} else {
			Box::new(RawFirmwareFile::try_from(file)?)
		};

		Ok(Self { inner: storage })
	}

	fn load_address(&self) -> Option<u32>
	{
		self.inner.load_address()
	}

	fn firmware_data(&self) -> &[u8]
	{
		self.inner.firmware_data()
	}
}

/// A loaded firmware image, tracking the source file's modification time so the upload driver
/// can detect and pick up an in-place rebuild between the initial load and the point it actually
/// writes to the board.
pub struct Firmware
{
	path: PathBuf,
	mtime: SystemTime,
	file: FirmwareFile,
}

impl Firmware
{
	pub fn load(path: impl AsRef<Path>) -> Result<Self, Error>
	{
		let path = path.as_ref().to_path_buf();
		let mtime = file_mtime(&path)?;
		let file = FirmwareFile::from_path(&path)?;
		Ok(Self { path, mtime, file })
	}

	/// Re-reads the file if its modification time has advanced since the last load. Returns
	/// whether a reload happened.
	pub fn reload_if_changed(&mut self) -> Result<bool, Error>
	{
		let mtime = file_mtime(&self.path)?;
		if mtime <= self.mtime {
			return Ok(false);
		}

		debug!("firmware file {} changed on disk, reloading", self.path.display());
		self.file = FirmwareFile::from_path(&self.path)?;
		self.mtime = mtime;
		Ok(true)
	}

	pub fn load_address(&self) -> Option<u32>
	{
		self.file.load_address()
	}

	/// The flattened firmware image, ready to write to flash starting at [Firmware::load_address]
	/// (or at whatever base address the target capability driver assumes, for formats that carry
	/// no address of their own).
	pub fn image(&self) -> &[u8]
	{
		self.file.firmware_data()
	}

	pub fn size(&self) -> usize
	{
		self.image().len()
	}
}

fn file_mtime(path: &Path) -> Result<SystemTime, Error>
{
	fs::metadata(path)
		.and_then(|meta| meta.modified())
		.map_err(|e| ErrorKind::Io(Some(path.display().to_string())).error_from(e))
}
