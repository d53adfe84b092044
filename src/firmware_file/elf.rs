// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
// SPDX-FileContributor: Written by Rachel Mant <git@dragonmux.network>

use std::fs::File;
use std::io::Read;

use goblin::elf::Elf;
use goblin::elf::section_header::SHT_NOBITS;
use log::debug;

use super::FirmwareStorage;
use crate::error::{Error, ErrorKind};

/// Sections copied verbatim into the flattened image, in the order a Cortex-M/AVR linker script
/// for this board family typically places them: code, the ARM unwind table (present even in
/// firmware built without C++ exceptions, since the vendor SDKs emit it unconditionally), then
/// initialized data.
const LOADABLE_SECTIONS: &[&str] = &[".text", ".ARM.exidx", ".data"];

pub struct ELFFirmwareFile
{
	load_address: Option<u32>,
	image: Box<[u8]>,
}

impl TryFrom<File> for ELFFirmwareFile
{
	type Error = Error;

	fn try_from(mut file: File) -> Result<Self, Error>
	{
		debug!("Loading file as ELF firmware binary");

		let mut bytes = Vec::new();
		file.read_to_end(&mut bytes).map_err(|e| ErrorKind::Io(None).error_from(e))?;

		let elf = Elf::parse(&bytes).map_err(|e| ErrorKind::Firmware(format!("invalid ELF file: {e}")).error())?;

		let mut regions: Vec<(u32, &[u8])> = Vec::new();

		for section in &elf.section_headers {
			let name = elf.shdr_strtab.get_at(section.sh_name).unwrap_or("");
			if !LOADABLE_SECTIONS.contains(&name) {
				continue;
			}
			if section.sh_type == SHT_NOBITS as u32 || section.sh_addr == 0 || section.sh_size == 0 {
				continue;
			}

			let start = section.sh_offset as usize;
			let end = start
				.checked_add(section.sh_size as usize)
				.ok_or_else(|| ErrorKind::Firmware(format!("section {name} has an overflowing size")).error())?;
			if end > bytes.len() {
				return Err(ErrorKind::Firmware(format!("section {name} extends past end of file")).error());
			}

			debug!("keeping section {name} at 0x{:08x}, {} bytes", section.sh_addr, section.sh_size);
			regions.push((section.sh_addr as u32, &bytes[start..end]));
		}

		if regions.is_empty() {
			return Err(ErrorKind::Firmware(String::from("ELF file has no loadable .text/.data sections")).error());
		}

		regions.sort_by_key(|(addr, _)| *addr);
		let load_address = regions[0].0;

		let total_length = regions
			.iter()
			.map(|(addr, data)| (*addr - load_address) as usize + data.len())
			.max()
			.unwrap_or(0);

		let mut image = vec![0xffu8; total_length].into_boxed_slice();
		for (addr, data) in &regions {
			let begin = (*addr - load_address) as usize;
			image[begin..begin + data.len()].copy_from_slice(data);
		}

		Ok(Self { load_address: Some(load_address), image })
	}
}

impl FirmwareStorage for ELFFirmwareFile
{
	fn load_address(&self) -> Option<u32>
	{
		self.load_address
	}

	fn firmware_data(&self) -> &[u8]
	{
		&self.image
	}
}

#[cfg(test)]
mod tests
{
	use std::io::{Seek, Write};

	use tempfile::tempfile;

	use super::*;

	#[test]
	fn rejects_non_elf_input()
	{
		let mut file = tempfile().expect("tempfile");
		file.write_all(b"not an elf file at all").expect("write");
		file.rewind().expect("rewind");
		assert!(ELFFirmwareFile::try_from(file).is_err());
	}
}
