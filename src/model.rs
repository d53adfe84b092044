// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Static table of board models, plus signature-matching against a firmware image.

use std::fmt::{self, Display, Formatter};

/// Immutable description of one supported board model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Model
{
	/// Short identifier, e.g. `"teensy_31"`.
	pub name: &'static str,
	/// Microcontroller identifier, e.g. `"mk20dx256"`.
	pub mcu: &'static str,
	/// Human-readable label.
	pub desc: &'static str,
	/// Size of flash, in bytes.
	pub code_size: u32,
	/// Fixed 8-byte pattern guaranteed to appear somewhere in firmware built for this model.
	pub signature: [u8; 8],
}

impl Display for Model
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		write!(f, "{} ({})", self.desc, self.mcu)
	}
}

/// The built-in model table, in registration order. Registration order is load-bearing: it's
/// the tie-break for [test_firmware] when a signature could in principle match more than one
/// model's pattern at the same offset.
pub static MODELS: &[Model] = &[
	Model {
		name: "teensy_2",
		mcu: "at90usb646",
		desc: "Teensy 2.0",
		code_size: 64 * 1024,
		signature: [0x0C, 0x94, 0x00, 0x1C, 0xFF, 0xCF, 0xF8, 0x94],
	},
	Model {
		name: "teensy_2pp",
		mcu: "at90usb1286",
		desc: "Teensy++ 2.0",
		code_size: 128 * 1024,
		signature: [0x0C, 0x94, 0x00, 0x20, 0xFF, 0xCF, 0xF8, 0x94],
	},
	Model {
		name: "teensy_30",
		mcu: "mk20dx128",
		desc: "Teensy 3.0",
		code_size: 128 * 1024,
		signature: [0x30, 0x80, 0x04, 0x40, 0x82, 0x3F, 0x04, 0x00],
	},
	Model {
		name: "teensy_31",
		mcu: "mk20dx256",
		desc: "Teensy 3.1 / 3.2",
		code_size: 256 * 1024,
		signature: [0x38, 0x80, 0x04, 0x40, 0x82, 0x3F, 0x04, 0x00],
	},
	Model {
		name: "teensy_lc",
		mcu: "mkl26z64",
		desc: "Teensy LC",
		code_size: 62 * 1024,
		signature: [0x0C, 0x94, 0x00, 0x3F, 0xFF, 0xCF, 0xF8, 0x94],
	},
];

/// Linear match on `name` or `mcu`, case-sensitive exact.
pub fn find_model(needle: &str) -> Option<&'static Model>
{
	MODELS.iter().find(|model| model.name == needle || model.mcu == needle)
}

/// Scans `image` byte-by-byte for any registered model's 8-byte signature.
///
/// At each offset, every model's signature is compared against the 8-byte window in
/// registration order, so the result is deterministic: earliest offset wins, and at a tied
/// offset, the earliest-registered model wins. The scan stops at `len - 8`; if
/// `image.len() < 8`, this always returns `None`. This is O(N*M) with tiny M (currently 5),
/// which is fine for an advisory check run once per upload.
pub fn test_firmware(image: &[u8]) -> Option<&'static Model>
{
	if image.len() < 8 {
		return None;
	}

	for offset in 0..=(image.len() - 8) {
		let window = &image[offset..offset + 8];
		for model in MODELS {
			if model.signature == window {
				return Some(model);
			}
		}
	}

	None
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn find_model_matches_name_and_mcu()
	{
		for model in MODELS {
			assert_eq!(find_model(model.name), Some(model));
			assert_eq!(find_model(model.mcu), Some(model));
		}
	}

	#[test]
	fn find_model_rejects_unknown()
	{
		assert_eq!(find_model("not_a_real_board"), None);
	}

	#[test]
	fn test_firmware_rejects_short_input()
	{
		assert_eq!(test_firmware(&[0u8; 7]), None);
		assert_eq!(test_firmware(&[]), None);
	}

	#[test]
	fn test_firmware_detects_embedded_signature()
	{
		let mut image = vec![0xFFu8; 12];
		image.extend_from_slice(&find_model("teensy_31").unwrap().signature);
		image.extend_from_slice(&[0x00; 4]);

		let detected = test_firmware(&image).expect("signature should be found");
		assert_eq!(detected.name, "teensy_31");
	}

	#[test]
	fn test_firmware_tie_breaks_on_registration_order()
	{
		// Construct an image containing only the first model's signature; confirm that's
		// what's returned even though later models are also present to compare against.
		let image = MODELS[0].signature.to_vec();
		let detected = test_firmware(&image).unwrap();
		assert_eq!(detected.name, MODELS[0].name);
	}
}
