// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! The capability-routing primitives shared by [`crate::interface`] and [`crate::board`].

use std::fmt::{self, Display, Formatter};

use bitmask_enum::bitmask;

/// One of the operations an [`crate::interface::Interface`] may expose.
///
/// Also used as an index: `cap2iface[Capability::Upload as usize]` etc, which is why the
/// discriminants are dense and start at zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(usize)]
pub enum Capability
{
	Upload = 0,
	Reset = 1,
	Reboot = 2,
	Serial = 3,
}

impl Capability
{
	/// All capabilities, in routing-array order.
	pub const ALL: [Self; 4] = [Self::Upload, Self::Reset, Self::Reboot, Self::Serial];

	/// The single-bit [Capabilities] mask this capability corresponds to.
	pub fn mask(self) -> Capabilities
	{
		match self {
			Self::Upload => Capabilities::Upload,
			Self::Reset => Capabilities::Reset,
			Self::Reboot => Capabilities::Reboot,
			Self::Serial => Capabilities::Serial,
		}
	}
}

impl Display for Capability
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		match self {
			Self::Upload => write!(f, "upload"),
			Self::Reset => write!(f, "reset"),
			Self::Reboot => write!(f, "reboot"),
			Self::Serial => write!(f, "serial"),
		}
	}
}

/// A bitset over [Capability]: the union of whatever an [`crate::interface::Interface`] or
/// [`crate::board::Board`] currently exposes.
#[bitmask(u8)]
pub enum Capabilities
{
	Upload,
	Reset,
	Reboot,
	Serial,
}

impl Capabilities
{
	pub fn has(&self, cap: Capability) -> bool
	{
		self.contains(cap.mask())
	}
}

impl Default for Capabilities
{
	fn default() -> Self
	{
		Self::none()
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn union_and_membership()
	{
		let caps = Capabilities::Reset | Capabilities::Reboot;
		assert!(caps.has(Capability::Reset));
		assert!(caps.has(Capability::Reboot));
		assert!(!caps.has(Capability::Upload));
		assert!(!caps.has(Capability::Serial));
	}

	#[test]
	fn none_has_nothing()
	{
		let caps = Capabilities::none();
		for cap in Capability::ALL {
			assert!(!caps.has(cap));
		}
	}
}
