// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! The board aggregate: one or more USB interfaces of the same physical device, and the
//! capability-to-interface routing array built from them.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::debug;

use crate::capability::{Capabilities, Capability};
use crate::error::{Error, ErrorKind};
use crate::interface::{Interface, ProgressFn};
use crate::model::Model;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BoardState
{
	Online,
	Missing,
	Dropped,
}

struct BoardInner
{
	serial: u64,
	vid: u16,
	pid: u16,
	model: Option<&'static Model>,
	state: BoardState,
	interfaces: Vec<Arc<Interface>>,
	cap2iface: [Option<Arc<Interface>>; 4],
	missing_since: Option<Instant>,
	user_data: Option<Box<dyn std::any::Any + Send>>,
}

/// Aggregate of interfaces sharing a USB topological location.
///
/// The reference design protects all of this with one recursive mutex, because capability
/// façades call into vtables that can call back into board accessors. Here instead the
/// interface list/routing table lives behind a plain (non-recursive) [Mutex], and every façade
/// clones the `Arc<Interface>` it needs out from under that lock *before* calling into the
/// vtable — so no lock is ever held across a vtable call, and nothing can deadlock by
/// re-entering. `capabilities` is additionally mirrored into a lock-free [AtomicU8] so
/// [Board::has_capability] doesn't need to take the lock at all, matching the spec's
/// lock-free-read requirement for that check.
pub struct Board
{
	pub location: String,
	pub identity: String,
	capabilities: AtomicU8,
	inner: Mutex<BoardInner>,
}

impl Board
{
	pub fn new(location: String, vid: u16, pid: u16) -> Arc<Self>
	{
		Arc::new(Self {
			location: location.clone(),
			identity: location,
			capabilities: AtomicU8::new(0),
			inner: Mutex::new(BoardInner {
				serial: 0,
				vid,
				pid,
				model: None,
				state: BoardState::Missing,
				interfaces: Vec::new(),
				cap2iface: [None, None, None, None],
				missing_since: None,
				user_data: None,
			}),
		})
	}

	fn with_identity(location: String, serial: u64, vid: u16, pid: u16) -> Arc<Self>
	{
		let identity = identity_string(&location, serial);
		Arc::new(Self {
			location,
			identity,
			capabilities: AtomicU8::new(0),
			inner: Mutex::new(BoardInner {
				serial,
				vid,
				pid,
				model: None,
				state: BoardState::Missing,
				interfaces: Vec::new(),
				cap2iface: [None, None, None, None],
				missing_since: None,
				user_data: None,
			}),
		})
	}

	/// Constructs a new board from the first interface discovered at a location.
	pub fn from_interface(location: String, iface: Arc<Interface>) -> Arc<Self>
	{
		let board = Self::with_identity(location, iface.serial, iface.vid, iface.pid);
		board.link(iface);
		board
	}

	pub fn serial(&self) -> u64
	{
		self.inner.lock().unwrap().serial
	}

	pub fn vid(&self) -> u16
	{
		self.inner.lock().unwrap().vid
	}

	pub fn pid(&self) -> u16
	{
		self.inner.lock().unwrap().pid
	}

	pub fn model(&self) -> Option<&'static Model>
	{
		self.inner.lock().unwrap().model
	}

	pub fn state(&self) -> BoardState
	{
		self.inner.lock().unwrap().state
	}

	pub fn missing_since(&self) -> Option<Instant>
	{
		self.inner.lock().unwrap().missing_since
	}

	pub fn interface_count(&self) -> usize
	{
		self.inner.lock().unwrap().interfaces.len()
	}

	/// Runs `f` with a mutable view of the board's user-data slot, under the metadata lock.
	pub fn with_user_data<R>(&self, f: impl FnOnce(Option<&mut (dyn std::any::Any + Send)>) -> R) -> R
	{
		let mut inner = self.inner.lock().unwrap();
		f(inner.user_data.as_deref_mut())
	}

	pub fn set_user_data(&self, data: Box<dyn std::any::Any + Send>)
	{
		self.inner.lock().unwrap().user_data = Some(data);
	}

	/// Lock-free read of the current capability union.
	pub fn has_capability(&self, cap: Capability) -> bool
	{
		(self.capabilities.load(Ordering::Acquire) & (1u8 << cap as usize)) != 0
	}

	pub fn capabilities(&self) -> Capabilities
	{
		Capabilities::from(self.capabilities.load(Ordering::Acquire))
	}

	/// Returns the interface currently routed for `cap`, if any.
	pub fn get_interface(&self, cap: Capability) -> Option<Arc<Interface>>
	{
		self.inner.lock().unwrap().cap2iface[cap as usize].clone()
	}

	/// Iterates interfaces under the lock; stops early (returning that value) on a non-zero
	/// visitor return.
	pub fn list_interfaces<F>(&self, mut visitor: F) -> i32
	where
		F: FnMut(&Interface) -> i32,
	{
		let inner = self.inner.lock().unwrap();
		for iface in &inner.interfaces {
			let rc = visitor(iface);
			if rc != 0 {
				return rc;
			}
		}
		0
	}

	/// Parses `spec` as `[location][#serial]`; empty matches any board, a non-empty location
	/// requires exact equality, and a nonzero serial requires numeric equality. A malformed
	/// serial number fails with [ErrorKind::Param].
	pub fn matches_identity(&self, spec: &str) -> Result<bool, Error>
	{
		if spec.is_empty() {
			return Ok(true);
		}

		let (location_part, serial_part) = match spec.split_once('#') {
			Some((location, serial)) => (location, Some(serial)),
			None => (spec, None),
		};

		if !location_part.is_empty() && location_part != self.location {
			return Ok(false);
		}

		if let Some(serial_str) = serial_part {
			if !serial_str.is_empty() {
				let serial: u64 = serial_str
					.parse()
					.map_err(|_| ErrorKind::Param(format!("malformed serial number '{}'", serial_str)).error())?;
				if serial != 0 && serial != self.serial() {
					return Ok(false);
				}
			}
		}

		Ok(true)
	}

	/// Links a new interface into this board and recomputes routing. Called with the board
	/// already resolved by the manager's event state machine.
	pub fn link(&self, iface: Arc<Interface>)
	{
		let mut inner = self.inner.lock().unwrap();

		if iface.model.is_some() {
			inner.model = iface.model;
		}
		if iface.serial != 0 {
			inner.serial = iface.serial;
		}
		inner.vid = iface.vid;
		inner.pid = iface.pid;

		inner.interfaces.push(iface);
		inner.state = BoardState::Online;
		inner.missing_since = None;
		self.recompute(&mut inner);
	}

	/// Detaches the interface with the given device id. Returns `true` if no interfaces remain.
	pub fn unlink(&self, device_id: crate::monitor::DeviceId) -> bool
	{
		let mut inner = self.inner.lock().unwrap();
		inner.interfaces.retain(|iface| iface.device_id != device_id);
		self.recompute(&mut inner);
		inner.interfaces.is_empty()
	}

	/// Closes (drops) every interface, clearing capabilities but retaining identity — used on a
	/// VID/PID-change-at-same-location transition.
	pub fn close_all(&self)
	{
		let mut inner = self.inner.lock().unwrap();
		inner.interfaces.clear();
		self.recompute(&mut inner);
		inner.state = BoardState::Missing;
	}

	pub fn mark_missing(&self, now: Instant)
	{
		let mut inner = self.inner.lock().unwrap();
		inner.state = BoardState::Missing;
		inner.missing_since = Some(now);
	}

	pub fn mark_dropped(&self)
	{
		self.inner.lock().unwrap().state = BoardState::Dropped;
	}

	pub fn set_vid_pid(&self, vid: u16, pid: u16)
	{
		let mut inner = self.inner.lock().unwrap();
		inner.vid = vid;
		inner.pid = pid;
	}

	/// True if `other` is a valid-and-different model, or a nonzero-and-different serial,
	/// relative to this board — the condition that triggers a board *replacement* rather than a
	/// plain change, per the model-reassignment rule.
	pub fn conflicts_with(&self, other_model: Option<&'static Model>, other_serial: u64) -> bool
	{
		let inner = self.inner.lock().unwrap();
		let model_conflict = matches!((inner.model, other_model), (Some(a), Some(b)) if a.name != b.name);
		let serial_conflict = inner.serial != 0 && other_serial != 0 && inner.serial != other_serial;
		model_conflict || serial_conflict
	}

	fn recompute(&self, inner: &mut BoardInner)
	{
		inner.cap2iface = [None, None, None, None];
		let mut caps = Capabilities::none();

		for iface in &inner.interfaces {
			caps |= iface.capabilities;
			for cap in Capability::ALL {
				if iface.has_capability(cap) && inner.cap2iface[cap as usize].is_none() {
					inner.cap2iface[cap as usize] = Some(iface.clone());
				}
			}
		}

		self.capabilities.store(caps.bits(), Ordering::Release);
		debug!("board {} now exposes {:?}", self.identity, caps);
	}

	fn upload_interface(&self) -> Result<Arc<Interface>, Error>
	{
		self.get_interface(Capability::Upload).ok_or_else(|| ErrorKind::Mode(Capability::Upload).error())
	}

	pub fn upload(&self, image: &[u8], progress: &mut ProgressFn) -> Result<(), Error>
	{
		self.upload_interface()?.ops().upload(image, progress)
	}

	pub fn reset(&self) -> Result<(), Error>
	{
		self.get_interface(Capability::Reset).ok_or_else(|| ErrorKind::Mode(Capability::Reset).error())?.ops().reset()
	}

	pub fn reboot(&self) -> Result<(), Error>
	{
		self.get_interface(Capability::Reboot).ok_or_else(|| ErrorKind::Mode(Capability::Reboot).error())?.ops().reboot()
	}

	pub fn serial_read(&self, buf: &mut [u8], timeout: std::time::Duration) -> Result<usize, Error>
	{
		self.get_interface(Capability::Serial)
			.ok_or_else(|| ErrorKind::Mode(Capability::Serial).error())?
			.ops()
			.serial_read(buf, timeout)
	}

	pub fn serial_write(&self, buf: &[u8]) -> Result<usize, Error>
	{
		self.get_interface(Capability::Serial).ok_or_else(|| ErrorKind::Mode(Capability::Serial).error())?.ops().serial_write(buf)
	}

	pub fn serial_set_attributes(&self, baud: u32) -> Result<(), Error>
	{
		self.get_interface(Capability::Serial)
			.ok_or_else(|| ErrorKind::Mode(Capability::Serial).error())?
			.ops()
			.serial_set_attributes(baud)
	}
}

impl Display for Board
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		let inner = self.inner.lock().unwrap();
		match inner.model {
			Some(model) => write!(f, "{} [{}] ({:?})", model, self.identity, inner.state),
			None => write!(f, "unknown board [{}] ({:?})", self.identity, inner.state),
		}
	}
}

fn identity_string(location: &str, serial: u64) -> String
{
	if serial == 0 {
		location.to_string()
	} else {
		format!("{}#{}", location, serial)
	}
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn identity_omits_zero_serial()
	{
		assert_eq!(identity_string("1-2.3", 0), "1-2.3");
		assert_eq!(identity_string("1-2.3", 42), "1-2.3#42");
	}

	#[test]
	fn matches_identity_empty_matches_any()
	{
		let board = Board::with_identity(String::from("1-2.3"), 42, 0x16C0, 0x0478);
		assert!(board.matches_identity("").unwrap());
	}

	#[test]
	fn matches_identity_location_and_serial()
	{
		let board = Board::with_identity(String::from("1-2.3"), 42, 0x16C0, 0x0478);
		assert!(board.matches_identity("1-2.3").unwrap());
		assert!(board.matches_identity("1-2.3#42").unwrap());
		assert!(board.matches_identity("#42").unwrap());
		assert!(!board.matches_identity("1-2.4").unwrap());
		assert!(!board.matches_identity("1-2.3#1").unwrap());
	}

	#[test]
	fn matches_identity_rejects_malformed_serial()
	{
		let board = Board::with_identity(String::from("1-2.3"), 42, 0x16C0, 0x0478);
		assert!(board.matches_identity("1-2.3#not-a-number").is_err());
	}

	#[test]
	fn conflicts_with_detects_model_and_serial_mismatch()
	{
		let board = Board::with_identity(String::from("1-2.3"), 42, 0x16C0, 0x0478);
		assert!(!board.conflicts_with(None, 0));
		assert!(!board.conflicts_with(None, 42));
		assert!(board.conflicts_with(None, 99));
	}
}
