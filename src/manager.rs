// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! The board manager: turns a stream of raw hotplug events into a stable set of [Board]s, and
//! lets callers wait for one to appear with a given capability.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::board::Board;
use crate::capability::Capability;
use crate::error::{Error, ErrorKind};
use crate::interface::{open_interface, VendorDriver};
use crate::monitor::{DeviceEvent, DeviceId, DeviceMonitor};

/// Default grace period a board is kept around as [crate::board::BoardState::Missing] before
/// being dropped for good, to ride out a bootloader reboot that briefly detaches and
/// re-enumerates the same physical board at the same location.
pub const DEFAULT_DROP_DELAY: Duration = Duration::from_millis(5_000);

/// What happened to a board, reported to registered callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardEvent
{
	/// A brand new board appeared at a location that had none (or replaced one that conflicted
	/// on model/serial).
	Added,
	/// An already-known board's interface set changed — it gained, lost (but not all of), or
	/// swapped interfaces at the same location, without losing its identity.
	Changed,
	/// A board's last interface disappeared; it is now [crate::board::BoardState::Missing] and
	/// the drop-delay timer has started.
	Missing,
	/// A board's drop-delay timer expired; it is now [crate::board::BoardState::Dropped] and has
	/// been removed from the manager.
	Dropped,
}

/// Returning `false` from a callback self-deregisters it; the manager will not call it again.
pub type Callback = Box<dyn FnMut(&Arc<Board>, BoardEvent) -> bool + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(u64);

struct Registration
{
	id: CallbackId,
	callback: Callback,
}

struct State
{
	/// Boards currently known, keyed by USB topological location.
	boards: HashMap<String, Arc<Board>>,
	/// Routes a live interface's device id back to the board location that owns it, so a bare
	/// `Removed(DeviceId)` event can find its board without re-enumerating.
	owners: HashMap<DeviceId, String>,
	callbacks: Vec<Registration>,
	next_callback_id: u64,
	/// Boards currently claimed by a non-parallel [BoardManager::wait_for] caller, so a second
	/// non-parallel waiter doesn't receive the same physical board.
	claimed: std::collections::HashSet<String>,
}

/// Owns the device monitor and vendor driver list, and maintains the live [Board] set.
pub struct BoardManager
{
	monitor: Mutex<Box<dyn DeviceMonitor>>,
	drivers: Vec<Box<dyn VendorDriver>>,
	drop_delay: Duration,
	state: Mutex<State>,
}

impl BoardManager
{
	pub fn new(monitor: Box<dyn DeviceMonitor>, drivers: Vec<Box<dyn VendorDriver>>) -> Self
	{
		Self::with_drop_delay(monitor, drivers, DEFAULT_DROP_DELAY)
	}

	pub fn with_drop_delay(monitor: Box<dyn DeviceMonitor>, drivers: Vec<Box<dyn VendorDriver>>, drop_delay: Duration) -> Self
	{
		Self {
			monitor: Mutex::new(monitor),
			drivers,
			drop_delay,
			state: Mutex::new(State {
				boards: HashMap::new(),
				owners: HashMap::new(),
				callbacks: Vec::new(),
				next_callback_id: 0,
				claimed: std::collections::HashSet::new(),
			}),
		}
	}

	/// Performs the initial enumeration, populating the board set from whatever is already
	/// plugged in. Call once at startup before relying on [BoardManager::refresh].
	pub fn enumerate(&self) -> Result<(), Error>
	{
		let devices = self.monitor.lock().unwrap().list()?;
		let mut state = self.state.lock().unwrap();
		for device in devices {
			match open_interface(&device, &self.drivers) {
				Ok(Some(iface)) => self.handle_added(&mut state, device.id, iface),
				Ok(None) => debug!("ignoring unmanaged device {}", device),
				Err(e) => warn!("failed to open {}: {}", device, e),
			}
		}
		Ok(())
	}

	/// Drains pending hotplug events and advances the drop-delay timer for any missing boards.
	/// Returns the number of boards currently known after processing.
	pub fn refresh(&self) -> usize
	{
		let events = self.monitor.lock().unwrap().poll();
		let mut state = self.state.lock().unwrap();

		for event in events {
			match event {
				DeviceEvent::Added(device) => match open_interface(&device, &self.drivers) {
					Ok(Some(iface)) => self.handle_added(&mut state, device.id, iface),
					Ok(None) => debug!("ignoring unmanaged device {}", device),
					Err(e) => warn!("failed to open {}: {}", device, e),
				},
				DeviceEvent::Removed(id) => self.handle_removed(&mut state, id),
			}
		}

		self.expire_missing(&mut state, Instant::now());
		state.boards.len()
	}

	fn handle_added(&self, state: &mut State, device_id: DeviceId, iface: crate::interface::Interface)
	{
		let iface = Arc::new(iface);
		let location = iface.location.clone();

		let replace = match state.boards.get(&location) {
			None => false,
			Some(existing) => existing.conflicts_with(iface.model, iface.serial),
		};

		if replace {
			if let Some(old) = state.boards.remove(&location) {
				old.mark_dropped();
				self.notify(state, &old, BoardEvent::Dropped);
			}
		}

		let vid_pid_changed = state
			.boards
			.get(&location)
			.map(|board| board.vid() != iface.vid || board.pid() != iface.pid)
			.unwrap_or(false);

		if vid_pid_changed {
			if let Some(board) = state.boards.get(&location).cloned() {
				board.close_all();
				board.set_vid_pid(iface.vid, iface.pid);
				info!("board {} disappeared (vid/pid changed)", board.identity);
				self.notify(state, &board, BoardEvent::Missing);
			}
		}

		let board_existed = state.boards.contains_key(&location);
		state.owners.insert(device_id, location.clone());

		match state.boards.get(&location) {
			Some(board) => {
				board.link(iface);
				let board = Arc::clone(board);
				if board_existed {
					info!("board {} gained an interface", board.identity);
					self.notify(state, &board, BoardEvent::Changed);
				} else {
					info!("board {} appeared", board.identity);
					self.notify(state, &board, BoardEvent::Added);
				}
			},
			None => {
				let board = Board::from_interface(location, iface);
				info!("board {} appeared", board.identity);
				state.boards.insert(board.location.clone(), Arc::clone(&board));
				self.notify(state, &board, BoardEvent::Added);
			},
		}
	}

	fn handle_removed(&self, state: &mut State, device_id: DeviceId)
	{
		let Some(location) = state.owners.remove(&device_id) else {
			return;
		};

		let Some(board) = state.boards.get(&location).cloned() else {
			return;
		};

		if board.unlink(device_id) {
			board.mark_missing(Instant::now());
			info!("board {} went missing", board.identity);
			self.notify(state, &board, BoardEvent::Missing);
		} else {
			info!("board {} lost an interface", board.identity);
			self.notify(state, &board, BoardEvent::Changed);
		}
	}

	fn expire_missing(&self, state: &mut State, now: Instant)
	{
		let expired: Vec<String> = state
			.boards
			.iter()
			.filter(|(_, board)| match board.missing_since() {
				Some(since) => now.duration_since(since) >= self.drop_delay,
				None => false,
			})
			.map(|(location, _)| location.clone())
			.collect();

		for location in expired {
			if let Some(board) = state.boards.remove(&location) {
				board.mark_dropped();
				state.claimed.remove(&location);
				info!("board {} dropped after {:?} missing", board.identity, self.drop_delay);
				self.notify(state, &board, BoardEvent::Dropped);
			}
		}
	}

	fn notify(&self, state: &mut State, board: &Arc<Board>, event: BoardEvent)
	{
		state.callbacks.retain_mut(|reg| (reg.callback)(board, event));
	}

	/// Registers a callback invoked synchronously (under the manager's lock) on every board
	/// event. The callback self-deregisters by returning `false`.
	pub fn register_callback(&self, callback: Callback) -> CallbackId
	{
		let mut state = self.state.lock().unwrap();
		let id = CallbackId(state.next_callback_id);
		state.next_callback_id += 1;
		state.callbacks.push(Registration { id, callback });
		id
	}

	pub fn deregister_callback(&self, id: CallbackId)
	{
		self.state.lock().unwrap().callbacks.retain(|reg| reg.id != id);
	}

	/// Snapshot of currently known boards, in no particular order.
	pub fn boards(&self) -> Vec<Arc<Board>>
	{
		self.state.lock().unwrap().boards.values().cloned().collect()
	}

	/// Finds the (single) board currently matching `spec`, per [Board::matches_identity].
	pub fn find(&self, spec: &str) -> Result<Option<Arc<Board>>, Error>
	{
		let state = self.state.lock().unwrap();
		for board in state.boards.values() {
			if board.matches_identity(spec)? {
				return Ok(Some(Arc::clone(board)));
			}
		}
		Ok(None)
	}

	/// The earliest point a poll loop needs to wake up on this manager's account alone, i.e. the
	/// next missing-board drop-delay expiry (`missing_since + drop_delay`, earliest across all
	/// currently-missing boards), if any board is currently missing.
	///
	/// This is this crate's equivalent of spec.md §4.4's drop-delay timer half of the device
	/// monitor's waitable descriptor set: a caller driving its own poll loop should additionally
	/// wake (and call [BoardManager::refresh]) no later than this instant, rather than relying
	/// solely on a fixed polling interval, so a board's `Missing → Dropped` transition fires
	/// promptly instead of up to one poll interval late. The device-monitor half of that
	/// descriptor set — waking on an actual hotplug event — has no equivalent here, since this
	/// manager doesn't expose a raw OS descriptor; callers still need their own hotplug-driven
	/// wake (or a short bound on the sleep) to stay responsive to plug/unplug events themselves.
	pub fn next_deadline(&self) -> Option<Instant>
	{
		let state = self.state.lock().unwrap();
		state
			.boards
			.values()
			.filter_map(|board| board.missing_since())
			.map(|since| since + self.drop_delay)
			.min()
	}

	/// Blocks until a board matching `spec` exists at all, regardless of capability, or
	/// `timeout` elapses. Used during board acquisition, before it's known whether the board
	/// needs a bootloader-transition reboot to expose the capability actually wanted.
	pub fn wait_for_board(&self, spec: &str, timeout: Duration) -> Result<Arc<Board>, Error>
	{
		let deadline = Instant::now() + timeout;

		loop {
			self.refresh();

			if let Some(board) = self.find(spec)? {
				return Ok(board);
			}

			if Instant::now() >= deadline {
				return Err(ErrorKind::NotFound(format!("no board matching '{}' within timeout", spec)).error());
			}

			std::thread::sleep(self.poll_interval());
		}
	}

	/// [crate::monitor::DEFAULT_POLL_INTERVAL], shortened to wake exactly at
	/// [BoardManager::next_deadline] when that's sooner, so a drop-delay expiry is picked up
	/// promptly instead of waiting out a full poll interval past it.
	fn poll_interval(&self) -> Duration
	{
		match self.next_deadline() {
			Some(deadline) => crate::monitor::DEFAULT_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())),
			None => crate::monitor::DEFAULT_POLL_INTERVAL,
		}
	}

	/// Blocks (polling [BoardManager::refresh], waking early for [BoardManager::next_deadline])
	/// until a board matching `spec` exposes `cap`, or `timeout` elapses.
	///
	/// When `parallel` is `false`, a board already claimed by an earlier non-parallel waiter is
	/// skipped, so concurrent callers each get a distinct board; the claim is released when the
	/// board is dropped. When `parallel` is `true`, any matching board is returned regardless of
	/// prior claims, and no claim is recorded.
	pub fn wait_for(&self, spec: &str, cap: Capability, parallel: bool, timeout: Duration) -> Result<Arc<Board>, Error>
	{
		let deadline = Instant::now() + timeout;

		loop {
			self.refresh();

			{
				let mut state = self.state.lock().unwrap();
				let found = state
					.boards
					.values()
					.find(|board| {
						board.has_capability(cap) && board.matches_identity(spec).unwrap_or(false) && (parallel || !state.claimed.contains(&board.location))
					})
					.cloned();

				if let Some(board) = found {
					if !parallel {
						state.claimed.insert(board.location.clone());
					}
					return Ok(board);
				}
			}

			if Instant::now() >= deadline {
				return Err(ErrorKind::NotFound(format!("no board matching '{}' with {} capability within timeout", spec, cap)).error());
			}

			std::thread::sleep(self.poll_interval());
		}
	}
}

#[cfg(test)]
mod tests
{
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::interface::dfu::DfuVendorDriver;
	use crate::monitor::sim::SimMonitor;
	use crate::monitor::RawDevice;

	fn device(id: u64, location: &str, vid: u16, pid: u16) -> RawDevice
	{
		RawDevice {
			id: DeviceId(id),
			location: location.to_string(),
			vid,
			pid,
			serial_number: Some(id.to_string()),
			path: None,
			interface_number: 0,
		}
	}

	fn manager_with_dfu_driver(monitor: SimMonitor) -> BoardManager
	{
		let drivers: Vec<Box<dyn VendorDriver>> =
			vec![Box::new(DfuVendorDriver { vid: 0x16C0, pid: 0x0478, interface_number: 0 })];
		BoardManager::with_drop_delay(Box::new(monitor), drivers, Duration::from_millis(50))
	}

	#[test]
	fn hotplug_cycle_adds_and_drops()
	{
		let mut sim = SimMonitor::new();
		sim.plug(device(1, "1-2", 0x16C0, 0x0478));
		let manager = manager_with_dfu_driver(sim);

		manager.enumerate().unwrap();
		assert_eq!(manager.boards().len(), 1);

		let board = manager.find("1-2").unwrap().expect("board should be present");
		assert!(board.has_capability(Capability::Upload));
	}

	#[test]
	fn unmanaged_device_is_ignored()
	{
		let mut sim = SimMonitor::new();
		sim.plug(device(1, "1-2", 0xDEAD, 0xBEEF));
		let manager = manager_with_dfu_driver(sim);

		manager.enumerate().unwrap();
		assert_eq!(manager.boards().len(), 0);
	}

	#[test]
	fn callback_self_deregisters_on_false()
	{
		let mut sim = SimMonitor::new();
		sim.plug(device(1, "1-2", 0x16C0, 0x0478));
		let manager = manager_with_dfu_driver(sim);

		let calls = Arc::new(AtomicUsize::new(0));
		let calls_clone = Arc::clone(&calls);
		manager.register_callback(Box::new(move |_board, _event| {
			calls_clone.fetch_add(1, Ordering::SeqCst);
			false
		}));

		manager.enumerate().unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		// A second event would previously have called again; confirm it no longer does, by
		// driving a fresh refresh with no new devices.
		manager.refresh();
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn next_deadline_tracks_earliest_missing_board()
	{
		let mut sim = SimMonitor::new();
		sim.plug(device(1, "1-2", 0x16C0, 0x0478));
		let manager = manager_with_dfu_driver(sim);
		manager.enumerate().unwrap();
		assert_eq!(manager.next_deadline(), None, "no board is missing yet");

		manager.refresh();
		manager_remove(&manager, DeviceId(1));
		let board = manager.find("1-2").unwrap().expect("board tracked while missing");
		assert_eq!(board.state(), crate::board::BoardState::Missing);

		let deadline = manager.next_deadline().expect("a missing board has a pending drop deadline");
		assert!(deadline >= board.missing_since().unwrap() + Duration::from_millis(50));
	}

	/// Drives `BoardManager::handle_removed` directly, since `SimMonitor`'s `unplug` only queues
	/// an event for the next `refresh`'s `poll`, and this test wants to assert on state in
	/// between without a second `refresh` call racing the drop-delay timer.
	fn manager_remove(manager: &BoardManager, device_id: DeviceId)
	{
		let mut state = manager.state.lock().unwrap();
		manager.handle_removed(&mut state, device_id);
	}
}
