// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! End-to-end exercises of the board manager's hotplug state machine against a simulated
//! transport, with no real USB hardware involved.

use std::time::Duration;

use tyboard::board::BoardState;
use tyboard::capability::Capability;
use tyboard::interface::dfu::DfuVendorDriver;
use tyboard::interface::serial::SerialVendorDriver;
use tyboard::interface::VendorDriver;
use tyboard::manager::BoardManager;
use tyboard::monitor::sim::SimMonitor;
use tyboard::monitor::{DeviceId, RawDevice};

const HALFKAY_VID: u16 = 0x16C0;
const HALFKAY_PID: u16 = 0x0478;
const SERIAL_VID: u16 = 0x16C0;
const SERIAL_PID: u16 = 0x0483;

fn drivers() -> Vec<Box<dyn VendorDriver>>
{
	vec![
		Box::new(DfuVendorDriver { vid: HALFKAY_VID, pid: HALFKAY_PID, interface_number: 0 }),
		Box::new(SerialVendorDriver { vid: SERIAL_VID, pid: SERIAL_PID }),
	]
}

fn serial_device(id: u64, location: &str) -> RawDevice
{
	RawDevice {
		id: DeviceId(id),
		location: location.to_string(),
		vid: SERIAL_VID,
		pid: SERIAL_PID,
		serial_number: Some(id.to_string()),
		path: Some(format!("/dev/ttyFAKE{id}")),
		interface_number: 0,
	}
}

fn dfu_device(id: u64, location: &str) -> RawDevice
{
	RawDevice {
		id: DeviceId(id),
		location: location.to_string(),
		vid: HALFKAY_VID,
		pid: HALFKAY_PID,
		serial_number: Some(id.to_string()),
		path: None,
		interface_number: 0,
	}
}

#[test]
fn board_appears_with_serial_capabilities()
{
	let mut sim = SimMonitor::new();
	sim.plug(serial_device(1, "1-1"));

	let manager = BoardManager::with_drop_delay(Box::new(sim), drivers(), Duration::from_millis(50));
	manager.enumerate().unwrap();

	let board = manager.find("1-1").unwrap().expect("board should exist");
	assert_eq!(board.state(), BoardState::Online);
	assert!(board.has_capability(Capability::Serial));
	assert!(board.has_capability(Capability::Reset));
	assert!(board.has_capability(Capability::Reboot));
	assert!(!board.has_capability(Capability::Upload));
}

/// A monitor whose `list()` reports the devices present at construction, and whose `poll()`
/// plays back a fixed, pre-scripted sequence of events one call at a time — enough to drive the
/// manager through a scenario without needing to mutate a monitor already moved into it.
struct ScriptedMonitor
{
	initial: Vec<RawDevice>,
	events: std::collections::VecDeque<tyboard::monitor::DeviceEvent>,
}

impl tyboard::monitor::DeviceMonitor for ScriptedMonitor
{
	fn list(&mut self) -> Result<Vec<RawDevice>, tyboard::error::Error>
	{
		Ok(std::mem::take(&mut self.initial))
	}

	fn poll(&mut self) -> Vec<tyboard::monitor::DeviceEvent>
	{
		self.events.drain(..).collect()
	}
}

#[test]
fn bootloader_transition_swaps_capabilities_at_same_location()
{
	// Simulate the application requesting a reboot into the bootloader: the serial interface
	// disappears and a DFU interface appears moments later at the same USB location, reporting
	// the same serial number (a real board keeps its serial across the transition; only its
	// VID:PID and capabilities change).
	let mut rebooted = dfu_device(2, "1-1");
	rebooted.serial_number = Some(String::from("1"));

	let scripted = ScriptedMonitor {
		initial: vec![serial_device(1, "1-1")],
		events: std::collections::VecDeque::from(vec![
			tyboard::monitor::DeviceEvent::Removed(DeviceId(1)),
			tyboard::monitor::DeviceEvent::Added(rebooted),
		]),
	};

	let manager = BoardManager::with_drop_delay(Box::new(scripted), drivers(), Duration::from_millis(200));
	manager.enumerate().unwrap();
	assert!(manager.find("1-1").unwrap().unwrap().has_capability(Capability::Serial));

	manager.refresh();
	let board_after = manager.find("1-1").unwrap().expect("board should still exist at the same location");
	assert!(board_after.has_capability(Capability::Upload));
	assert!(!board_after.has_capability(Capability::Serial));
}

#[test]
fn missing_board_drops_after_delay()
{
	// SimMonitor's plugged set can't be mutated once moved into a manager, so the unplug is
	// scripted the same way as the bootloader transition test above.
	struct UnplugThenWait
	{
		initial: Vec<RawDevice>,
		removed: bool,
	}

	impl tyboard::monitor::DeviceMonitor for UnplugThenWait
	{
		fn list(&mut self) -> Result<Vec<RawDevice>, tyboard::error::Error>
		{
			Ok(std::mem::take(&mut self.initial))
		}

		fn poll(&mut self) -> Vec<tyboard::monitor::DeviceEvent>
		{
			if !self.removed {
				self.removed = true;
				vec![tyboard::monitor::DeviceEvent::Removed(DeviceId(1))]
			} else {
				Vec::new()
			}
		}
	}

	let manager = BoardManager::with_drop_delay(
		Box::new(UnplugThenWait { initial: vec![serial_device(1, "1-1")], removed: false }),
		drivers(),
		Duration::from_millis(40),
	);
	manager.enumerate().unwrap();
	manager.refresh();

	let board = manager.find("1-1").unwrap().expect("still tracked while missing");
	assert_eq!(board.state(), BoardState::Missing);

	std::thread::sleep(Duration::from_millis(80));
	manager.refresh();
	assert!(manager.find("1-1").unwrap().is_none(), "board should have been dropped after the delay");
}

#[test]
fn callback_receives_added_and_missing_events()
{
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	let mut sim = SimMonitor::new();
	sim.plug(serial_device(1, "1-1"));
	let manager = BoardManager::with_drop_delay(Box::new(sim), drivers(), Duration::from_millis(30));

	let added = Arc::new(AtomicUsize::new(0));
	let added_clone = Arc::clone(&added);
	manager.register_callback(Box::new(move |_board, event| {
		if event == tyboard::manager::BoardEvent::Added {
			added_clone.fetch_add(1, Ordering::SeqCst);
		}
		true
	}));

	manager.enumerate().unwrap();
	assert_eq!(added.load(Ordering::SeqCst), 1);
}
