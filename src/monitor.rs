// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! The device monitor: the external collaborator the board manager consumes.
//!
//! In the reference tool this is an OS-specific hotplug backend behind a descriptor set a
//! caller polls. Here it is a small trait, [DeviceMonitor], with two implementations: [NusbMonitor]
//! backed by real `nusb` enumeration and hotplug watching, and [sim::SimMonitor], an in-memory
//! fake used by tests (grounded in the simulated transport pattern used for bootloader-protocol
//! testing elsewhere in this space, e.g. a `com::sim` backend standing in for real hardware).

use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use futures_lite::StreamExt;
use log::{debug, warn};

use crate::error::Error;

/// Opaque, hashable identity for a raw device, stable across the `Added`/`Removed` pair for a
/// single USB attach/detach cycle. This is the key the board manager's device-to-interface hash
/// table uses; a reimplementation on another backend must key on whatever pointer-equivalent
/// that backend hands back for the `Removed` event of a device it previously reported `Added`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

/// A USB device as reported by the monitor, before any vendor driver has tried to claim it.
#[derive(Debug, Clone)]
pub struct RawDevice
{
	pub id: DeviceId,
	/// OS-reported USB topological path, stable across a bootloader transition.
	pub location: String,
	pub vid: u16,
	pub pid: u16,
	pub serial_number: Option<String>,
	pub path: Option<String>,
	pub interface_number: u8,
}

impl Display for RawDevice
{
	fn fmt(&self, f: &mut Formatter) -> fmt::Result
	{
		write!(f, "{:04x}:{:04x} at {}", self.vid, self.pid, self.location)
	}
}

/// `{Added, Removed}` as named in the spec for this subsystem.
#[derive(Debug, Clone)]
pub enum DeviceEvent
{
	Added(RawDevice),
	Removed(DeviceId),
}

/// The external USB hotplug monitor. Implementations are free to be backed by real hardware
/// enumeration or by a test double; the board manager only ever sees this trait.
pub trait DeviceMonitor: Send
{
	/// One-shot enumeration of every currently-attached matching device.
	fn list(&mut self) -> Result<Vec<RawDevice>, Error>;

	/// Non-blocking drain of events queued since the last call.
	fn poll(&mut self) -> Vec<DeviceEvent>;
}

/// Real device monitor, backed by `nusb` enumeration and hotplug watching.
///
/// `nusb`'s hotplug stream is driven on a dedicated background thread (the crate has no async
/// runtime anywhere else, per the concurrency model) and funneled into a channel that [poll]
/// drains without blocking.
pub struct NusbMonitor
{
	events: Receiver<DeviceEvent>,
	_worker: Option<thread::JoinHandle<()>>,
}

impl NusbMonitor
{
	pub fn new() -> Result<Self, Error>
	{
		let (tx, rx): (Sender<DeviceEvent>, Receiver<DeviceEvent>) = mpsc::channel();
		let worker = thread::Builder::new()
			.name(String::from("tyboard-monitor"))
			.spawn(move || Self::watch_loop(tx))
			.map_err(|e| crate::error::ErrorKind::Other(String::from("failed to spawn monitor thread")).error_from(e))?;

		Ok(Self { events: rx, _worker: Some(worker) })
	}

	fn watch_loop(tx: Sender<DeviceEvent>)
	{
		let watch = match nusb::watch_devices() {
			Ok(watch) => watch,
			Err(e) => {
				warn!("failed to start USB hotplug watch: {}", e);
				return;
			},
		};

		futures_lite::future::block_on(async move {
			let mut watch = watch;
			while let Some(event) = watch.next().await {
				let mapped = match event {
					nusb::hotplug::HotplugEvent::Connected(info) => {
						DeviceEvent::Added(raw_device_from_info(&info))
					},
					nusb::hotplug::HotplugEvent::Disconnected(id) => {
						DeviceEvent::Removed(DeviceId(hash_device_id(&id)))
					},
				};

				if tx.send(mapped).is_err() {
					// Receiver (manager) dropped; nothing left to do but stop watching.
					break;
				}
			}
		});
	}
}

impl DeviceMonitor for NusbMonitor
{
	fn list(&mut self) -> Result<Vec<RawDevice>, Error>
	{
		let devices = nusb::list_devices()?;
		Ok(devices.map(|info| raw_device_from_info(&info)).collect())
	}

	fn poll(&mut self) -> Vec<DeviceEvent>
	{
		let mut events = Vec::new();
		while let Ok(event) = self.events.try_recv() {
			events.push(event);
		}
		debug!("drained {} hotplug event(s)", events.len());
		events
	}
}

fn raw_device_from_info(info: &nusb::DeviceInfo) -> RawDevice
{
	RawDevice {
		id: DeviceId(hash_device_id(&info.id())),
		location: port_chain_string(info),
		vid: info.vendor_id(),
		pid: info.product_id(),
		serial_number: info.serial_number().map(String::from),
		path: info.path().map(|p| p.to_string_lossy().into_owned()),
		interface_number: 0,
	}
}

fn port_chain_string(info: &nusb::DeviceInfo) -> String
{
	format!("{}-{}", info.bus_number(), info.port_chain().iter().map(|p| p.to_string()).collect::<Vec<_>>().join("."))
}

fn hash_device_id<T: std::hash::Hash>(id: &T) -> u64
{
	use std::hash::{Hash, Hasher};
	let mut hasher = std::collections::hash_map::DefaultHasher::new();
	id.hash(&mut hasher);
	hasher.finish()
}

/// Poll interval the caller's refresh loop should use when driving a [NusbMonitor]; hotplug
/// events still arrive on their own background thread, this just bounds event-delivery latency
/// for callers that only call `refresh()` periodically rather than waking on a descriptor.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub mod sim
{
	//! An in-memory, fully deterministic stand-in for USB hardware, for tests.

	use std::collections::VecDeque;

	use super::{DeviceEvent, DeviceId, DeviceMonitor, RawDevice};
	use crate::error::Error;

	/// A fake device monitor a test drives directly by calling [SimMonitor::plug] /
	/// [SimMonitor::unplug]. `list()` reflects whatever is currently plugged; `poll()` drains
	/// whatever events have been queued since the last drain, exactly like real hotplug.
	#[derive(Default)]
	pub struct SimMonitor
	{
		plugged: Vec<RawDevice>,
		pending: VecDeque<DeviceEvent>,
	}

	impl SimMonitor
	{
		pub fn new() -> Self
		{
			Self::default()
		}

		pub fn plug(&mut self, device: RawDevice)
		{
			self.pending.push_back(DeviceEvent::Added(device.clone()));
			self.plugged.push(device);
		}

		pub fn unplug(&mut self, id: DeviceId)
		{
			self.plugged.retain(|d| d.id != id);
			self.pending.push_back(DeviceEvent::Removed(id));
		}
	}

	impl DeviceMonitor for SimMonitor
	{
		/// One-shot enumeration, mirroring a real monitor's `list()`. Any still-pending `Added`
		/// event for a device this call is about to report is drained here: `list()` is how that
		/// device is being surfaced to the caller, so it must not *also* come back out of the next
		/// `poll()`, which would make the board manager link the same device id a second time.
		fn list(&mut self) -> Result<Vec<RawDevice>, Error>
		{
			let devices = self.plugged.clone();
			let ids: std::collections::HashSet<DeviceId> = devices.iter().map(|d| d.id).collect();
			self.pending.retain(|event| !matches!(event, DeviceEvent::Added(d) if ids.contains(&d.id)));
			Ok(devices)
		}

		fn poll(&mut self) -> Vec<DeviceEvent>
		{
			self.pending.drain(..).collect()
		}
	}
}
