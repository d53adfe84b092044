// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Process-wide message bus: every log line, task status change, and upload progress tick
//! passes through here, so a single CLI (or embedder) handler can route all three without each
//! subsystem needing its own callback plumbing.

use std::sync::{OnceLock, RwLock};

use crate::task::TaskStatus;

/// One event on the bus. `Log` mirrors what would otherwise go straight to the `log` crate;
/// `Status` and `Progress` are emitted by [crate::task::Task] execution and
/// [crate::upload], respectively.
#[derive(Debug, Clone)]
pub enum Message
{
	Log
	{
		level: log::Level, text: String
	},
	Status
	{
		task: String, status: TaskStatus
	},
	Progress
	{
		task: String, action: String, value: u64, max: u64
	},
}

pub type Handler = Box<dyn Fn(&Message) + Send + Sync>;

fn bus() -> &'static RwLock<Option<Handler>>
{
	static BUS: OnceLock<RwLock<Option<Handler>>> = OnceLock::new();
	BUS.get_or_init(|| RwLock::new(None))
}

/// Installs the process-wide handler, replacing whatever was there before. `None` reverts to
/// the default behavior of forwarding `Log` messages to the `log` crate and silently dropping
/// `Status`/`Progress`.
pub fn set_handler(handler: Option<Handler>)
{
	*bus().write().unwrap() = handler;
}

/// Synchronously dispatches `message` to the installed handler, or to the default behavior if
/// none is installed. Callers on any thread may dispatch concurrently; the handler itself must
/// tolerate being called from multiple threads at once.
pub fn dispatch(message: Message)
{
	let guard = bus().read().unwrap();
	match guard.as_ref() {
		Some(handler) => handler(&message),
		None => default_handle(&message),
	}
}

fn default_handle(message: &Message)
{
	if let Message::Log { level, text } = message {
		log::log!(*level, "{}", text);
	}
}

pub fn log(level: log::Level, text: impl Into<String>)
{
	dispatch(Message::Log { level, text: text.into() });
}

pub fn status(task: impl Into<String>, status: TaskStatus)
{
	dispatch(Message::Status { task: task.into(), status });
}

pub fn progress(task: impl Into<String>, action: impl Into<String>, value: u64, max: u64)
{
	dispatch(Message::Progress { task: task.into(), action: action.into(), value, max });
}

#[cfg(test)]
mod tests
{
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::{Arc, Mutex};

	use super::*;

	// The bus is a process-wide global; serialize tests that install a handler so they don't
	// observe each other's dispatches.
	static TEST_LOCK: Mutex<()> = Mutex::new(());

	#[test]
	fn default_handler_does_not_panic_on_any_variant()
	{
		let _guard = TEST_LOCK.lock().unwrap();
		set_handler(None);
		log(log::Level::Info, "hello");
		status("t", TaskStatus::Finished);
		progress("t", "erase", 1, 10);
	}

	#[test]
	fn custom_handler_receives_every_dispatch()
	{
		let _guard = TEST_LOCK.lock().unwrap();
		let count = Arc::new(AtomicUsize::new(0));
		let count_clone = Arc::clone(&count);
		set_handler(Some(Box::new(move |_msg: &Message| {
			count_clone.fetch_add(1, Ordering::SeqCst);
		})));

		log(log::Level::Warn, "uh oh");
		status("t", TaskStatus::Running);
		progress("t", "write", 5, 10);

		assert_eq!(count.load(Ordering::SeqCst), 3);
		set_handler(None);
	}
}
