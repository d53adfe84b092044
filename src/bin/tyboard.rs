// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! Command-line front end: board listing, hotplug monitoring, and firmware upload.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

use tyboard::board::Board;
use tyboard::interface::dfu::DfuVendorDriver;
#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
use tyboard::interface::serial::SerialVendorDriver;
use tyboard::interface::VendorDriver;
use tyboard::manager::BoardManager;
use tyboard::message::{self, Message};
use tyboard::monitor::NusbMonitor;
use tyboard::pool::Pool;
use tyboard::task::Task;
use tyboard::upload::{self, UploadOptions};

#[derive(Parser)]
#[command(name = "tyboard", version, about = "Fleet management and firmware upload companion for Teensy-family USB development boards")]
struct Cli
{
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command
{
	/// Upload firmware to a board.
	Upload
	{
		/// `[location][#serial]` board identity; if omitted and more than one board is present,
		/// you'll be prompted to pick one.
		#[arg(short = 'b', long = "board", default_value = "")]
		board: String,

		/// Skip the firmware/board model cross-check (a warning is still printed).
		#[arg(long)]
		nocheck: bool,

		/// Don't reset the board after a successful upload.
		#[arg(long)]
		noreset: bool,

		/// Wait for a matching board to appear instead of failing immediately.
		#[arg(short = 'w', long)]
		wait: bool,

		/// Firmware image to upload: ELF, Intel HEX, or raw binary; format is auto-detected.
		#[arg(short = 'f', long = "format")]
		format: Option<String>,

		filename: PathBuf,
	},

	/// List currently attached boards.
	List,

	/// Watch for boards being attached and detached until interrupted.
	Monitor,
}

fn main() -> Result<()>
{
	color_eyre::install()?;
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).format_timestamp(None).init();

	let cli = Cli::parse();
	let manager = Arc::new(build_manager()?);
	manager.enumerate().map_err(|e| eyre!(e.to_string()))?;

	match cli.command {
		Command::Upload { board, nocheck, noreset, wait, format, filename } => {
			if format.is_some() {
				log::debug!("--format is accepted for compatibility; firmware format is always auto-detected");
			}
			run_upload(Arc::clone(&manager), &Pool::new(), board, nocheck, noreset, wait, filename)
		},
		Command::List => run_list(&manager),
		Command::Monitor => run_monitor(&manager),
	}
}

fn build_manager() -> Result<BoardManager>
{
	let monitor = NusbMonitor::new().map_err(|e| eyre!(e.to_string()))?;
	let drivers = default_drivers();
	Ok(BoardManager::new(Box::new(monitor), drivers))
}

/// The vendor drivers this CLI knows how to talk to: the HalfKay bootloader (DFU-class, exposes
/// `upload`) and the runtime USB-serial port (exposes `reset`/`reboot`/`serial`), both under
/// PJRC's Teensy USB vendor ID.
fn default_drivers() -> Vec<Box<dyn VendorDriver>>
{
	#[allow(unused_mut)]
	let mut drivers: Vec<Box<dyn VendorDriver>> =
		vec![Box::new(DfuVendorDriver { vid: 0x16C0, pid: 0x0478, interface_number: 0 })];

	#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
	drivers.push(Box::new(SerialVendorDriver { vid: 0x16C0, pid: 0x0483 }));

	drivers
}

fn run_list(manager: &BoardManager) -> Result<()>
{
	manager.refresh();
	let boards = manager.boards();

	if boards.is_empty() {
		println!("{}", "No boards found.".yellow());
		return Ok(());
	}

	for board in boards {
		println!("{}", board.to_string().bold());
	}

	Ok(())
}

fn run_monitor(manager: &BoardManager) -> Result<()>
{
	println!("Watching for boards, press Ctrl+C to stop.");

	message::set_handler(Some(Box::new(|msg: &Message| {
		if let Message::Log { text, .. } = msg {
			println!("{}", text);
		}
	})));

	loop {
		manager.refresh();

		// Wake early for a board's drop-delay expiry rather than waiting out a full poll
		// interval past it, same as `BoardManager`'s own wait loops do internally.
		let sleep = match manager.next_deadline() {
			Some(deadline) => tyboard::monitor::DEFAULT_POLL_INTERVAL.min(deadline.saturating_duration_since(std::time::Instant::now())),
			None => tyboard::monitor::DEFAULT_POLL_INTERVAL,
		};
		std::thread::sleep(sleep);
	}
}

fn select_board(manager: &BoardManager, spec: &str) -> Result<Arc<Board>>
{
	if !spec.is_empty() {
		return manager.find(spec).map_err(|e| eyre!(e.to_string()))?.ok_or_else(|| eyre!("no board matching '{}'", spec));
	}

	let boards = manager.boards();
	match boards.len() {
		0 => Err(eyre!("no boards found")),
		1 => Ok(boards.into_iter().next().unwrap()),
		_ => {
			let labels: Vec<String> = boards.iter().map(|b| b.to_string()).collect();
			let selection =
				dialoguer::Select::new().with_prompt("Multiple boards found, pick one").items(&labels).default(0).interact()?;
			Ok(Arc::clone(&boards[selection]))
		},
	}
}

/// Runs the upload as a [Task] dispatched onto `pool`, rather than calling [upload::run] directly
/// on the main thread — exercising the same task/pool runtime a GUI embedder would use to keep
/// its event loop responsive while a long upload is in flight. The CLI has nothing else to do
/// meanwhile, so it immediately joins the task, but the progress bar is still driven purely by
/// messages arriving asynchronously from whichever thread the pool picked to run it on.
fn run_upload(
	manager: Arc<BoardManager>,
	pool: &Arc<Pool>,
	board_spec: String,
	nocheck: bool,
	noreset: bool,
	wait: bool,
	filename: PathBuf,
) -> Result<()>
{
	manager.refresh();
	let board = select_board(&manager, &board_spec)?;

	let bar = ProgressBar::new(0);
	if let Ok(style) = ProgressStyle::with_template("{msg} [{bar:40}] {bytes}/{total_bytes}") {
		bar.set_style(style.progress_chars("=> "));
	}

	message::set_handler(Some(Box::new(move |msg: &Message| match msg {
		// Every line the upload driver emits via the message bus — including the
		// "Reboot didn't work, press button manually" advisory, logged at `Error` level —
		// is one of spec.md §6's enumerated stdout lines; none of them go to stderr. A
		// genuine fatal failure instead surfaces as an `Err` return from `upload::run` and
		// is reported by `color_eyre` at the bottom of `main`.
		Message::Log { text, .. } => println!("{}", text),
		Message::Progress { action, value, max, .. } => {
			bar.set_message(action.clone());
			bar.set_length(*max);
			bar.set_position(*value);
		},
		Message::Status { .. } => {},
	})));

	let options = UploadOptions { spec: board.identity.clone(), nocheck, noreset, wait, timeout: Duration::from_secs(30) };

	let task_name = board.identity.clone();
	let task = Task::new(
		task_name,
		Box::new(move || upload::run(&manager, &filename, &options).map(|_| ())),
	);
	pool.submit(Arc::clone(&task));
	let result = pool.wait(&task);
	message::set_handler(None);

	result.map_err(|e| eyre!(e.to_string()))
}
