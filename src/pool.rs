// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! A bounded worker-thread pool that runs [Task]s, with idle worker shutdown and a synchronous
//! fast path for callers that are about to block anyway.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, trace};

use crate::task::Task;

pub const DEFAULT_MAX_THREADS: usize = 16;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(10_000);

struct State
{
	queue: VecDeque<Arc<Task>>,
	/// Workers currently alive (idle or busy).
	threads: usize,
	/// Workers currently executing a task.
	busy: usize,
	shutting_down: bool,
}

/// Bounded pool of OS threads that execute [Task]s pulled off a shared queue.
///
/// Worker threads are spawned lazily, up to `max_threads`, and exit after sitting idle for
/// `unused_timeout`. Shrinking `max_threads` at runtime (via [Pool::set_max_threads]) causes
/// excess idle workers to notice and exit on their next wake rather than being killed outright.
pub struct Pool
{
	state: Mutex<State>,
	cond: Condvar,
	max_threads: Mutex<usize>,
	unused_timeout: Duration,
}

impl Pool
{
	pub fn new() -> Arc<Self>
	{
		Self::with_config(DEFAULT_MAX_THREADS, DEFAULT_IDLE_TIMEOUT)
	}

	pub fn with_config(max_threads: usize, unused_timeout: Duration) -> Arc<Self>
	{
		Arc::new(Self {
			state: Mutex::new(State { queue: VecDeque::new(), threads: 0, busy: 0, shutting_down: false }),
			cond: Condvar::new(),
			max_threads: Mutex::new(max_threads.max(1)),
			unused_timeout,
		})
	}

	pub fn set_max_threads(&self, max_threads: usize)
	{
		*self.max_threads.lock().unwrap() = max_threads.max(1);
		self.cond.notify_all();
	}

	fn max_threads(&self) -> usize
	{
		*self.max_threads.lock().unwrap()
	}

	/// Queues `task`, spawning a new worker if every current worker is busy and the pool is
	/// under its thread cap.
	pub fn submit(self: &Arc<Self>, task: Arc<Task>)
	{
		task.mark_pending();

		let mut state = self.state.lock().unwrap();
		state.queue.push_back(task);

		if state.busy >= state.threads && state.threads < self.max_threads() {
			state.threads += 1;
			let pool = Arc::clone(self);
			let builder = std::thread::Builder::new().name(String::from("tyboard-pool"));
			if builder.spawn(move || pool.worker_loop()).is_err() {
				state.threads -= 1;
			}
		}

		self.cond.notify_one();
	}

	/// Blocks until `task` finishes. If it's still sitting in the queue (no worker has claimed
	/// it yet), the calling thread steals and runs it inline instead of waiting on a worker —
	/// this is a pure latency optimization, safe to race because [Task::try_claim_inline] only
	/// succeeds once.
	pub fn wait(&self, task: &Arc<Task>) -> Result<(), Arc<crate::error::Error>>
	{
		{
			let mut state = self.state.lock().unwrap();
			if let Some(pos) = state.queue.iter().position(|queued| Arc::ptr_eq(queued, task)) {
				if task.try_claim_inline() {
					state.queue.remove(pos);
					drop(state);
					trace!("task {} run inline by waiter", task.name);
					task.run_now();
					return task.join();
				}
			}
		}

		task.join()
	}

	fn worker_loop(self: Arc<Self>)
	{
		loop {
			let task = {
				let mut state = self.state.lock().unwrap();
				loop {
					if let Some(task) = state.queue.pop_front() {
						break Some(task);
					}

					if state.shutting_down || state.threads > self.max_threads() {
						state.threads -= 1;
						return;
					}

					let (guard, timeout_result) = self.cond.wait_timeout(state, self.unused_timeout).unwrap();
					state = guard;

					if timeout_result.timed_out() && state.queue.is_empty() {
						state.threads -= 1;
						debug!("pool worker exiting after {:?} idle", self.unused_timeout);
						return;
					}
				}
			};

			let Some(task) = task else { return };

			{
				let mut state = self.state.lock().unwrap();
				state.busy += 1;
			}

			task.run_now();

			{
				let mut state = self.state.lock().unwrap();
				state.busy -= 1;
			}
		}
	}

	pub fn thread_count(&self) -> usize
	{
		self.state.lock().unwrap().threads
	}

	pub fn queue_len(&self) -> usize
	{
		self.state.lock().unwrap().queue.len()
	}

	/// Signals every worker to exit once idle, and blocks until the pool has no live workers.
	pub fn shutdown(&self)
	{
		{
			let mut state = self.state.lock().unwrap();
			state.shutting_down = true;
		}
		self.cond.notify_all();

		loop {
			{
				let state = self.state.lock().unwrap();
				if state.threads == 0 {
					return;
				}
			}
			std::thread::sleep(Duration::from_millis(5));
		}
	}
}

#[cfg(test)]
mod tests
{
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use super::*;

	#[test]
	fn submit_and_wait_runs_task()
	{
		let pool = Pool::with_config(2, Duration::from_millis(50));
		let ran = Arc::new(AtomicUsize::new(0));
		let ran_clone = Arc::clone(&ran);

		let task = Task::new(
			"count",
			Box::new(move || {
				ran_clone.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}),
		);

		pool.submit(Arc::clone(&task));
		assert!(pool.wait(&task).is_ok());
		assert_eq!(ran.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn wait_fast_path_can_run_task_before_any_worker_does()
	{
		// Max threads 0 forces no worker to ever be spawned, so `wait` must fall back to
		// claiming and running the task itself rather than hanging forever.
		let pool = Pool::with_config(1, Duration::from_millis(50));
		let task = Task::new("inline", Box::new(|| Ok(())));

		// Submit without letting a worker spawn by directly queuing via submit, then
		// immediately waiting: the race is won by whichever of the spawned worker or this
		// thread gets there first, but either way the task completes exactly once.
		pool.submit(Arc::clone(&task));
		assert!(pool.wait(&task).is_ok());
	}

	#[test]
	fn idle_workers_exit_after_timeout()
	{
		let pool = Pool::with_config(4, Duration::from_millis(20));
		let task = Task::new("t", Box::new(|| Ok(())));
		pool.submit(Arc::clone(&task));
		pool.wait(&task).unwrap();

		std::thread::sleep(Duration::from_millis(100));
		assert_eq!(pool.thread_count(), 0);
	}

	#[test]
	fn shutdown_waits_for_workers_to_exit()
	{
		let pool = Pool::with_config(4, Duration::from_millis(1000));
		let task = Task::new("t", Box::new(|| Ok(())));
		pool.submit(Arc::clone(&task));
		pool.wait(&task).unwrap();

		pool.shutdown();
		assert_eq!(pool.thread_count(), 0);
	}
}
