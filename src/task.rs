// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>
//! A refcounted unit of work run by a [crate::pool::Pool] worker thread.
//!
//! A [Task] carries its own status and result, so any number of holders of its `Arc` can wait
//! for it independently of whichever worker thread (or inline caller, via the pool's fast path)
//! actually executes it.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::Error;
use crate::message;

/// Monotonic lifecycle: a task only ever moves forward through this sequence, never backward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskStatus
{
	/// Constructed, not yet handed to a pool.
	Ready,
	/// Queued on a pool, waiting for a worker (or an inline waiter) to claim it.
	Pending,
	/// Currently executing.
	Running,
	/// Done; `result()` is available.
	Finished,
}

pub type RunFn = Box<dyn FnOnce() -> Result<(), Error> + Send>;
/// Runs after `run` completes, still on whichever thread executed the task, with a look at the
/// outcome — used by the upload driver to fire a final [crate::message::Message::Status] without
/// every caller having to remember to do so itself.
pub type FinalizeFn = Box<dyn FnOnce(&Result<(), Error>) + Send>;

struct Inner
{
	status: TaskStatus,
	run: Option<RunFn>,
	finalize: Option<FinalizeFn>,
	result: Option<Result<(), Arc<Error>>>,
}

pub struct Task
{
	pub name: String,
	inner: Mutex<Inner>,
	condvar: Condvar,
}

impl Task
{
	pub fn new(name: impl Into<String>, run: RunFn) -> Arc<Self>
	{
		Arc::new(Self {
			name: name.into(),
			inner: Mutex::new(Inner { status: TaskStatus::Ready, run: Some(run), finalize: None, result: None }),
			condvar: Condvar::new(),
		})
	}

	pub fn with_finalize(name: impl Into<String>, run: RunFn, finalize: FinalizeFn) -> Arc<Self>
	{
		Arc::new(Self {
			name: name.into(),
			inner: Mutex::new(Inner { status: TaskStatus::Ready, run: Some(run), finalize: Some(finalize), result: None }),
			condvar: Condvar::new(),
		})
	}

	pub fn status(&self) -> TaskStatus
	{
		self.inner.lock().unwrap().status
	}

	/// Marks the task as queued. Only valid from `Ready`; called once by whichever pool accepts
	/// it.
	pub(crate) fn mark_pending(&self)
	{
		let mut inner = self.inner.lock().unwrap();
		debug_assert_eq!(inner.status, TaskStatus::Ready, "task {} queued twice", self.name);
		inner.status = TaskStatus::Pending;
		drop(inner);
		message::status(self.name.clone(), TaskStatus::Pending);
	}

	/// Attempts to claim a still-`Pending` task for inline execution on the calling thread. Used
	/// by [crate::pool::Pool::wait]'s fast path to race a pool worker for tasks that haven't
	/// started yet, so a caller that's about to block anyway can just do the work itself.
	/// Returns `true` if the caller won the race.
	pub(crate) fn try_claim_inline(&self) -> bool
	{
		let mut inner = self.inner.lock().unwrap();
		if inner.status == TaskStatus::Pending {
			inner.status = TaskStatus::Running;
			true
		} else {
			false
		}
	}

	/// Runs the task to completion on the calling thread. Expects the caller (a pool worker, or
	/// an inline waiter that won [Task::try_claim_inline]) to have already moved status to
	/// `Running`, or to not care that this overwrites `Pending` → `Running` itself.
	pub(crate) fn run_now(self: &Arc<Self>)
	{
		let (run, finalize) = {
			let mut inner = self.inner.lock().unwrap();
			inner.status = TaskStatus::Running;
			(inner.run.take(), inner.finalize.take())
		};
		message::status(self.name.clone(), TaskStatus::Running);

		let result = match run {
			Some(run) => run(),
			None => Ok(()),
		};

		if let Some(finalize) = finalize {
			finalize(&result);
		}

		let mut inner = self.inner.lock().unwrap();
		inner.result = Some(result.map_err(Arc::new));
		inner.status = TaskStatus::Finished;
		drop(inner);
		self.condvar.notify_all();
		message::status(self.name.clone(), TaskStatus::Finished);
	}

	/// Blocks until the task reaches [TaskStatus::Finished] and returns its result. Any number of
	/// callers may join the same task; the result is shared via [Arc].
	pub fn join(&self) -> Result<(), Arc<Error>>
	{
		let mut inner = self.inner.lock().unwrap();
		while inner.status != TaskStatus::Finished {
			inner = self.condvar.wait(inner).unwrap();
		}
		inner.result.clone().expect("a finished task always has a result")
	}
}

#[cfg(test)]
mod tests
{
	use std::sync::atomic::{AtomicBool, Ordering};

	use super::*;

	#[test]
	fn run_now_transitions_to_finished_and_stores_result()
	{
		let task = Task::new("t", Box::new(|| Ok(())));
		assert_eq!(task.status(), TaskStatus::Ready);
		task.run_now();
		assert_eq!(task.status(), TaskStatus::Finished);
		assert!(task.join().is_ok());
	}

	#[test]
	fn finalize_runs_after_run_and_sees_result()
	{
		let saw_err = Arc::new(AtomicBool::new(false));
		let saw_err_clone = Arc::clone(&saw_err);

		let task = Task::with_finalize(
			"t",
			Box::new(|| Err(crate::error::ErrorKind::Other(String::from("boom")).error())),
			Box::new(move |result| saw_err_clone.store(result.is_err(), Ordering::SeqCst)),
		);

		task.run_now();
		assert!(saw_err.load(Ordering::SeqCst));
		assert!(task.join().is_err());
	}

	#[test]
	fn try_claim_inline_only_succeeds_while_pending()
	{
		let task = Task::new("t", Box::new(|| Ok(())));
		assert!(!task.try_claim_inline(), "not pending yet");

		task.mark_pending();
		assert!(task.try_claim_inline());
		assert!(!task.try_claim_inline(), "second claim must lose the race");
	}
}
