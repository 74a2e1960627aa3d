// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A background queue served by one dedicated worker thread.
///
/// Jobs run in submission order. [`WorkQueue::flush`] blocks until every job submitted before the
/// call has finished, which is what teardown relies on to know that no background work still
/// references a dying address space.
pub struct WorkQueue {
    name: String,
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    /// Signalled when a job is queued or the queue is stopping.
    work_available: Condvar,
    /// Signalled whenever a job finishes.
    job_done: Condvar,
}

#[derive(Default)]
struct State {
    jobs: VecDeque<Job>,
    submitted: u64,
    completed: u64,
    stopping: bool,
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("queued", &state.jobs.len())
            .field("submitted", &state.submitted)
            .field("completed", &state.completed)
            .finish_non_exhaustive()
    }
}

impl WorkQueue {
    /// Spawns the worker thread for a new queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`] if the worker thread could not be spawned.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            work_available: Condvar::new(),
            job_done: Condvar::new(),
        });

        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn({
                let shared = shared.clone();
                move || shared.run()
            })
            .map_err(|err| {
                log::warn!("failed to spawn worker thread {name}: {err}");
                Error::NoMemory
            })?;

        Ok(Self {
            name,
            shared,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `job` for execution on the worker thread.
    ///
    /// Returns `false` if the queue is shutting down and the job was dropped.
    pub fn schedule<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.stopping {
            return false;
        }
        state.jobs.push_back(Box::new(job));
        state.submitted += 1;
        drop(state);

        self.shared.work_available.notify_one();
        true
    }

    /// Blocks until every job scheduled before this call has completed.
    pub fn flush(&self) {
        debug_assert!(
            self.worker
                .as_ref()
                .is_none_or(|worker| worker.thread().id() != thread::current().id()),
            "work queue {} flushed from its own worker",
            self.name
        );

        let mut state = self.shared.state.lock();
        let target = state.submitted;
        log::trace!(
            "flushing work queue {} ({} outstanding)",
            self.name,
            target - state.completed
        );
        while state.completed < target {
            self.shared.job_done.wait(&mut state);
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shared.state.lock().stopping = true;
        self.shared.work_available.notify_all();

        let joined = self.worker.take().map(thread::JoinHandle::join);
        if matches!(joined, Some(Err(_))) {
            log::warn!("worker thread {} panicked", self.name);
        }
    }
}

impl Shared {
    fn run(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if let Some(job) = state.jobs.pop_front() {
                        break job;
                    }
                    if state.stopping {
                        return;
                    }
                    self.work_available.wait(&mut state);
                }
            };

            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                let current = thread::current();
                log::error!(
                    "job on work queue {} panicked",
                    current.name().unwrap_or("<unnamed>")
                );
            }

            self.state.lock().completed += 1;
            self.job_done.notify_all();
        }
    }
}
