use std::collections::VecDeque;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{error, warn};

use super::Job;
use crate::types::MountId;

#[derive(Default)]
struct State {
    queue: VecDeque<(MountId, Vec<Job>)>,
    pending: Option<MountId>,
    running: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Single background thread draining batches of jobs in submission order.
pub struct JobProcessor {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl JobProcessor {
    pub fn start(name: &str) -> io::Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                running: true,
                ..Default::default()
            }),
            cond: Condvar::new(),
        });
        let thread = {
            let inner = inner.clone();
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || run(&inner))?
        };
        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Appends `jobs` for `mount`. Returns `false` once the processor stopped.
    pub fn schedule(&self, mount: MountId, jobs: Vec<Job>) -> bool {
        if jobs.is_empty() {
            return true;
        }
        let mut state = self.inner.lock();
        if !state.running {
            return false;
        }
        match state.queue.iter_mut().find(|(id, _)| *id == mount) {
            Some((_, queued)) => queued.extend(jobs),
            None => state.queue.push_back((mount, jobs)),
        }
        drop(state);
        self.inner.cond.notify_all();
        true
    }

    /// Blocks until nothing is queued or running for `mount`. Returns whether
    /// the processor is still running.
    pub fn wait_for(&self, mount: MountId) -> bool {
        let mut state = self.inner.lock();
        while state.running
            && (state.pending == Some(mount) || state.queue.iter().any(|(id, _)| *id == mount))
        {
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.running
    }

    pub fn stop(&self) {
        self.inner.lock().running = false;
        self.inner.cond.notify_all();
        let Some(thread) = self.thread.lock().ok().and_then(|mut t| t.take()) else {
            return;
        };
        if thread.thread().id() != thread::current().id() && thread.join().is_err() {
            warn!("job processor thread panicked");
        }
    }
}

impl Drop for JobProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inner: &Inner) {
    loop {
        let (mount, jobs) = {
            let mut state = inner.lock();
            while state.running && state.queue.is_empty() {
                state = inner.cond.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            if !state.running {
                return;
            }
            let Some(next) = state.queue.pop_front() else {
                continue;
            };
            state.pending = Some(next.0);
            next
        };
        for job in jobs {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("background job for mount {mount} panicked");
            }
        }
        inner.lock().pending = None;
        inner.cond.notify_all();
    }
}
