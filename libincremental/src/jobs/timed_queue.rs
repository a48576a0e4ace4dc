use std::collections::HashMap;
use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::Job;
use crate::types::MountId;

/// Deferred jobs keyed by an owner id. Every job of an owner can be
/// cancelled at once.
pub trait TimedQueue: Send + Sync {
    fn add_job(&self, id: MountId, after: Duration, job: Job);

    fn remove_jobs(&self, id: MountId);

    /// Drops every pending job and refuses new ones.
    fn stop(&self);
}

/// [`TimedQueue`] running its jobs on a dedicated current-thread runtime.
pub struct TokioTimedQueue {
    name: String,
    handle: Handle,
    jobs: Mutex<HashMap<MountId, Vec<AbortHandle>>>,
    shutdown: Arc<Notify>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TokioTimedQueue {
    pub fn start(name: &str) -> io::Result<Self> {
        let shutdown = Arc::new(Notify::new());
        let (tx, rx) = mpsc::channel();
        let thread = {
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    let runtime = match Builder::new_current_thread().enable_time().build() {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = tx.send(Ok(runtime.handle().clone()));
                    runtime.block_on(shutdown.notified());
                })?
        };
        let handle = rx
            .recv()
            .map_err(|_| io::Error::other("timed queue thread exited early"))??;
        debug!("timed queue {name} started");
        Ok(Self {
            name: name.to_string(),
            handle,
            jobs: Mutex::new(HashMap::new()),
            shutdown,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl TimedQueue for TokioTimedQueue {
    fn add_job(&self, id: MountId, after: Duration, job: Job) {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(after).await;
            job();
        });
        let Ok(mut jobs) = self.jobs.lock() else {
            return;
        };
        let owned = jobs.entry(id).or_default();
        owned.retain(|h| !h.is_finished());
        owned.push(task.abort_handle());
    }

    fn remove_jobs(&self, id: MountId) {
        let removed = match self.jobs.lock() {
            Ok(mut jobs) => jobs.remove(&id),
            Err(_) => None,
        };
        for handle in removed.into_iter().flatten() {
            handle.abort();
        }
    }

    fn stop(&self) {
        let Some(thread) = self.thread.lock().ok().and_then(|mut t| t.take()) else {
            return;
        };
        if let Ok(mut jobs) = self.jobs.lock() {
            for handle in jobs.drain().flat_map(|(_, handles)| handles) {
                handle.abort();
            }
        }
        self.shutdown.notify_one();
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!("timed queue {} thread panicked", self.name);
        }
    }
}

impl Drop for TokioTimedQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
