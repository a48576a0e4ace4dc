//! Deferred jobs, the background work queue and the readiness event loop.

pub mod ifs_state;
pub mod looper;
pub mod processor;
pub mod timed_queue;

pub use ifs_state::{IfsStateCallback, IfsStateCallbacks};
pub use looper::{Looper, LooperCallback, PollLooper};
pub use processor::JobProcessor;
pub use timed_queue::{TimedQueue, TokioTimedQueue};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;
