use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::warn;

/// Invoked when the descriptor becomes readable. Returning `false`
/// unregisters the callback.
pub type LooperCallback = Box<dyn FnMut(RawFd) -> bool + Send + 'static>;

/// Readiness loop for descriptors owned elsewhere.
pub trait Looper: Send + Sync {
    /// Registers `callback` for `fd`, replacing any earlier one.
    fn add_fd(&self, fd: RawFd, callback: LooperCallback);

    fn remove_fd(&self, fd: RawFd) -> bool;

    /// Interrupts a blocked [`Looper::poll_all`].
    fn wake(&self);

    /// Waits for readiness and runs the callbacks. Returns the number run.
    fn poll_all(&self, timeout: Option<Duration>) -> io::Result<usize>;
}

/// [`Looper`] on top of `poll(2)` with a socket pair for wake-ups.
pub struct PollLooper {
    callbacks: Mutex<HashMap<RawFd, LooperCallback>>,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
}

impl PollLooper {
    pub fn new() -> io::Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        Ok(Self {
            callbacks: Mutex::new(HashMap::new()),
            wake_rx,
            wake_tx,
        })
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.wake_rx).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

fn to_poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(t) => u16::try_from(t.as_millis())
            .map(PollTimeout::from)
            .unwrap_or(PollTimeout::MAX),
    }
}

impl Looper for PollLooper {
    fn add_fd(&self, fd: RawFd, callback: LooperCallback) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.insert(fd, callback);
        }
        self.wake();
    }

    fn remove_fd(&self, fd: RawFd) -> bool {
        let removed = self
            .callbacks
            .lock()
            .map(|mut callbacks| callbacks.remove(&fd).is_some())
            .unwrap_or(false);
        if removed {
            self.wake();
        }
        removed
    }

    fn wake(&self) {
        if let Err(e) = (&self.wake_tx).write(&[1]) {
            if e.kind() != ErrorKind::WouldBlock {
                warn!("failed to wake looper: {e}");
            }
        }
    }

    fn poll_all(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let fds: Vec<RawFd> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.keys().copied().collect(),
            Err(_) => return Err(io::Error::other("looper lock poisoned")),
        };
        let ready: Vec<RawFd> = {
            let mut poll_fds = Vec::with_capacity(fds.len() + 1);
            poll_fds.push(PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN));
            for fd in &fds {
                // SAFETY: owners remove a descriptor from the looper before closing it.
                let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                poll_fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
            }
            poll(&mut poll_fds, to_poll_timeout(timeout)).map_err(io::Error::from)?;
            poll_fds
                .iter()
                .skip(1)
                .zip(&fds)
                .filter(|(p, _)| p.revents().is_some_and(|r| !r.is_empty()))
                .map(|(_, fd)| *fd)
                .collect()
        };
        self.drain_wake();

        let mut ran = 0;
        for fd in ready {
            let callback = self
                .callbacks
                .lock()
                .ok()
                .and_then(|mut callbacks| callbacks.remove(&fd));
            let Some(mut callback) = callback else {
                continue;
            };
            ran += 1;
            if callback(fd) {
                if let Ok(mut callbacks) = self.callbacks.lock() {
                    callbacks.entry(fd).or_insert(callback);
                }
            }
        }
        Ok(ran)
    }
}
