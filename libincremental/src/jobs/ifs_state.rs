use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use crate::types::{IfsState, StorageId};

/// Mount state predicate. Returning `false` drops the callback.
pub type IfsStateCallback = Box<dyn FnMut(StorageId, IfsState) -> bool + Send + 'static>;

/// Callbacks evaluated against the state of their storage on every tick of
/// one shared periodic job.
#[derive(Default)]
pub struct IfsStateCallbacks {
    inner: Mutex<Registered>,
}

#[derive(Default)]
struct Registered {
    callbacks: BTreeMap<StorageId, Vec<IfsStateCallback>>,
    // a tick is pending or running
    driving: bool,
}

impl IfsStateCallbacks {
    fn lock(&self) -> MutexGuard<'_, Registered> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a callback. Returns `true` when no tick is pending, meaning the
    /// caller has to schedule the driving job.
    pub fn add(&self, storage: StorageId, callback: IfsStateCallback) -> bool {
        let mut inner = self.lock();
        inner.callbacks.entry(storage).or_default().push(callback);
        !std::mem::replace(&mut inner.driving, true)
    }

    pub fn remove(&self, storage: StorageId) {
        self.lock().callbacks.remove(&storage);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().callbacks.is_empty()
    }

    /// Runs one tick. `state_of` is evaluated once per storage, outside the
    /// lock, so callbacks may register new callbacks. Returns `true` while
    /// callbacks remain and the driver must reschedule itself; otherwise the
    /// next [`add`](Self::add) asks for a new driver.
    pub fn process(&self, mut state_of: impl FnMut(StorageId) -> IfsState) -> bool {
        let mut last: Option<StorageId> = None;
        loop {
            let (storage, mut local) = {
                let mut inner = self.lock();
                if inner.callbacks.is_empty() {
                    inner.driving = false;
                    return false;
                }
                let lower = match last {
                    None => Bound::Unbounded,
                    Some(id) => Bound::Excluded(id),
                };
                let Some((&storage, queued)) =
                    inner.callbacks.range_mut((lower, Bound::Unbounded)).next()
                else {
                    break;
                };
                (storage, std::mem::take(queued))
            };
            last = Some(storage);

            let state = state_of(storage);
            local.retain_mut(|callback| callback(storage, state));

            let mut inner = self.lock();
            let queued = inner.callbacks.entry(storage).or_default();
            // callbacks added while this storage was processed go after the survivors
            let added = std::mem::take(queued);
            local.extend(added);
            if local.is_empty() {
                inner.callbacks.remove(&storage);
            } else {
                *queued = local;
            }
        }
        let mut inner = self.lock();
        inner.driving = !inner.callbacks.is_empty();
        inner.driving
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loaded(fully_loaded: bool) -> IfsState {
        IfsState {
            fully_loaded,
            ..Default::default()
        }
    }

    #[test]
    fn first_add_requests_driver() {
        let registry = IfsStateCallbacks::default();
        assert!(registry.add(1, Box::new(|_, _| true)));
        assert!(!registry.add(2, Box::new(|_, _| true)));
        registry.remove(1);
        registry.remove(2);
        assert!(registry.is_empty());
        // the pending tick still runs and picks this one up
        assert!(!registry.add(3, Box::new(|_, _| true)));
        registry.remove(3);
        assert!(!registry.process(|_| IfsState::default()));
        assert!(registry.add(4, Box::new(|_, _| true)));
    }

    #[test]
    fn one_driver_across_threads() {
        let registry = Arc::new(IfsStateCallbacks::default());
        registry.add(1, Box::new(|_, _| false));
        let drivers = Arc::new(AtomicUsize::new(0));
        let adders: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                let drivers = drivers.clone();
                std::thread::spawn(move || {
                    if registry.add(10 + i, Box::new(|_, _| true)) {
                        drivers.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        let rescheduled = registry.process(|_| IfsState::default());
        for adder in adders {
            adder.join().unwrap();
        }
        // either the running tick keeps going or exactly one adder restarts it
        let restarted = drivers.load(Ordering::SeqCst);
        assert!(restarted <= 1);
        assert_eq!(usize::from(rescheduled) + restarted, 1);
    }

    #[test]
    fn callbacks_are_dropped_when_they_return_false() {
        let registry = IfsStateCallbacks::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        registry.add(
            5,
            Box::new(move |id, state| {
                assert_eq!(id, 5);
                counted.fetch_add(1, Ordering::SeqCst);
                !state.fully_loaded
            }),
        );

        assert!(registry.process(|_| loaded(false)));
        assert!(!registry.process(|_| loaded(true)));
        assert!(registry.is_empty());
        assert!(!registry.process(|_| loaded(true)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn state_is_evaluated_once_per_storage() {
        let registry = IfsStateCallbacks::default();
        for storage in [1, 1, 2, 3] {
            registry.add(storage, Box::new(|_, _| true));
        }
        let mut evaluated = Vec::new();
        assert!(registry.process(|id| {
            evaluated.push(id);
            IfsState::default()
        }));
        assert_eq!(evaluated, vec![1, 2, 3]);
    }
}
