//! # Scheduler Identity
//!
//! Cooperative connections are registered with the reactor of the runtime
//! that opened them and must not migrate to another runtime. A [`Scheduler`]
//! is the explicit identity of one such runtime: create one per runtime and
//! hand it to [`crate::Client::cooperative`].
//!
//! Pools keyed by a scheduler are reclaimed when the last handle to it is
//! dropped. Observers registered through [`Scheduler::observe`] are notified
//! synchronously from the final drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ckv_common::SchedulerId;
use parking_lot::Mutex;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// Notified when a scheduler's last handle goes away.
pub trait SchedulerObserver: Send + Sync {
    fn scheduler_retired(&self, id: SchedulerId);
}

struct SchedulerInner {
    id: SchedulerId,
    observers: Mutex<Vec<Weak<dyn SchedulerObserver>>>,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        for observer in self.observers.get_mut().drain(..) {
            if let Some(observer) = observer.upgrade() {
                observer.scheduler_retired(self.id);
            }
        }
    }
}

/// Identity of one cooperative scheduler (one async runtime).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                id: SchedulerId(NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed)),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> SchedulerId {
        self.inner.id
    }

    /// Registers an observer for retirement of this scheduler.
    pub fn observe(&self, observer: Weak<dyn SchedulerObserver>) {
        let mut observers = self.inner.observers.lock();
        observers.retain(|o| o.strong_count() > 0);
        if !observers.iter().any(|o| o.ptr_eq(&observer)) {
            observers.push(observer);
        }
    }

    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Scheduler").field(&self.inner.id).finish()
    }
}

/// Non-owning reference to a scheduler.
#[derive(Clone)]
pub struct WeakScheduler {
    id: SchedulerId,
    inner: Weak<SchedulerInner>,
}

impl WeakScheduler {
    pub fn id(&self) -> SchedulerId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    impl SchedulerObserver for Counter {
        fn scheduler_retired(&self, _id: SchedulerId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(Scheduler::new().id(), Scheduler::new().id());
    }

    #[test]
    fn observer_fires_once_on_last_drop() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let observer: Arc<dyn SchedulerObserver> = counter.clone();
        let scheduler = Scheduler::new();
        scheduler.observe(Arc::downgrade(&observer));
        scheduler.observe(Arc::downgrade(&observer));
        let weak = scheduler.downgrade();
        let clone = scheduler.clone();

        drop(scheduler);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        assert!(weak.is_alive());

        drop(clone);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(!weak.is_alive());
    }
}
