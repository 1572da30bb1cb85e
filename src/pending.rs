//! Tracking of submissions whose delivery outcome has not arrived yet.
//!
//! The submission path registers an entry before handing a submission to
//! the transport and marks it accepted once the transport takes it; the
//! delivery observer resolves it. Only accepted, unresolved entries are
//! counted. A report can overtake the acceptance mark (the transport may
//! report from inside `submit`), in which case the entry is already gone
//! and the mark is a no-op.
//!
//! [`PendingSet::resolve`] hands the entry out behind a [`Resolved`] guard;
//! the count only drops when the guard does, so a drain never returns
//! before the observer has finished reporting the outcome.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

struct Slot<T> {
    value: T,
    accepted: bool,
}

pub struct PendingSet<T> {
    entries: Mutex<HashMap<u64, Slot<T>>>,
    count: watch::Sender<usize>,
}

impl<T> Default for PendingSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingSet<T> {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            entries: Mutex::new(HashMap::new()),
            count,
        }
    }

    /// Tracks `seq` without counting it yet.
    pub fn register(&self, seq: u64, value: T) {
        self.lock().insert(
            seq,
            Slot {
                value,
                accepted: false,
            },
        );
    }

    /// Like [`register`](Self::register), but the entry is abandoned when the
    /// returned guard drops without [`Registration::accept`].
    pub fn track(&self, seq: u64, value: T) -> Registration<'_, T> {
        self.register(seq, value);
        Registration {
            set: self,
            seq,
            armed: true,
        }
    }

    /// Counts `seq` as in flight. Returns false if it was already resolved.
    pub fn mark_accepted(&self, seq: u64) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(&seq) {
            Some(slot) if !slot.accepted => {
                slot.accepted = true;
                self.count.send_modify(|count| *count += 1);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Removes `seq` because its outcome arrived.
    pub fn resolve(&self, seq: u64) -> Option<Resolved<'_, T>> {
        let slot = self.lock().remove(&seq)?;
        Some(Resolved {
            set: self,
            value: slot.value,
            counted: slot.accepted,
        })
    }

    /// Removes `seq` because it never reached the transport.
    pub fn abandon(&self, seq: u64) -> Option<T> {
        let mut entries = self.lock();
        let slot = entries.remove(&seq)?;
        if slot.accepted {
            self.count.send_modify(|count| *count = count.saturating_sub(1));
        }
        Some(slot.value)
    }

    /// Entries held, accepted or not.
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    /// Accepted submissions still waiting for an outcome.
    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until nothing is in flight or `timeout` elapses, returning what
    /// is still in flight.
    pub async fn wait_empty(&self, timeout: Duration) -> usize {
        let mut rx = self.count.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|count| *count == 0)).await;
        self.len()
    }

    /// Drops every entry, returning them.
    pub fn clear(&self) -> Vec<(u64, T)> {
        let mut entries = self.lock();
        self.count.send_replace(0);
        entries.drain().map(|(seq, slot)| (seq, slot.value)).collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Slot<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered entry on its way to the transport.
pub struct Registration<'a, T> {
    set: &'a PendingSet<T>,
    seq: u64,
    armed: bool,
}

impl<T> Registration<'_, T> {
    /// The transport took the submission; see [`PendingSet::mark_accepted`].
    pub fn accept(mut self) -> bool {
        self.armed = false;
        self.set.mark_accepted(self.seq)
    }

    /// The transport refused the submission.
    pub fn abandon(mut self) -> Option<T> {
        self.armed = false;
        self.set.abandon(self.seq)
    }
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.set.abandon(self.seq);
        }
    }
}

/// A resolved entry; still counted as pending until dropped.
pub struct Resolved<'a, T> {
    set: &'a PendingSet<T>,
    value: T,
    counted: bool,
}

impl<T> Deref for Resolved<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Resolved<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for Resolved<'_, T> {
    fn drop(&mut self) {
        if self.counted {
            self.set.count.send_modify(|count| *count = count.saturating_sub(1));
        }
    }
}
