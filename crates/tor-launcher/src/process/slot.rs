//! Making sure only one Tor runs at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tor_rtcompat::SleepProvider;
use tracing::{debug, info};

/// The right to run a Tor process.
///
/// Two Tor instances sharing a data directory would fight over it, so every
/// manager that uses the same data directory should share one slot.
/// Clones of a `ProcessSlot` refer to the same slot.
#[derive(Clone, Debug, Default)]
pub struct ProcessSlot {
    /// True while a [`SlotGuard`] exists.
    held: Arc<AtomicBool>,
}

/// Proof that we hold a [`ProcessSlot`].  Dropping it frees the slot.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct SlotGuard {
    /// The flag to clear on drop.
    held: Arc<AtomicBool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
        debug!("Released Tor process slot");
    }
}

impl ProcessSlot {
    /// Return a new, free slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return true if someone holds this slot.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Take the slot if it is free.
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SlotGuard {
                held: Arc::clone(&self.held),
            })
    }

    /// Wait until the slot is free and take it, checking every `poll`.
    pub async fn acquire<R: SleepProvider>(&self, runtime: &R, poll: Duration) -> SlotGuard {
        loop {
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            runtime.sleep(poll).await;
        }
    }

    /// As [`acquire`](Self::acquire), but give up (returning `None`) once
    /// `keep_waiting` returns false.
    pub(crate) async fn acquire_while<R, F>(
        &self,
        runtime: &R,
        poll: Duration,
        keep_waiting: F,
    ) -> Option<SlotGuard>
    where
        R: SleepProvider,
        F: Fn() -> bool,
    {
        let mut logged = false;
        loop {
            if !keep_waiting() {
                return None;
            }
            if let Some(guard) = self.try_acquire() {
                return Some(guard);
            }
            if !logged {
                info!("Another Tor process is still running; waiting for it to exit");
                logged = true;
            }
            runtime.sleep(poll).await;
        }
    }
}
