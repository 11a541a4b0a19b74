//! One-shot stall detection for bootstrap.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::oneshot;
use futures::task::{Spawn, SpawnError, SpawnExt};
use futures::future::{self, Either};
use futures::pin_mut;
use tor_error::warn_report;
use tor_rtcompat::SleepProvider;
use tracing::{debug, info, trace};

use crate::control::ControlSession;

/// Shared part of a [`Watchdog`].
#[derive(Default)]
struct Inner {
    /// Set once the watchdog has been cancelled or has fired.
    done: Arc<AtomicBool>,
    /// Dropped (or sent on) to wake the timer task early.
    wake: Mutex<Option<oneshot::Sender<()>>>,
}

/// A timer that runs an action once unless it is cancelled first.
///
/// Handles are cheap to clone.  When the last one is dropped, the watchdog
/// is cancelled.
#[derive(Clone, Default)]
pub(crate) struct Watchdog {
    /// The shared state.
    inner: Arc<Inner>,
}

impl Watchdog {
    /// Return a new watchdog that is not yet armed.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return true if the watchdog has been cancelled or has already fired.
    pub(crate) fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    /// Start the timer: run `action` after `timeout` unless cancelled first.
    ///
    /// Does nothing if the watchdog is already done or already armed.
    pub(crate) fn arm<R, F, Fut>(
        &self,
        runtime: &R,
        timeout: Duration,
        action: F,
    ) -> Result<(), SpawnError>
    where
        R: SleepProvider + Spawn,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_done() {
            debug!("Not arming watchdog: bootstrap already finished");
            return Ok(());
        }
        let (tx, rx) = oneshot::channel::<()>();
        {
            let mut wake = self.inner.wake.lock().expect("watchdog lock poisoned");
            if wake.is_some() {
                return Ok(());
            }
            *wake = Some(tx);
        }

        let done = Arc::clone(&self.inner.done);
        let sleep = runtime.sleep(timeout);
        runtime.spawn(async move {
            pin_mut!(sleep);
            // The receiver finishes both when the sender fires and when it
            // is dropped; either way we are cancelled.
            let expired = match future::select(sleep, rx).await {
                Either::Left(((), _)) => true,
                Either::Right((_, _)) => false,
            };
            if !expired {
                trace!("Watchdog timer task exiting early");
                return;
            }
            if !done.swap(true, Ordering::SeqCst) {
                info!("Tor bootstrap has not finished after {:?}; kicking the network", timeout);
                action().await;
            }
        })
    }

    /// Cancel the watchdog.  Has no effect if it already fired.
    pub(crate) fn cancel(&self) {
        if !self.inner.done.swap(true, Ordering::SeqCst) {
            debug!("Watchdog cancelled");
        }
        // Dropping the sender wakes the timer task.
        self.inner
            .wake
            .lock()
            .expect("watchdog lock poisoned")
            .take();
    }
}

/// Make Tor retry its connections by briefly disabling the network.
pub(crate) async fn kick_network(control: Arc<dyn ControlSession>) {
    for value in ["1", "0"] {
        if let Err(e) = control.set_conf("DisableNetwork", value).await {
            warn_report!(&e, "Unable to set DisableNetwork={} after a stalled bootstrap", value);
            return;
        }
    }
}
