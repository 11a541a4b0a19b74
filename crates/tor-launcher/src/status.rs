//! Connection status, and telling other code when it changes.

use std::fmt;
use std::sync::Mutex;

use educe::Educe;
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use postage::watch;
use tracing::{debug, info};

use crate::err::TorError;

/// How far along we are in getting a usable Tor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// Tor is not running, or we are not talking to it.
    Disconnected,
    /// We are launching Tor and trying to reach it.
    Connecting,
    /// We are authenticated to Tor, which is bootstrapping.
    PortsOpen,
    /// Tor has built a circuit; traffic can flow.
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::PortsOpen => "ports open",
            ConnectionStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Where a bootstrap attempt stands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BootstrapState {
    /// No bootstrap is being observed.
    NotStarted,
    /// We are authenticated and waiting for 100%.
    InProgress,
    /// Tor reported 100%.
    Finished,
}

/// A change reported by a [`TorManager`](crate::TorManager).
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum TorEvent {
    /// The connection status changed.
    Status(ConnectionStatus),
    /// Tor reported a new bootstrap percentage.
    Progress(u8),
    /// An attempt to start Tor failed.
    Error(TorError),
}

/// A stream of [`ConnectionStatus`] values.
///
/// Yields the current status, then each change.  Slow readers only see the
/// latest value; use [`TorEvents`] to see every transition.
#[derive(Clone, Educe)]
#[educe(Debug)]
pub struct ConnectionStatusEvents {
    /// The receiver that implements this stream.
    #[educe(Debug(ignore))]
    inner: watch::Receiver<ConnectionStatus>,
}

impl Stream for ConnectionStatusEvents {
    type Item = ConnectionStatus;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// A stream of every [`TorEvent`], in order.
#[derive(Educe)]
#[educe(Debug)]
pub struct TorEvents {
    /// The receiver that implements this stream.
    #[educe(Debug(ignore))]
    inner: mpsc::UnboundedReceiver<TorEvent>,
}

impl Stream for TorEvents {
    type Item = TorEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// The mutable part of a [`StatusBoard`].
struct BoardInner {
    /// Incremented whenever the current session is torn down.
    ///
    /// Updates tagged with an older epoch are ignored.
    epoch: u64,
    /// Current status.
    status: ConnectionStatus,
    /// Last bootstrap percentage reported.
    progress: u8,
    /// Current bootstrap state.
    bootstrap: BootstrapState,
    /// Latest-value channel for the status.
    status_tx: watch::Sender<ConnectionStatus>,
    /// Latest-value channel for the bootstrap state.
    bootstrap_tx: watch::Sender<BootstrapState>,
    /// Subscribers to the full event stream.
    subscribers: Vec<mpsc::UnboundedSender<TorEvent>>,
}

impl BoardInner {
    /// Send `event` to every live subscriber, forgetting the ones that went away.
    fn emit(&mut self, event: &TorEvent) {
        self.subscribers
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    /// Change the status, announcing it if it differs.
    fn change_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        info!("Tor status: {}", status);
        self.status = status;
        *self.status_tx.borrow_mut() = status;
        self.emit(&TorEvent::Status(status));
    }

    /// Change the bootstrap state.
    fn change_bootstrap(&mut self, state: BootstrapState) {
        if self.bootstrap == state {
            return;
        }
        debug!("Bootstrap state: {:?}", state);
        self.bootstrap = state;
        *self.bootstrap_tx.borrow_mut() = state;
    }
}

/// The single owner of a manager's observable state.
///
/// Every mutation takes the epoch of the session making it, so that a
/// session that has been torn down cannot change anything.
pub(crate) struct StatusBoard {
    /// The state itself.
    inner: Mutex<BoardInner>,
    /// Receiver we clone for status watchers.
    status_rx: watch::Receiver<ConnectionStatus>,
    /// Receiver we clone for bootstrap watchers.
    bootstrap_rx: watch::Receiver<BootstrapState>,
}

impl StatusBoard {
    /// Return a board in the `Disconnected` state.
    pub(crate) fn new() -> Self {
        let (status_tx, status_rx) = watch::channel_with(ConnectionStatus::Disconnected);
        let (bootstrap_tx, bootstrap_rx) = watch::channel_with(BootstrapState::NotStarted);
        StatusBoard {
            inner: Mutex::new(BoardInner {
                epoch: 0,
                status: ConnectionStatus::Disconnected,
                progress: 0,
                bootstrap: BootstrapState::NotStarted,
                status_tx,
                bootstrap_tx,
                subscribers: Vec::new(),
            }),
            status_rx,
            bootstrap_rx,
        }
    }

    /// Lock the state.
    fn lock(&self) -> std::sync::MutexGuard<'_, BoardInner> {
        self.inner.lock().expect("status board lock poisoned")
    }

    /// Run `f` on the state if `epoch` is current.  Returns false if it is stale.
    fn update(&self, epoch: u64, f: impl FnOnce(&mut BoardInner)) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        f(&mut inner);
        true
    }

    /// The epoch of the current session.
    pub(crate) fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Return true if `epoch` is still the current one.
    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    /// Current status.
    pub(crate) fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    /// Last bootstrap percentage.
    pub(crate) fn progress(&self) -> u8 {
        self.lock().progress
    }

    /// Current bootstrap state.
    pub(crate) fn bootstrap(&self) -> BootstrapState {
        self.lock().bootstrap
    }

    /// Set the status, if `epoch` is current.
    pub(crate) fn set_status(&self, epoch: u64, status: ConnectionStatus) -> bool {
        self.update(epoch, |inner| inner.change_status(status))
    }

    /// Record that we are authenticated and bootstrapping.
    pub(crate) fn begin_bootstrap(&self, epoch: u64) -> bool {
        self.update(epoch, |inner| {
            inner.change_status(ConnectionStatus::PortsOpen);
            inner.change_bootstrap(BootstrapState::InProgress);
        })
    }

    /// Set the bootstrap state, if `epoch` is current.
    pub(crate) fn set_bootstrap(&self, epoch: u64, state: BootstrapState) -> bool {
        self.update(epoch, |inner| inner.change_bootstrap(state))
    }

    /// Record a bootstrap percentage.
    ///
    /// Repeats of the current value are not announced.  Lower values are:
    /// Tor only reports a decrease when something really went backwards.
    pub(crate) fn set_progress(&self, epoch: u64, progress: u8) -> bool {
        self.update(epoch, |inner| {
            if inner.progress == progress {
                return;
            }
            debug!("Tor bootstrap at {}%", progress);
            inner.progress = progress;
            inner.emit(&TorEvent::Progress(progress));
        })
    }

    /// Announce a failed start.
    pub(crate) fn publish_error(&self, error: TorError) {
        self.lock().emit(&TorEvent::Error(error));
    }

    /// Start a new epoch.  Updates from the old one are ignored from now on.
    pub(crate) fn retire(&self) -> u64 {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.epoch
    }

    /// Go back to `Disconnected` with no progress.
    pub(crate) fn clear(&self) {
        let mut inner = self.lock();
        if inner.progress != 0 {
            inner.progress = 0;
            inner.emit(&TorEvent::Progress(0));
        }
        inner.change_bootstrap(BootstrapState::NotStarted);
        inner.change_status(ConnectionStatus::Disconnected);
    }

    /// Subscribe to every future event.
    pub(crate) fn subscribe(&self) -> TorEvents {
        let (tx, rx) = mpsc::unbounded();
        self.lock().subscribers.push(tx);
        TorEvents { inner: rx }
    }

    /// Return a stream of status values.
    pub(crate) fn status_events(&self) -> ConnectionStatusEvents {
        ConnectionStatusEvents {
            inner: self.status_rx.clone(),
        }
    }

    /// Wait until the status satisfies `pred`.
    pub(crate) async fn wait_for_status(&self, pred: impl Fn(ConnectionStatus) -> bool) {
        let mut rx = self.status_rx.clone();
        if pred(self.status()) {
            return;
        }
        while let Some(status) = rx.next().await {
            if pred(status) {
                return;
            }
        }
    }

    /// Wait until no bootstrap is in progress.
    pub(crate) async fn wait_while_bootstrapping(&self) {
        let mut rx = self.bootstrap_rx.clone();
        if self.bootstrap() != BootstrapState::InProgress {
            return;
        }
        while let Some(state) = rx.next().await {
            if state != BootstrapState::InProgress {
                return;
            }
        }
    }
}
