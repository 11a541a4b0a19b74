//! Talking to a running Tor over its control port.
//!
//! The coordinator only ever sees the [`ControlConnector`] and
//! [`ControlSession`] traits.  [`TcpControlConnector`] and
//! [`ControlConnection`] are the real implementations.

mod conn;
pub(crate) mod proto;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use retry_error::RetryError;
use tor_rtcompat::SleepProvider;
use tracing::{debug, trace, warn};

use crate::err::ControlError;
use crate::event::ControlEvent;

pub use conn::{ControlConnection, TcpControlConnector};

/// Length in bytes of the cookie Tor writes for control-port authentication.
pub const COOKIE_LEN: usize = 32;

/// A callback that receives events from a control session.
///
/// Returns true if it handled the event.
pub type EventObserver = Box<dyn FnMut(&ControlEvent) -> bool + Send + 'static>;

/// Opaque identifier for an [`EventObserver`] registered on a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObserverHandle(u64);

/// An open connection to Tor's control port.
#[async_trait]
pub trait ControlSession: Send + Sync + 'static {
    /// Present `cookie` to Tor.
    ///
    /// Returns `Ok(false)` if Tor rejected it.
    async fn authenticate(&self, cookie: &[u8]) -> Result<bool, ControlError>;

    /// Ask Tor to send us the named asynchronous events.
    async fn set_events(&self, events: &[&str]) -> Result<(), ControlError>;

    /// Change one of Tor's configuration options.
    async fn set_conf(&self, key: &str, value: &str) -> Result<(), ControlError>;

    /// Look up one or more `GETINFO` keys.
    async fn get_info(&self, keys: &[&str]) -> Result<HashMap<String, String>, ControlError>;

    /// Register a callback for asynchronous events.
    fn add_observer(&self, observer: EventObserver) -> ObserverHandle;

    /// Unregister all of `handles` at once.
    fn remove_observers(&self, handles: &[ObserverHandle]);

    /// Return true if the session is still open.
    fn is_connected(&self) -> bool;

    /// Close the session.  Does nothing if it is already closed.
    async fn disconnect(&self);
}

/// Something that can open a [`ControlSession`].
#[async_trait]
pub trait ControlConnector: Send + Sync + 'static {
    /// Open a session to the control port at `addr`.
    async fn connect(&self, addr: SocketAddr) -> io::Result<Arc<dyn ControlSession>>;
}

/// The observers registered on one session.
#[derive(Default)]
pub(crate) struct ObserverList {
    /// Next handle to give out.
    next: u64,
    /// Registered observers in registration order.
    entries: Vec<(ObserverHandle, EventObserver)>,
}

impl ObserverList {
    /// Add an observer.
    pub(crate) fn add(&mut self, observer: EventObserver) -> ObserverHandle {
        let handle = ObserverHandle(self.next);
        self.next += 1;
        self.entries.push((handle, observer));
        handle
    }

    /// Remove every observer in `handles`.
    pub(crate) fn remove(&mut self, handles: &[ObserverHandle]) {
        self.entries.retain(|(h, _)| !handles.contains(h));
    }

    /// Give `event` to every observer.  Returns true if any of them handled it.
    pub(crate) fn dispatch(&mut self, event: &ControlEvent) -> bool {
        let mut handled = false;
        for (_, observer) in &mut self.entries {
            handled |= observer(event);
        }
        handled
    }

    /// Return the number of registered observers.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A single failed attempt to reach the control port.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct ConnectAttempt(io::Error);

impl AsRef<dyn std::error::Error + 'static> for ConnectAttempt {
    fn as_ref(&self) -> &(dyn std::error::Error + 'static) {
        self
    }
}

/// Open a control session, retrying up to `retries` times on failure.
///
/// Makes `retries + 1` attempts in total, sleeping `delay` between them.
/// On failure, returns the error from the last attempt.
pub(crate) async fn connect_with_retry<R: SleepProvider>(
    runtime: &R,
    connector: &dyn ControlConnector,
    addr: SocketAddr,
    retries: u32,
    delay: Duration,
) -> io::Result<Arc<dyn ControlSession>> {
    let mut errors = RetryError::in_attempt_to(format!("connect to Tor control port {}", addr));
    for attempt in 0..=retries {
        if attempt > 0 {
            runtime.sleep(delay).await;
        }
        match connector.connect(addr).await {
            Ok(session) => {
                debug!("Connected to Tor control port {} (attempt {})", addr, attempt + 1);
                return Ok(session);
            }
            Err(e) => {
                trace!("Control port attempt {} failed: {}", attempt + 1, e);
                errors.push(ConnectAttempt(e));
            }
        }
    }
    warn!("{}", errors);
    Err(errors
        .into_iter()
        .last()
        .map(|ConnectAttempt(e)| e)
        .unwrap_or_else(|| io::Error::other("no connection attempts were made")))
}

/// Read Tor's authentication cookie from `path`, retrying while it is
/// missing or incomplete.
pub(crate) async fn fetch_cookie<R: SleepProvider>(
    runtime: &R,
    path: &Path,
    retries: u32,
    delay: Duration,
) -> io::Result<Vec<u8>> {
    fetch_cookie_with(runtime, retries, delay, || read_cookie(path)).await
}

/// As [`fetch_cookie`], but with the read operation supplied by the caller.
async fn fetch_cookie_with<R, F>(
    runtime: &R,
    retries: u32,
    delay: Duration,
    mut read: F,
) -> io::Result<Vec<u8>>
where
    R: SleepProvider,
    F: FnMut() -> io::Result<Vec<u8>>,
{
    let mut last_error = None;
    for attempt in 0..=retries {
        if attempt > 0 {
            runtime.sleep(delay).await;
        }
        match read() {
            Ok(cookie) => return Ok(cookie),
            Err(e) => {
                trace!("Cookie not ready (attempt {}): {}", attempt + 1, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| io::Error::other("no cookie reads were attempted")))
}

/// Read a cookie file and check its length.
fn read_cookie(path: &Path) -> io::Result<Vec<u8>> {
    let cookie = std::fs::read(path)?;
    if cookie.len() != COOKIE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{} has {} bytes, expected {}",
                path.display(),
                cookie.len(),
                COOKIE_LEN
            ),
        ));
    }
    Ok(cookie)
}
