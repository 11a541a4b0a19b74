//! Fake implementations of our seams, for tests.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::control::{
    COOKIE_LEN, ControlConnector, ControlSession, EventObserver, ObserverHandle, ObserverList,
};
use crate::err::{ControlError, LaunchError};
use crate::event::ControlEvent;
use crate::process::{ProcessHandle, TorLauncher};
use crate::torrc::{Ipv6Capability, Ipv6Probe, TorConfiguration};

/// What a [`FakeSession`] has been asked to do, and how it should answer.
#[derive(Default)]
struct SessionState {
    /// Cookies presented to `authenticate`.
    cookies: Vec<Vec<u8>>,
    /// `SETEVENTS` requests.
    events: Vec<Vec<String>>,
    /// `SETCONF` requests.
    confs: Vec<(String, String)>,
    /// Answers for `GETINFO`.
    info: HashMap<String, String>,
    /// If true, reject every cookie.
    reject_auth: bool,
    /// If true, fail `SETEVENTS`.
    fail_set_events: bool,
    /// Number of `disconnect` calls that did something.
    disconnects: usize,
}

/// A [`ControlSession`] that records what it was asked.
pub(crate) struct FakeSession {
    /// Recorded requests and canned answers.
    state: Mutex<SessionState>,
    /// Registered observers.
    observers: Mutex<ObserverList>,
    /// Whether we are "connected".
    connected: AtomicBool,
}

impl FakeSession {
    /// A connected session that accepts everything.
    pub(crate) fn new() -> Self {
        FakeSession {
            state: Mutex::default(),
            observers: Mutex::default(),
            connected: AtomicBool::new(true),
        }
    }

    /// Lock the state.
    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("poisoned")
    }

    /// Reject every authentication attempt from now on.
    pub(crate) fn reject_auth(&self) {
        self.state().reject_auth = true;
    }

    /// Fail `SETEVENTS` from now on.
    pub(crate) fn fail_set_events(&self) {
        self.state().fail_set_events = true;
    }

    /// Answer `GETINFO key` with `value`.
    pub(crate) fn set_info(&self, key: &str, value: &str) {
        self.state().info.insert(key.into(), value.into());
    }

    /// Deliver an asynchronous event, as the reader task would.
    pub(crate) fn emit(&self, text: &str) -> bool {
        let event = ControlEvent::parse(text);
        self.observers.lock().expect("poisoned").dispatch(&event)
    }

    /// Every `SETCONF` so far.
    pub(crate) fn confs(&self) -> Vec<(String, String)> {
        self.state().confs.clone()
    }

    /// Every `SETEVENTS` so far.
    pub(crate) fn events_requested(&self) -> Vec<Vec<String>> {
        self.state().events.clone()
    }

    /// Every cookie presented so far.
    pub(crate) fn cookies(&self) -> Vec<Vec<u8>> {
        self.state().cookies.clone()
    }

    /// How many times we were disconnected.
    pub(crate) fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    /// Number of registered observers.
    pub(crate) fn observer_count(&self) -> usize {
        self.observers.lock().expect("poisoned").len()
    }

    /// Fail if we're closed.
    fn check_open(&self) -> Result<(), ControlError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ControlError::Closed)
        }
    }
}

#[async_trait]
impl ControlSession for FakeSession {
    async fn authenticate(&self, cookie: &[u8]) -> Result<bool, ControlError> {
        self.check_open()?;
        let mut st = self.state();
        st.cookies.push(cookie.to_vec());
        Ok(!st.reject_auth)
    }

    async fn set_events(&self, events: &[&str]) -> Result<(), ControlError> {
        self.check_open()?;
        let mut st = self.state();
        st.events
            .push(events.iter().map(|e| (*e).to_owned()).collect());
        if st.fail_set_events {
            return Err(ControlError::Rejected {
                command: "SETEVENTS".into(),
                code: 552,
                message: "Unrecognized event".into(),
            });
        }
        Ok(())
    }

    async fn set_conf(&self, key: &str, value: &str) -> Result<(), ControlError> {
        self.check_open()?;
        self.state().confs.push((key.into(), value.into()));
        Ok(())
    }

    async fn get_info(&self, keys: &[&str]) -> Result<HashMap<String, String>, ControlError> {
        self.check_open()?;
        let st = self.state();
        Ok(keys
            .iter()
            .filter_map(|k| st.info.get(*k).map(|v| ((*k).to_owned(), v.clone())))
            .collect())
    }

    fn add_observer(&self, observer: EventObserver) -> ObserverHandle {
        self.observers.lock().expect("poisoned").add(observer)
    }

    fn remove_observers(&self, handles: &[ObserverHandle]) {
        self.observers.lock().expect("poisoned").remove(handles);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.state().disconnects += 1;
        }
    }
}

/// A [`ControlConnector`] that refuses some connections, then hands out a
/// [`FakeSession`].
pub(crate) struct FakeConnector {
    /// How many attempts to refuse before succeeding.
    refuse_first: usize,
    /// Attempts so far.
    attempts: AtomicUsize,
    /// The session to return.
    session: Arc<FakeSession>,
}

impl FakeConnector {
    /// A connector that refuses the first `n` attempts.
    pub(crate) fn refusing_first(n: usize) -> Self {
        FakeConnector {
            refuse_first: n,
            attempts: AtomicUsize::new(0),
            session: Arc::new(FakeSession::new()),
        }
    }

    /// A connector that refuses every attempt.
    pub(crate) fn refusing() -> Self {
        Self::refusing_first(usize::MAX)
    }

    /// A connector that always succeeds, returning `session`.
    pub(crate) fn with_session(session: Arc<FakeSession>) -> Self {
        FakeConnector {
            session,
            ..Self::refusing_first(0)
        }
    }

    /// Number of connection attempts so far.
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlConnector for FakeConnector {
    async fn connect(&self, _addr: SocketAddr) -> io::Result<Arc<dyn ControlSession>> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if n < self.refuse_first {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        Ok(Arc::clone(&self.session) as Arc<dyn ControlSession>)
    }
}

/// Shared state of a [`FakeLauncher`].
#[derive(Default)]
struct LauncherState {
    /// Number of live fake processes.
    live: Arc<AtomicUsize>,
    /// Number of times tor was launched.
    launches: AtomicUsize,
    /// Fail to launch tor.
    fail_tor: AtomicBool,
    /// Fail to launch the helper.
    fail_pt: AtomicBool,
    /// Write a cookie file when launching tor.
    write_cookie: AtomicBool,
    /// Arguments of the last tor launch.
    last_args: Mutex<Vec<String>>,
}

/// A [`TorLauncher`] that starts nothing.
#[derive(Clone, Default)]
pub(crate) struct FakeLauncher {
    /// Shared state.
    state: Arc<LauncherState>,
}

impl FakeLauncher {
    /// A launcher whose launches succeed.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Like `new`, but "tor" also writes a valid cookie file.
    pub(crate) fn writing_cookie() -> Self {
        let l = Self::new();
        l.state.write_cookie.store(true, Ordering::SeqCst);
        l
    }

    /// Fail tor launches from now on.
    pub(crate) fn fail_tor(&self) {
        self.state.fail_tor.store(true, Ordering::SeqCst);
    }

    /// Fail helper launches from now on.
    pub(crate) fn fail_pt_helper(&self) {
        self.state.fail_pt.store(true, Ordering::SeqCst);
    }

    /// Number of fake processes currently running.
    pub(crate) fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Number of tor launches so far.
    pub(crate) fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    /// Arguments of the most recent tor launch.
    pub(crate) fn last_args(&self) -> Vec<String> {
        self.state.last_args.lock().expect("poisoned").clone()
    }
}

impl TorLauncher for FakeLauncher {
    fn launch_tor(&self, configuration: &TorConfiguration) -> Result<ProcessHandle, LaunchError> {
        if self.state.fail_tor.load(Ordering::SeqCst) {
            return Err(LaunchError::Spawn {
                what: "tor",
                path: "/nonexistent/tor".into(),
                error: Arc::new(io::ErrorKind::NotFound.into()),
            });
        }
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        *self.state.last_args.lock().expect("poisoned") = configuration.args().to_vec();
        if self.state.write_cookie.load(Ordering::SeqCst) {
            std::fs::write(configuration.dirs().cookie_path(), [0x5a; COOKIE_LEN])
                .expect("write cookie");
        }
        Ok(ProcessHandle::fake("tor", Arc::clone(&self.state.live)))
    }

    fn launch_pt_helper(
        &self,
        _configuration: &TorConfiguration,
    ) -> Result<Option<ProcessHandle>, LaunchError> {
        if self.state.fail_pt.load(Ordering::SeqCst) {
            return Err(LaunchError::StdioUnavailable("pluggable transport"));
        }
        Ok(Some(ProcessHandle::fake(
            "pluggable transport",
            Arc::clone(&self.state.live),
        )))
    }
}

/// An [`Ipv6Probe`] with a fixed answer.
pub(crate) struct FixedProbe(pub(crate) Ipv6Capability);

impl Ipv6Probe for FixedProbe {
    fn probe(&self) -> Ipv6Capability {
        self.0
    }
}
