//! The lifecycle coordinator: [`TorManager`].

use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::future::{self, Either};
use futures::lock::Mutex as AsyncMutex;
use futures::pin_mut;
use tor_error::warn_report;
use tor_rtcompat::{Runtime, SleepProviderExt};
use tracing::{debug, info};

use crate::config::TorLauncherConfig;
use crate::control::{self, ControlConnector, ControlSession, TcpControlConnector};
use crate::err::{Result, StartError, TorError};
use crate::fs::TorDirs;
use crate::observer::{self, ObserverSet};
use crate::process::{self, CommandLauncher, ProcessSlot, RunningTor, TorLauncher};
use crate::status::{
    BootstrapState, ConnectionStatus, ConnectionStatusEvents, StatusBoard, TorEvents,
};
use crate::torrc::{Ipv6Probe, RouteProbe, TorConfiguration};
use crate::watchdog::{self, Watchdog};

/// Everything that exists while we are attached to a running Tor.
struct Session {
    /// The control connection.
    control: Arc<dyn ControlSession>,
    /// Observers registered on `control`.
    observers: ObserverSet,
    /// The stall watchdog.
    watchdog: Watchdog,
    /// The processes, and our claim on the process slot.
    running: Option<RunningTor>,
}

impl Session {
    /// Stop listening to Tor and close the control connection.
    ///
    /// The processes keep running until the session is dropped.
    async fn detach(&mut self) {
        self.observers.remove_all(&*self.control);
        self.control.disconnect().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.observers.remove_all(&*self.control);
        self.watchdog.cancel();
        if self.running.take().is_some() {
            debug!("Stopped Tor processes");
        }
    }
}

/// A `start()` in progress.
struct StartAttempt {
    /// Board epoch the attempt belongs to.
    epoch: u64,
    /// Dropped to make the attempt give up at once.
    _abort: oneshot::Sender<()>,
}

/// Mutable lifecycle state of a [`TorManager`].
#[derive(Default)]
struct Lifecycle {
    /// The `start()` in progress, if any.
    starting: Option<StartAttempt>,
    /// The current session, if we have one.
    session: Option<Session>,
    /// True once `invalidate()` has been called.
    invalidated: bool,
}

/// Shared part of a [`TorManager`].
struct Inner<R: Runtime> {
    /// Runtime used for sleeping, spawning and connecting.
    runtime: R,
    /// Our configuration.
    config: TorLauncherConfig,
    /// How we start processes.
    launcher: Arc<dyn TorLauncher>,
    /// How we reach the control port.
    connector: Arc<dyn ControlConnector>,
    /// How we decide on an IP policy.
    ipv6_probe: Arc<dyn Ipv6Probe>,
    /// The right to run Tor.
    slot: ProcessSlot,
    /// Observable status.
    board: Arc<StatusBoard>,
    /// Lifecycle state.
    state: Mutex<Lifecycle>,
    /// Held while tearing down, so that `start()` waits for a `stop()` to finish.
    teardown: AsyncMutex<()>,
}

/// Launches Tor, connects to it, and tracks its progress.
///
/// Cheap to clone; clones share the same Tor.  When the last clone is
/// dropped, Tor is stopped.
///
/// # Example
///
/// ```no_run
/// # async fn example<R: tor_rtcompat::Runtime>(runtime: R) -> Result<(), Box<dyn std::error::Error>> {
/// use tor_launcher::{TorLauncherConfig, TorManager};
///
/// let config = TorLauncherConfig::builder()
///     .data_dir("/var/lib/wallet/tor")
///     .build()?;
/// let manager = TorManager::builder(runtime, config).build();
/// manager.start(&["obfs4 192.0.2.3:443 cert=... iat-mode=0"]).await?;
/// manager.wait_until_connected().await;
/// # Ok(())
/// # }
/// ```
pub struct TorManager<R: Runtime> {
    /// The shared state.
    inner: Arc<Inner<R>>,
}

impl<R: Runtime> Clone for TorManager<R> {
    fn clone(&self) -> Self {
        TorManager {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for a [`TorManager`].
///
/// Every collaborator has a default that talks to the real world.
pub struct TorManagerBuilder<R: Runtime> {
    /// Runtime to use.
    runtime: R,
    /// Configuration to use.
    config: TorLauncherConfig,
    /// Process launcher, if not the default.
    launcher: Option<Arc<dyn TorLauncher>>,
    /// Control-port connector, if not the default.
    connector: Option<Arc<dyn ControlConnector>>,
    /// IPv6 probe, if not the default.
    ipv6_probe: Option<Arc<dyn Ipv6Probe>>,
    /// Process slot, if shared with other managers.
    slot: Option<ProcessSlot>,
}

impl<R: Runtime> TorManagerBuilder<R> {
    /// Use `launcher` to start processes, instead of a [`CommandLauncher`].
    pub fn launcher(mut self, launcher: Arc<dyn TorLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Use `connector` to reach the control port, instead of TCP.
    pub fn connector(mut self, connector: Arc<dyn ControlConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use `probe` to decide on an IP policy, instead of a [`RouteProbe`].
    pub fn ipv6_probe(mut self, probe: Arc<dyn Ipv6Probe>) -> Self {
        self.ipv6_probe = Some(probe);
        self
    }

    /// Share `slot` with other managers for the same data directory.
    pub fn process_slot(mut self, slot: ProcessSlot) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Build the manager.  Nothing is started until [`TorManager::start`].
    pub fn build(self) -> TorManager<R> {
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(CommandLauncher::new(&self.config)));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpControlConnector::new(self.runtime.clone())));
        TorManager {
            inner: Arc::new(Inner {
                runtime: self.runtime,
                config: self.config,
                launcher,
                connector,
                ipv6_probe: self.ipv6_probe.unwrap_or_else(|| Arc::new(RouteProbe)),
                slot: self.slot.unwrap_or_default(),
                board: Arc::new(StatusBoard::new()),
                state: Mutex::new(Lifecycle::default()),
                teardown: AsyncMutex::new(()),
            }),
        }
    }
}

impl<R: Runtime> TorManager<R> {
    /// Return a builder for a manager using `runtime` and `config`.
    pub fn builder(runtime: R, config: TorLauncherConfig) -> TorManagerBuilder<R> {
        TorManagerBuilder {
            runtime,
            config,
            launcher: None,
            connector: None,
            ipv6_probe: None,
            slot: None,
        }
    }

    /// Lock the lifecycle state.
    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.inner.state.lock().expect("tor manager lock poisoned")
    }

    /// Launch Tor with `bridges`, connect to it, and start tracking its bootstrap.
    ///
    /// Returns once we are authenticated and listening for events; use
    /// [`wait_until_connected`](Self::wait_until_connected) or the event
    /// streams to follow the rest of the bootstrap.
    ///
    /// Does nothing if a start is already in progress or Tor is already
    /// running.  If [`stop`](Self::stop) is called while this is running,
    /// this returns `Ok(())` without starting anything.
    pub async fn start<S: AsRef<str>>(&self, bridges: &[S]) -> Result<()> {
        let board = &self.inner.board;
        let (abort_tx, abort_rx) = oneshot::channel();
        let epoch = {
            // Wait for any stop() in progress.
            let _teardown = self.inner.teardown.lock().await;
            let mut st = self.lock();
            if st.invalidated {
                drop(st);
                return Err(self.fail(StartError::Invalidated));
            }
            if st.starting.is_some() || st.session.is_some() {
                debug!("Tor is already starting or running");
                return Ok(());
            }
            let epoch = board.epoch();
            st.starting = Some(StartAttempt {
                epoch,
                _abort: abort_tx,
            });
            epoch
        };
        board.set_status(epoch, ConnectionStatus::Connecting);

        // A teardown drops the abort sender; whatever we have built so far
        // (processes, slot, control connection) is dropped with `run`.
        let outcome = {
            let run = self.run_start(epoch, bridges);
            pin_mut!(run);
            match future::select(run, abort_rx).await {
                Either::Left((outcome, _)) => outcome,
                Either::Right(_) => Err(StartError::Superseded),
            }
        };

        let mut stale = {
            let mut st = self.lock();
            if st.starting.as_ref().is_some_and(|a| a.epoch == epoch) {
                st.starting = None;
            }
            match outcome {
                Ok(session) if board.is_current(epoch) => {
                    st.session = Some(session);
                    return Ok(());
                }
                Ok(session) => session,
                Err(StartError::Superseded) => {
                    debug!("Start attempt superseded by stop()");
                    return Ok(());
                }
                Err(_) if !board.is_current(epoch) => return Ok(()),
                Err(e) => return Err(self.fail(e)),
            }
        };
        debug!("Discarding a session started before stop()");
        stale.detach().await;
        Ok(())
    }

    /// Classify `e`, log it and announce it.
    fn fail(&self, e: StartError) -> TorError {
        let e = TorError::from(e);
        warn_report!(&e, "Unable to start Tor");
        self.inner.board.publish_error(e.clone());
        e
    }

    /// Return an error if the start attempt in `epoch` has been superseded.
    fn checkpoint(&self, epoch: u64) -> std::result::Result<(), StartError> {
        if self.inner.board.is_current(epoch) {
            Ok(())
        } else {
            Err(StartError::Superseded)
        }
    }

    /// Do the work of `start()`.
    async fn run_start<S: AsRef<str>>(
        &self,
        epoch: u64,
        bridges: &[S],
    ) -> std::result::Result<Session, StartError> {
        let inner = &*self.inner;
        let config = &inner.config;

        let dirs = TorDirs::new(config.data_dir());
        dirs.ensure_directories(config.permissions())
            .map_err(StartError::Directories)?;
        let ipv6 = inner.ipv6_probe.probe();
        let configuration = TorConfiguration::build(config, &dirs, bridges, ipv6);

        let running = process::spawn_if_needed(
            &inner.runtime,
            &inner.slot,
            &*inner.launcher,
            &configuration,
            config,
            || inner.board.is_current(epoch),
        )
        .await?;

        let control = control::connect_with_retry(
            &inner.runtime,
            &*inner.connector,
            config.control_addr(),
            config.connect_retries,
            config.connect_retry_delay,
        )
        .await
        .map_err(StartError::Connect)?;

        match self.attach(epoch, &control, &dirs).await {
            Ok((observers, watchdog)) => Ok(Session {
                control,
                observers,
                watchdog,
                running: Some(running),
            }),
            Err(e) => {
                control.disconnect().await;
                Err(e)
            }
        }
    }

    /// Authenticate on `control`, then start watching the bootstrap.
    async fn attach(
        &self,
        epoch: u64,
        control: &Arc<dyn ControlSession>,
        dirs: &TorDirs,
    ) -> std::result::Result<(ObserverSet, Watchdog), StartError> {
        let inner = &*self.inner;
        let config = &inner.config;
        self.checkpoint(epoch)?;

        let cookie = control::fetch_cookie(
            &inner.runtime,
            &dirs.cookie_path(),
            config.cookie_retries,
            config.cookie_retry_delay,
        )
        .await
        .map_err(StartError::Cookie)?;
        if !control
            .authenticate(&cookie)
            .await
            .map_err(StartError::Control)?
        {
            return Err(StartError::AuthRejected);
        }
        info!("Authenticated to Tor control port");
        if !inner.board.begin_bootstrap(epoch) {
            return Err(StartError::Superseded);
        }

        // Created first, so that an immediate 100% can cancel it.
        let watchdog = Watchdog::new();
        let mut observers = observer::attach(&**control, &inner.board, epoch, &watchdog)
            .await
            .map_err(StartError::Control)?;

        let kick = Arc::clone(control);
        if let Err(e) = watchdog.arm(&inner.runtime, config.watchdog_timeout, move || {
            watchdog::kick_network(kick)
        }) {
            observers.remove_all(&**control);
            return Err(StartError::Spawn(e));
        }

        observer::replay_current_state(&**control, &inner.board, epoch, &watchdog).await;
        Ok((observers, watchdog))
    }

    /// Stop Tor.
    ///
    /// If Tor is partway through bootstrapping, first waits (up to the
    /// configured `stop_wait_timeout`) for it to finish.  Safe to call in
    /// any state, including while [`start`](Self::start) is running.
    pub async fn stop(&self) {
        let board = &self.inner.board;
        if board.bootstrap() == BootstrapState::InProgress {
            debug!("Waiting for bootstrap to settle before stopping");
            let timeout = self.inner.config.stop_wait_timeout;
            if self
                .inner
                .runtime
                .timeout(timeout, board.wait_while_bootstrapping())
                .await
                .is_err()
            {
                info!("Bootstrap still running after {:?}; stopping anyway", timeout);
            }
        }
        self.teardown().await;
    }

    /// Stop Tor immediately, and refuse to start it again.
    pub async fn invalidate(&self) {
        self.lock().invalidated = true;
        info!("Tor manager invalidated");
        self.teardown().await;
    }

    /// End the current session, if any, and any start in progress.
    async fn teardown(&self) {
        let _teardown = self.inner.teardown.lock().await;
        let board = &self.inner.board;
        let mut session = {
            let mut st = self.lock();
            st.starting = None;
            board.retire();
            st.session.take()
        };
        if let Some(session) = &mut session {
            session.detach().await;
        }
        board.clear();
        // Cancels the watchdog, stops the processes, and frees the slot.
        drop(session);
        info!("Tor stopped");
    }

    /// The current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.board.status()
    }

    /// The port on which the launched Tor accepts SOCKS connections.
    pub fn socks_port(&self) -> u16 {
        self.inner.config.socks_port()
    }

    /// The last bootstrap percentage Tor reported, or 0 if it isn't running.
    pub fn progress(&self) -> u8 {
        self.inner.board.progress()
    }

    /// A stream of the latest [`ConnectionStatus`].
    pub fn status_events(&self) -> ConnectionStatusEvents {
        self.inner.board.status_events()
    }

    /// A stream of every status change, progress report and start failure
    /// from now on.
    pub fn events(&self) -> TorEvents {
        self.inner.board.subscribe()
    }

    /// Wait until Tor has a working circuit.
    pub async fn wait_until_connected(&self) {
        self.inner
            .board
            .wait_for_status(|s| s == ConnectionStatus::Connected)
            .await;
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use crate::status::TorEvent;
    use crate::testing::{FakeConnector, FakeLauncher, FakeSession, FixedProbe};
    use crate::torrc::Ipv6Capability;
    use futures::task::SpawnExt;
    use std::time::Duration;
    use tor_rtmock::MockRuntime;

    /// A manager wired to fakes, and the fakes.
    struct Harness {
        manager: TorManager<MockRuntime>,
        launcher: FakeLauncher,
        connector: Arc<FakeConnector>,
        session: Arc<FakeSession>,
        _dir: tempfile::TempDir,
    }

    fn harness(rt: &MockRuntime, launcher: FakeLauncher, connector: Option<FakeConnector>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = TorLauncherConfig::builder();
        builder
            .data_dir(dir.path().join("tor"))
            .settle_delay(Duration::ZERO);
        builder.permissions().dangerously_trust_everyone();
        let config = builder.build().unwrap();
        let session = Arc::new(FakeSession::new());
        let connector =
            Arc::new(connector.unwrap_or_else(|| FakeConnector::with_session(session.clone())));
        let manager = TorManager::builder(rt.clone(), config)
            .launcher(Arc::new(launcher.clone()))
            .connector(connector.clone())
            .ipv6_probe(Arc::new(FixedProbe(Ipv6Capability::DualStack)))
            .build();
        Harness {
            manager,
            launcher,
            connector,
            session,
            _dir: dir,
        }
    }

    /// Run `start` on a task; the result arrives on the returned receiver.
    fn spawn_start(
        rt: &MockRuntime,
        manager: &TorManager<MockRuntime>,
        bridges: Vec<String>,
    ) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let m = manager.clone();
        rt.spawn(async move {
            let _ = tx.send(m.start(&bridges).await);
        })
        .unwrap();
        rx
    }

    /// Start `manager` and wait for `start` to succeed.
    ///
    /// Only runs tasks; mock time does not move, so the watchdog is still
    /// at the beginning of its timeout afterwards.
    async fn started(rt: &MockRuntime, manager: &TorManager<MockRuntime>, bridges: Vec<String>) {
        let rx = spawn_start(rt, manager, bridges);
        rt.progress_until_stalled().await;
        rx.await.unwrap().unwrap();
    }

    /// Run `stop` on a task; the receiver fires when it returns.
    fn spawn_stop(rt: &MockRuntime, manager: &TorManager<MockRuntime>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let m = manager.clone();
        rt.spawn(async move {
            m.stop().await;
            let _ = tx.send(());
        })
        .unwrap();
        rx
    }

    /// Describe every queued event.
    fn drain(events: &mut TorEvents) -> Vec<String> {
        use futures::{FutureExt as _, StreamExt as _};
        let mut out = vec![];
        while let Some(Some(ev)) = events.next().now_or_never() {
            out.push(match ev {
                TorEvent::Status(s) => format!("status {}", s),
                TorEvent::Progress(p) => format!("progress {}", p),
                TorEvent::Error(e) => format!("error {}", e),
            });
        }
        out
    }

    #[test]
    fn full_bootstrap() {
        MockRuntime::test_with_various(|rt| async move {
            let h = harness(&rt, FakeLauncher::writing_cookie(), None);
            let mut events = h.manager.events();

            started(&rt, &h.manager, vec!["obfs4 192.0.2.3:443 cert=x".into()]).await;

            assert_eq!(h.manager.status(), ConnectionStatus::PortsOpen);
            assert_eq!(h.session.cookies(), vec![vec![0x5a; 32]]);
            assert_eq!(
                h.session.events_requested(),
                vec![vec!["STATUS_CLIENT".to_string()]]
            );
            assert!(h.launcher.last_args().contains(&"--UseBridges".to_string()));
            assert_eq!(h.launcher.live(), 2);

            for p in [10, 10, 55, 100] {
                h.session.emit(&format!(
                    "STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS={} TAG=t SUMMARY=s",
                    p
                ));
            }
            assert_eq!(h.manager.progress(), 100);
            assert_eq!(h.manager.status(), ConnectionStatus::PortsOpen);
            h.session.emit("STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED");
            assert_eq!(h.manager.status(), ConnectionStatus::Connected);

            assert_eq!(
                drain(&mut events),
                vec![
                    "status connecting",
                    "status ports open",
                    "progress 10",
                    "progress 55",
                    "progress 100",
                    "status connected",
                ]
            );

            // Bootstrap finished before the watchdog expired.
            rt.advance_by(Duration::from_secs(60)).await;
            assert!(h.session.confs().is_empty());

            // A second start is a no-op.
            started(&rt, &h.manager, vec![]).await;
            assert_eq!(h.launcher.launches(), 1);

            let rx = spawn_stop(&rt, &h.manager);
            rt.advance_until_stalled().await;
            rx.await.unwrap();
            assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
            assert_eq!(h.manager.progress(), 0);
            assert_eq!(h.session.disconnects(), 1);
            assert_eq!(h.session.observer_count(), 0);
            assert_eq!(h.launcher.live(), 0);
            assert_eq!(
                drain(&mut events),
                vec!["progress 0", "status disconnected"]
            );
        });
    }

    #[test]
    fn stalled_bootstrap_kicks_network() {
        MockRuntime::test_with_various(|rt| async move {
            let h = harness(&rt, FakeLauncher::writing_cookie(), None);
            started(&rt, &h.manager, vec![]).await;
            assert!(h.session.confs().is_empty());

            h.session.emit("STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=10 TAG=t SUMMARY=s");
            rt.advance_by(Duration::from_secs(29)).await;
            assert!(h.session.confs().is_empty());
            rt.advance_by(Duration::from_secs(2)).await;
            assert_eq!(
                h.session.confs(),
                vec![
                    ("DisableNetwork".to_string(), "1".to_string()),
                    ("DisableNetwork".to_string(), "0".to_string()),
                ]
            );
            rt.advance_by(Duration::from_secs(60)).await;
            assert_eq!(h.session.confs().len(), 2);
        });
    }

    #[test]
    fn stop_waits_for_bootstrap() {
        MockRuntime::test_with_various(|rt| async move {
            let h = harness(&rt, FakeLauncher::writing_cookie(), None);
            started(&rt, &h.manager, vec![]).await;

            let mut stopped = spawn_stop(&rt, &h.manager);
            rt.advance_by(Duration::from_millis(50)).await;
            assert!(stopped.try_recv().unwrap().is_none());
            assert_eq!(h.manager.status(), ConnectionStatus::PortsOpen);

            h.session.emit("STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=Done");
            rt.advance_until_stalled().await;
            assert!(stopped.try_recv().unwrap().is_some());
            assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
        });
    }

    #[test]
    fn stop_wait_is_bounded() {
        MockRuntime::test_with_various(|rt| async move {
            let h = harness(&rt, FakeLauncher::writing_cookie(), None);
            started(&rt, &h.manager, vec![]).await;

            let mut stopped = spawn_stop(&rt, &h.manager);
            rt.advance_by(Duration::from_secs(29)).await;
            assert!(stopped.try_recv().unwrap().is_none());
            rt.advance_by(Duration::from_secs(2)).await;
            assert!(stopped.try_recv().unwrap().is_some());
            assert_eq!(h.launcher.live(), 0);
        });
    }

    #[test]
    fn connection_refused() {
        MockRuntime::test_with_various(|rt| async move {
            let h = harness(&rt, FakeLauncher::writing_cookie(), Some(FakeConnector::refusing()));
            let mut events = h.manager.events();
            let rx = spawn_start(&rt, &h.manager, vec![]);
            rt.advance_until_stalled().await;
            let e = rx.await.unwrap().unwrap_err();
            assert!(matches!(e, TorError::ConnectionFailed(_)));
            assert_eq!(h.connector.attempts(), 5);
            assert_eq!(h.launcher.live(), 0);
            assert_eq!(h.manager.status(), ConnectionStatus::Connecting);
            let seen = drain(&mut events);
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[0], "status connecting");
            assert!(seen[1].starts_with("error "));
        });
    }

    #[test]
    fn missing_cookie() {
        MockRuntime::test_with_various(|rt| async move {
            let h = harness(&rt, FakeLauncher::new(), None);
            let rx = spawn_start(&rt, &h.manager, vec![]);
            rt.advance_until_stalled().await;
            let e = rx.await.unwrap().unwrap_err();
            assert!(matches!(e, TorError::MissingCookie(_)));
            assert_eq!(h.session.disconnects(), 1);

            // A failed start can be retried.
            let rx = spawn_start(&rt, &h.manager, vec![]);
            rt.advance_until_stalled().await;
            assert!(rx.await.unwrap().is_err());
            assert_eq!(h.launcher.launches(), 2);
        });
    }

    #[test]
    fn auth_rejected() {
        MockRuntime::test_with_various(|rt| async move {
            let h = harness(&rt, FakeLauncher::writing_cookie(), None);
            h.session.reject_auth();
            let rx = spawn_start(&rt, &h.manager, vec![]);
            rt.advance_until_stalled().await;
            let e = rx.await.unwrap().unwrap_err();
            assert!(matches!(e, TorError::AuthenticationFailed));
            assert_eq!(h.manager.status(), ConnectionStatus::Connecting);
        });
    }

    #[test]
    fn launch_failure() {
        MockRuntime::test_with_various(|rt| async move {
            let launcher = FakeLauncher::new();
            launcher.fail_tor();
            let h = harness(&rt, launcher, None);
            let rx = spawn_start(&rt, &h.manager, vec![]);
            rt.advance_until_stalled().await;
            let e = rx.await.unwrap().unwrap_err();
            assert!(matches!(e, TorError::Unknown(_)));
            assert_eq!(h.connector.attempts(), 0);
        });
    }

    #[test]
    fn stop_during_start() {
        MockRuntime::test_with_various(|rt| async move {
            // No cookie: start() sits in the cookie retry loop.
            let h = harness(&rt, FakeLauncher::new(), None);
            let mut events = h.manager.events();
            let mut starting = spawn_start(&rt, &h.manager, vec![]);
            rt.advance_by(Duration::from_millis(150)).await;
            assert!(starting.try_recv().unwrap().is_none());
            assert_eq!(h.launcher.live(), 2);

            // Without moving the clock: the start gives up at once and
            // its processes go away with it.
            let mut stopped = spawn_stop(&rt, &h.manager);
            rt.progress_until_stalled().await;
            assert!(stopped.try_recv().unwrap().is_some());
            starting.try_recv().unwrap().unwrap().unwrap();

            assert_eq!(h.manager.status(), ConnectionStatus::Disconnected);
            assert_eq!(h.launcher.live(), 0);
            let seen = drain(&mut events);
            assert!(!seen.iter().any(|e| e.starts_with("error")), "{:?}", seen);
        });
    }

    #[test]
    fn invalidated() {
        MockRuntime::test_with_various(|rt| async move {
            let h = harness(&rt, FakeLauncher::writing_cookie(), None);
            started(&rt, &h.manager, vec![]).await;

            let m = h.manager.clone();
            let (tx, done) = oneshot::channel();
            rt.spawn(async move {
                m.invalidate().await;
                let _ = tx.send(());
            })
            .unwrap();
            rt.advance_until_stalled().await;
            done.await.unwrap();
            assert_eq!(h.launcher.live(), 0);

            let rx = spawn_start(&rt, &h.manager, vec![]);
            rt.advance_until_stalled().await;
            let e = rx.await.unwrap().unwrap_err();
            assert!(matches!(e, TorError::Unknown(_)));
            assert_eq!(h.launcher.launches(), 1);
        });
    }

    #[test]
    fn drop_stops_processes() {
        MockRuntime::test_with_various(|rt| async move {
            let h = harness(&rt, FakeLauncher::writing_cookie(), None);
            started(&rt, &h.manager, vec![]).await;
            assert_eq!(h.launcher.live(), 2);
            let Harness {
                manager, launcher, ..
            } = h;
            drop(manager);
            assert_eq!(launcher.live(), 0);
        });
    }
}
