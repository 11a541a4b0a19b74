//! Launching the Tor and pluggable-transport processes.
//!
//! The manager only talks to the [`TorLauncher`] trait.  [`CommandLauncher`]
//! is the real implementation, running binaries with [`std::process`].

mod pt;
mod slot;

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::Duration;

use tor_error::warn_report;
use tor_rtcompat::SleepProvider;
use tracing::{debug, error, info, trace, warn};

use crate::config::TorLauncherConfig;
use crate::err::{LaunchError, StartError};
use crate::torrc::TorConfiguration;

pub use slot::{ProcessSlot, SlotGuard};

/// Amount of time we give a pluggable transport helper to exit gracefully.
const GRACEFUL_EXIT_TIME: Duration = Duration::from_secs(5);

/// Something that can start the external processes we supervise.
pub trait TorLauncher: Send + Sync + 'static {
    /// Start Tor with the arguments in `configuration`.
    fn launch_tor(&self, configuration: &TorConfiguration) -> Result<ProcessHandle, LaunchError>;

    /// Start the pluggable-transport helper, if one is configured.
    ///
    /// Returns `Ok(None)` if there is nothing to start.
    fn launch_pt_helper(
        &self,
        configuration: &TorConfiguration,
    ) -> Result<Option<ProcessHandle>, LaunchError>;
}

/// What a [`ProcessHandle`] stops when it is dropped.
enum Target {
    /// A real child process.
    Child {
        /// The process.  Taken when the handle is dropped.
        child: Option<Child>,
        /// Its standard input, if we kept it.  Closing it asks the process to exit.
        stdin: Option<ChildStdin>,
    },
    /// Stand-in used by tests: counts live handles.
    #[cfg(test)]
    Fake(std::sync::Arc<std::sync::atomic::AtomicUsize>),
}

/// A running child process.  Dropping the handle stops the process.
pub struct ProcessHandle {
    /// Which program this is, for logging.
    what: &'static str,
    /// What to stop.
    target: Target,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("what", &self.what)
            .field("pid", &self.id())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Wrap `child`, which will be killed when the handle is dropped.
    pub fn new(what: &'static str, child: Child) -> Self {
        ProcessHandle {
            what,
            target: Target::Child {
                child: Some(child),
                stdin: None,
            },
        }
    }

    /// Wrap `child`, which will be asked to exit by closing `stdin` when the
    /// handle is dropped, and killed if it is still running a few seconds later.
    pub fn with_stdin(what: &'static str, child: Child, stdin: ChildStdin) -> Self {
        ProcessHandle {
            what,
            target: Target::Child {
                child: Some(child),
                stdin: Some(stdin),
            },
        }
    }

    /// A handle for no real process, which counts itself in `live` until dropped.
    #[cfg(test)]
    pub(crate) fn fake(
        what: &'static str,
        live: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    ) -> Self {
        live.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        ProcessHandle {
            what,
            target: Target::Fake(live),
        }
    }

    /// The operating-system process ID, if this is a real process.
    pub fn id(&self) -> Option<u32> {
        match &self.target {
            Target::Child { child, .. } => child.as_ref().map(Child::id),
            #[cfg(test)]
            Target::Fake(_) => None,
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let what = self.what;
        match &mut self.target {
            Target::Child { child, stdin } => {
                let Some(mut child) = child.take() else {
                    return;
                };
                if let Ok(Some(status)) = child.try_wait() {
                    debug!("{} already exited: {}", what, status);
                    return;
                }
                match stdin.take() {
                    Some(stdin) => {
                        debug!("Asking {} to exit", what);
                        drop(stdin);
                        thread::spawn(move || {
                            thread::sleep(GRACEFUL_EXIT_TIME);
                            match child.try_wait() {
                                Ok(None) => kill(what, &mut child),
                                Ok(Some(_)) => {}
                                Err(e) => warn!("Failed to call try_wait() on {}: {}", what, e),
                            }
                        });
                    }
                    None => {
                        debug!("Stopping {}", what);
                        kill(what, &mut child);
                    }
                }
            }
            #[cfg(test)]
            Target::Fake(live) => {
                live.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }
}

/// Kill `child` and reap it.
fn kill(what: &str, child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill() {}: {}", what, e);
    }
    if let Err(e) = child.wait() {
        warn!("Failed to wait() for {}: {}", what, e);
    }
}

/// Severity of a line Tor wrote to its log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TorLogLevel {
    /// `[err]`
    Err,
    /// `[warn]`
    Warn,
    /// `[notice]`
    Notice,
    /// `[info]`, `[debug]` or anything we can't recognize.
    Other,
}

/// Split a Tor log line such as `Oct 19 12:00:00.000 [notice] Bootstrapped 5%`.
fn split_tor_log_line(line: &str) -> (TorLogLevel, &str) {
    let Some((head, message)) = line.split_once("] ") else {
        return (TorLogLevel::Other, line);
    };
    let level = match head.rsplit_once('[').map(|(_, sev)| sev) {
        Some("err") => TorLogLevel::Err,
        Some("warn") => TorLogLevel::Warn,
        Some("notice") => TorLogLevel::Notice,
        Some(_) => TorLogLevel::Other,
        None => return (TorLogLevel::Other, line),
    };
    (level, message)
}

/// Forward one line of Tor's output to our log.
fn log_tor_line(line: &str) {
    match split_tor_log_line(line) {
        (TorLogLevel::Err, msg) => error!("[tor] {}", msg),
        (TorLogLevel::Warn, msg) => warn!("[tor] {}", msg),
        (TorLogLevel::Notice, msg) => info!("[tor] {}", msg),
        (TorLogLevel::Other, msg) => debug!("[tor] {}", msg),
    }
}

/// Read lines from `output` on a new thread, handing each to `handle`.
///
/// The thread exits when the stream ends.
fn forward_lines<Rd, F>(name: String, output: Rd, handle: F)
where
    Rd: Read + Send + 'static,
    F: Fn(&str) + Send + 'static,
{
    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        for line in BufReader::new(output).lines() {
            match line {
                Ok(line) => handle(&line),
                Err(e) => {
                    trace!("Stopped reading {}: {}", name, e);
                    break;
                }
            }
        }
    });
    if let Err(e) = spawned {
        warn!("Unable to start output reader thread: {}", e);
    }
}

/// A [`TorLauncher`] that runs real binaries.
#[derive(Clone, Debug)]
pub struct CommandLauncher {
    /// The tor binary.
    tor_binary: PathBuf,
    /// The pluggable-transport helper binary, if any.
    pt_binary: Option<PathBuf>,
    /// Extra arguments for the helper.
    pt_arguments: Vec<String>,
    /// Local port Tor expects each transport on.
    transport_ports: HashMap<String, u16>,
}

impl CommandLauncher {
    /// Return a launcher for the binaries named in `config`.
    pub fn new(config: &TorLauncherConfig) -> Self {
        let transport_ports = pt::CLIENT_TRANSPORTS
            .iter()
            .map(|t| (*t).to_owned())
            .zip([config.obfs4_port, config.meek_port])
            .collect();
        CommandLauncher {
            tor_binary: config.tor_binary.clone(),
            pt_binary: config.pt_binary.clone(),
            pt_arguments: config.pt_arguments.clone(),
            transport_ports,
        }
    }
}

impl TorLauncher for CommandLauncher {
    fn launch_tor(&self, configuration: &TorConfiguration) -> Result<ProcessHandle, LaunchError> {
        info!("Launching Tor at {}", self.tor_binary.display());
        let mut child = Command::new(&self.tor_binary)
            .args(configuration.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                what: "tor",
                path: self.tor_binary.clone(),
                error: e.into(),
            })?;
        let handle_stdout = child.stdout.take();
        let handle_stderr = child.stderr.take();
        let handle = ProcessHandle::new("tor", child);
        let stdout = handle_stdout.ok_or(LaunchError::StdioUnavailable("tor"))?;
        let stderr = handle_stderr.ok_or(LaunchError::StdioUnavailable("tor"))?;
        forward_lines("tor stdout".into(), stdout, log_tor_line);
        forward_lines("tor stderr".into(), stderr, |line| warn!("[tor] {}", line));
        debug!("Tor is running as pid {:?}", handle.id());
        Ok(handle)
    }

    fn launch_pt_helper(
        &self,
        configuration: &TorConfiguration,
    ) -> Result<Option<ProcessHandle>, LaunchError> {
        let Some(binary) = &self.pt_binary else {
            debug!("No pluggable transport helper configured");
            return Ok(None);
        };
        info!(
            "Launching pluggable transport helper at {} for {:?}",
            binary.display(),
            pt::CLIENT_TRANSPORTS
        );
        let mut child = Command::new(binary)
            .args(&self.pt_arguments)
            .envs(pt::environment_variables(
                &configuration.dirs().pt_state_dir(),
            ))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                what: "pluggable transport",
                path: binary.clone(),
                error: e.into(),
            })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            // Dropping the handle kills it.
            drop(ProcessHandle::new("pluggable transport", child));
            return Err(LaunchError::StdioUnavailable("pluggable transport"));
        };

        let identifier = binary
            .file_name()
            .map(|x| x.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let logger = pt::PtOutputLogger::new(identifier.clone(), self.transport_ports.clone());
        forward_lines(format!("pt {}", identifier), stdout, move |line| {
            logger.line(line);
        });
        Ok(Some(ProcessHandle::with_stdin(
            "pluggable transport",
            child,
            stdin,
        )))
    }
}

/// The processes started for one session, and the slot they run in.
///
/// Dropping this stops Tor, then the helper, then frees the slot.
#[derive(Debug)]
pub(crate) struct RunningTor {
    /// The Tor process.
    _tor: ProcessHandle,
    /// The helper process, if we started one.
    _pt: Option<ProcessHandle>,
    /// Our claim on the process slot.
    _slot: SlotGuard,
}

/// Wait for the process slot, then start Tor and the helper.
///
/// Gives up with [`StartError::Superseded`] as soon as `is_current` returns
/// false, whether while waiting for the slot or after starting.
pub(crate) async fn spawn_if_needed<R, F>(
    runtime: &R,
    slot: &ProcessSlot,
    launcher: &dyn TorLauncher,
    configuration: &TorConfiguration,
    config: &TorLauncherConfig,
    is_current: F,
) -> Result<RunningTor, StartError>
where
    R: SleepProvider,
    F: Fn() -> bool,
{
    let guard = slot
        .acquire_while(runtime, config.slot_poll_interval, &is_current)
        .await
        .ok_or(StartError::Superseded)?;

    let tor = launcher
        .launch_tor(configuration)
        .map_err(StartError::Launch)?;
    let pt = match launcher.launch_pt_helper(configuration) {
        Ok(pt) => pt,
        Err(e) => {
            warn_report!(&e, "Continuing without pluggable transports");
            None
        }
    };
    let running = RunningTor {
        _tor: tor,
        _pt: pt,
        _slot: guard,
    };

    if !config.settle_delay.is_zero() {
        runtime.sleep(config.settle_delay).await;
    }
    if !is_current() {
        return Err(StartError::Superseded);
    }
    Ok(running)
}
