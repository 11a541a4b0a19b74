//! Errors for launching and supervising a Tor process.
//!
//! [`TorError`] is the only error type that leaves this crate through
//! [`TorManager::start`](crate::TorManager::start).  The other types here
//! describe failures of the individual steps; they are converted into a
//! `TorError` in exactly one place (`From<StartError>`).

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use futures::task::SpawnError;
use tor_error::{ErrorKind, HasKind};

/// An error that caused an attempt to start Tor to fail.
///
/// Every failed call to [`TorManager::start`](crate::TorManager::start)
/// produces exactly one of these, which is also published on the
/// [event stream](crate::TorManager::events).
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TorError {
    /// We could not open a connection to Tor's control port, even after retrying.
    #[error("Unable to connect to the Tor control port")]
    ConnectionFailed(#[source] Arc<io::Error>),

    /// Tor rejected our authentication cookie.
    #[error("Tor rejected our control-port authentication cookie")]
    AuthenticationFailed,

    /// Tor never wrote a usable authentication cookie.
    #[error("Tor did not write its control-port authentication cookie")]
    MissingCookie(#[source] Arc<io::Error>),

    /// Something else went wrong.
    #[error("Unable to start Tor")]
    Unknown(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl TorError {
    /// Construct a [`TorError::Unknown`] from any error.
    pub(crate) fn unknown<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TorError::Unknown(Arc::new(e))
    }
}

impl HasKind for TorError {
    fn kind(&self) -> ErrorKind {
        use ErrorKind as EK;
        use TorError as E;
        match self {
            E::ConnectionFailed(_) => EK::LocalNetworkError,
            E::AuthenticationFailed => EK::ExternalToolFailed,
            E::MissingCookie(_) => EK::PersistentStateAccessFailed,
            E::Unknown(_) => EK::Other,
        }
    }
}

/// Standard-issue `Result` alias, with [`TorError`].
pub type Result<T> = std::result::Result<T, TorError>;

/// An error from a control-port session.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ControlError {
    /// Reading from or writing to the control connection failed.
    #[error("I/O error on control connection")]
    Io(#[source] Arc<io::Error>),

    /// The control connection is closed.
    #[error("Control connection closed")]
    Closed,

    /// Tor answered a command with an error status.
    #[error("Tor rejected {command:?}: {code} {message}")]
    Rejected {
        /// The command keyword we sent.
        command: String,
        /// The status code Tor replied with.
        code: u16,
        /// The text of Tor's reply.
        message: String,
    },

    /// Tor sent something we could not understand.
    #[error("Control protocol violation: {0}")]
    Protocol(String),

    /// We could not spawn the task that reads from the control connection.
    #[error("Unable to spawn control connection reader")]
    Spawn(#[source] Arc<SpawnError>),
}

impl From<io::Error> for ControlError {
    fn from(e: io::Error) -> Self {
        ControlError::Io(Arc::new(e))
    }
}

impl HasKind for ControlError {
    fn kind(&self) -> ErrorKind {
        use ControlError as E;
        use ErrorKind as EK;
        match self {
            E::Io(_) | E::Closed => EK::LocalNetworkError,
            E::Rejected { .. } => EK::ExternalToolFailed,
            E::Protocol(_) => EK::ExternalToolFailed,
            E::Spawn(e) => e.kind(),
        }
    }
}

/// An error launching an external process.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LaunchError {
    /// The operating system refused to run the binary.
    #[error("Couldn't execute {} binary at {}", what, path.display())]
    Spawn {
        /// Which program we were trying to run.
        what: &'static str,
        /// The binary path we tried to execute.
        path: PathBuf,
        /// The I/O error returned.
        #[source]
        error: Arc<io::Error>,
    },
    /// We couldn't get stdio for a spawned child process.
    #[error("{0} stdio unavailable")]
    StdioUnavailable(&'static str),
}

impl HasKind for LaunchError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::ExternalToolFailed
    }
}

/// The manager was shut down with [`TorManager::invalidate`](crate::TorManager::invalidate).
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("Tor manager has been invalidated")]
#[non_exhaustive]
pub struct Invalidated;

/// Which step of a start attempt failed, and why.
///
/// Only used inside the crate; see `From<StartError> for TorError`.
#[derive(Debug, thiserror::Error)]
pub(crate) enum StartError {
    /// Creating the data directories failed.
    #[error("Unable to prepare data directories")]
    Directories(#[source] fs_mistrust::Error),
    /// Launching the tor binary failed.
    #[error("Unable to launch tor")]
    Launch(#[source] LaunchError),
    /// Every control-port connection attempt failed; this is the last error.
    #[error("Unable to connect to control port")]
    Connect(#[source] io::Error),
    /// The cookie file never appeared; this is the last read error.
    #[error("Unable to read authentication cookie")]
    Cookie(#[source] io::Error),
    /// Tor said no to our cookie.
    #[error("Authentication rejected")]
    AuthRejected,
    /// Some other control-port command failed.
    #[error("Control-port command failed")]
    Control(#[source] ControlError),
    /// We could not spawn a background task.
    #[error("Unable to spawn task")]
    Spawn(#[source] SpawnError),
    /// The manager has been invalidated.
    #[error("Manager invalidated")]
    Invalidated,
    /// `stop()` was called while this attempt was running.
    ///
    /// Never reported to the caller.
    #[error("Start attempt superseded")]
    Superseded,
}

impl From<StartError> for TorError {
    fn from(e: StartError) -> TorError {
        use StartError as S;
        match e {
            S::Connect(e) => TorError::ConnectionFailed(Arc::new(e)),
            S::Cookie(e) => TorError::MissingCookie(Arc::new(e)),
            S::AuthRejected => TorError::AuthenticationFailed,
            S::Control(ControlError::Io(e)) => TorError::ConnectionFailed(e),
            S::Directories(e) => TorError::unknown(e),
            S::Launch(e) => TorError::unknown(e),
            S::Control(e) => TorError::unknown(e),
            S::Spawn(e) => TorError::unknown(e),
            S::Invalidated => TorError::unknown(Invalidated),
            S::Superseded => TorError::unknown(tor_error::internal!(
                "superseded start attempt reached the error classifier"
            )),
        }
    }
}
