//! On-disk layout of a Tor data directory, and creating it.

use std::path::{Path, PathBuf};

use fs_mistrust::Mistrust;
use tracing::debug;

/// Name of the subdirectory holding onion-service client authorization keys.
const AUTH_DIR: &str = "auth";
/// Name of the file where Tor writes its control-port cookie.
const COOKIE_FILE: &str = "control_auth_cookie";
/// Name of the subdirectory handed to the pluggable-transport helper.
const PT_STATE_DIR: &str = "pt_state";

/// The directories and files a launched Tor uses.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TorDirs {
    /// Tor's data directory.
    data_dir: PathBuf,
}

impl TorDirs {
    /// Describe the layout rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        TorDirs {
            data_dir: data_dir.into(),
        }
    }

    /// Tor's data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding onion-service client authorization keys.
    pub fn auth_dir(&self) -> PathBuf {
        self.data_dir.join(AUTH_DIR)
    }

    /// The control-port authentication cookie written by Tor.
    pub fn cookie_path(&self) -> PathBuf {
        self.data_dir.join(COOKIE_FILE)
    }

    /// State directory for the pluggable-transport helper.
    pub fn pt_state_dir(&self) -> PathBuf {
        self.data_dir.join(PT_STATE_DIR)
    }

    /// Create the data directory and the auth directory inside it, if they
    /// do not exist yet.
    ///
    /// Calling this on an existing, correctly-permissioned tree is not an
    /// error.  `mistrust` decides what permissions count as correct.
    pub fn ensure_directories(&self, mistrust: &Mistrust) -> Result<(), fs_mistrust::Error> {
        debug!("Preparing Tor data directory {}", self.data_dir.display());
        mistrust.make_directory(&self.data_dir)?;
        mistrust.make_directory(self.auth_dir())?;
        Ok(())
    }
}
