//! Configuration for launching and supervising Tor.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use fs_mistrust::{Mistrust, MistrustBuilder};
use serde::{Deserialize, Serialize};
use tor_config::{ConfigBuildError, mistrust::BuilderExt};

/// Default SOCKS port for the launched Tor.
pub const DEFAULT_SOCKS_PORT: u16 = 39050;
/// Default control port for the launched Tor.
pub const DEFAULT_CONTROL_PORT: u16 = 39060;
/// Default local port for the obfs4 transport of the helper.
pub const DEFAULT_OBFS4_PORT: u16 = 47351;
/// Default local port for the meek_lite transport of the helper.
pub const DEFAULT_MEEK_PORT: u16 = 47352;

/// Everything needed to launch and supervise a Tor process.
///
/// Build one with [`TorLauncherConfig::builder`].  Only the data directory
/// is mandatory; every other setting has a default matching the values a
/// stock deployment uses.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(private, name = "build_unvalidated", error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
#[non_exhaustive]
pub struct TorLauncherConfig {
    /// Directory where Tor keeps its state, its cache and its control cookie.
    #[builder(setter(into))]
    pub(crate) data_dir: PathBuf,

    /// Path of the `tor` binary to run.
    #[builder(default = "PathBuf::from(\"tor\")", setter(into))]
    pub(crate) tor_binary: PathBuf,

    /// Path of the pluggable-transport helper (an obfs4/meek_lite client) to run.
    ///
    /// If unset, no helper is started and bridges that need one will not work.
    #[builder(default, setter(into, strip_option))]
    pub(crate) pt_binary: Option<PathBuf>,

    /// Extra command-line arguments for the pluggable-transport helper.
    #[builder(default)]
    pub(crate) pt_arguments: Vec<String>,

    /// Address on which Tor should open its control port.
    #[builder(default = "SocketAddr::new(Ipv4Addr::LOCALHOST.into(), DEFAULT_CONTROL_PORT)")]
    pub(crate) control_addr: SocketAddr,

    /// Port on which Tor should accept SOCKS connections.
    #[builder(default = "DEFAULT_SOCKS_PORT")]
    pub(crate) socks_port: u16,

    /// Local port for the helper's obfs4 transport.
    #[builder(default = "DEFAULT_OBFS4_PORT")]
    pub(crate) obfs4_port: u16,

    /// Local port for the helper's meek_lite transport.
    #[builder(default = "DEFAULT_MEEK_PORT")]
    pub(crate) meek_port: u16,

    /// Whether Tor should log its notices to standard output.
    ///
    /// Defaults to true in debug builds and false in release builds.
    #[builder(default = "cfg!(debug_assertions)")]
    pub(crate) verbose_tor_log: bool,

    /// How long to wait after launching Tor before connecting to it.
    #[builder(default = "Duration::from_millis(500)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) settle_delay: Duration,

    /// How many times to retry a failed control-port connection.
    #[builder(default = "4")]
    pub(crate) connect_retries: u32,

    /// How long to wait between control-port connection attempts.
    #[builder(default = "Duration::from_millis(200)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) connect_retry_delay: Duration,

    /// How many times to retry reading a missing authentication cookie.
    #[builder(default = "5")]
    pub(crate) cookie_retries: u32,

    /// How long to wait between attempts to read the authentication cookie.
    #[builder(default = "Duration::from_millis(100)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) cookie_retry_delay: Duration,

    /// How often to check whether another Tor instance has exited.
    #[builder(default = "Duration::from_millis(500)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) slot_poll_interval: Duration,

    /// How long bootstrapping may take before we kick Tor's network.
    #[builder(default = "Duration::from_secs(30)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) watchdog_timeout: Duration,

    /// How long `stop()` waits for an in-progress bootstrap to settle.
    #[builder(default = "Duration::from_secs(30)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    pub(crate) stop_wait_timeout: Duration,

    /// Which permissions we want to enforce on the data directory.
    #[builder(sub_builder(fn_name = "build_for_arti"))]
    #[builder_field_attr(serde(default))]
    pub(crate) permissions: Mistrust,
}

impl TorLauncherConfig {
    /// Return a new builder for a `TorLauncherConfig`.
    pub fn builder() -> TorLauncherConfigBuilder {
        TorLauncherConfigBuilder::default()
    }

    /// The directory where Tor keeps its state.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The address of Tor's control port.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// The port on which Tor accepts SOCKS connections.
    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    /// Return the filesystem permissions to enforce on our directories.
    pub(crate) fn permissions(&self) -> &Mistrust {
        &self.permissions
    }
}

impl TorLauncherConfigBuilder {
    /// Build a [`TorLauncherConfig`], checking that the settings make sense together.
    pub fn build(&self) -> Result<TorLauncherConfig, ConfigBuildError> {
        let config = self.build_unvalidated()?;

        if config.data_dir.as_os_str().is_empty() {
            return Err(ConfigBuildError::Invalid {
                field: "data_dir".into(),
                problem: "must not be empty".into(),
            });
        }

        let ports = [
            ("control_addr", config.control_addr.port()),
            ("socks_port", config.socks_port),
            ("obfs4_port", config.obfs4_port),
            ("meek_port", config.meek_port),
        ];
        for (i, (name, port)) in ports.iter().enumerate() {
            if *port == 0 {
                return Err(ConfigBuildError::Invalid {
                    field: (*name).into(),
                    problem: "port must not be zero".into(),
                });
            }
            if let Some((other, _)) = ports[i + 1..].iter().find(|(_, p)| p == port) {
                return Err(ConfigBuildError::Inconsistent {
                    fields: vec![(*name).into(), (*other).into()],
                    problem: format!("both use port {}", port),
                });
            }
        }

        Ok(config)
    }
}
