//! A minimal command-line front end for `tor-launcher`.
//!
//! Starts a local Tor with the configured bridges, logs its bootstrap
//! progress, and stops it again on ctrl-c.

// @@ begin lint list maintained by maint/add_warning @@
#![cfg_attr(not(ci_arti_stable), allow(renamed_and_removed_lints))]
#![cfg_attr(not(ci_arti_nightly), allow(unknown_lints))]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)] // arti/-/merge_requests/588/#note_2812945
#![allow(clippy::result_large_err)] // temporary workaround for arti#587
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->
// These are allowed in this crate only.
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use futures::{FutureExt as _, StreamExt as _};
use serde::Deserialize;
use tor_launcher::{TorEvent, TorLauncherConfigBuilder, TorManager};
use tor_rtcompat::{PreferredRuntime, Runtime, ToplevelBlockOn as _};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, filter::Targets, fmt, registry};

/// Filter used when neither the command line nor the config file gives one.
const DEFAULT_CONSOLE_FILTER: &str = "info";

/// Launch a local Tor and follow it until it is connected.
#[derive(Debug, Parser)]
#[command(author = "The Tor Project Developers", version, about)]
struct Cli {
    /// Configuration file to read.
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the log filter (for example 'info' or 'debug,tor_launcher=trace').
    #[arg(short = 'l', long = "log-level", value_name = "FILTER")]
    log_level: Option<String>,

    /// Override the data directory from the configuration file.
    #[arg(short = 'd', long = "data-dir", value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// A bridge line to use.  May be repeated; replaces the bridges in the
    /// configuration file.
    #[arg(short = 'b', long = "bridge", value_name = "LINE")]
    bridges: Vec<String>,
}

/// Logging options from the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoggingConfig {
    /// Filtering directives for console output, as accepted by [`Targets`].
    ///
    /// You can override this setting with the -l, --log-level command line parameter.
    console: Option<String>,
}

/// Layout of our configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    /// How to launch and supervise Tor.
    #[serde(default)]
    launcher: TorLauncherConfigBuilder,

    /// Where our own log messages go.
    #[serde(default)]
    logging: LoggingConfig,

    /// Bridge lines to hand to Tor.
    #[serde(default)]
    bridges: Vec<String>,
}

impl FileConfig {
    /// Read and parse the configuration file at `path`.
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Parse a configuration file's contents.
    fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// As [`Targets::from_str`], but wrapped in an [`anyhow::Result`].
fn filt_from_str_verbose(s: &str, source: &str) -> Result<Targets> {
    Targets::from_str(s).with_context(|| format!("in {}", source))
}

/// Pick the console filter: the command line wins over the file.
fn console_filter(config: &LoggingConfig, cli: Option<&str>) -> Result<Targets> {
    match (cli, config.console.as_deref()) {
        (Some(s), _) => filt_from_str_verbose(s, "--log-level command line parameter"),
        (None, Some(s)) if !s.is_empty() => filt_from_str_verbose(s, "logging.console"),
        _ => filt_from_str_verbose(DEFAULT_CONSOLE_FILTER, "default filter"),
    }
}

/// Install a subscriber that logs to stderr.
fn setup_logging(config: &LoggingConfig, cli: Option<&str>) -> Result<()> {
    let filter = console_filter(config, cli)?;
    registry()
        .with(
            fmt::Layer::default()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .try_init()
        .context("Unable to install log subscriber")
}

/// Wait until the user presses ctrl-c.
async fn wait_for_ctrl_c() -> Result<()> {
    tokio_crate::signal::ctrl_c().await?;
    info!("Received a ctrl-c; stopping Tor.");
    Ok(())
}

/// Start Tor and log what it does.  Runs until an error or forever.
async fn run<R: Runtime>(manager: &TorManager<R>, bridges: &[String]) -> Result<()> {
    let mut events = manager.events();
    manager.start(bridges).await.context("Unable to start Tor")?;
    info!(
        "Tor is running; waiting for it to bootstrap (SOCKS port {}).",
        manager.socks_port()
    );

    while let Some(event) = events.next().await {
        match event {
            TorEvent::Status(status) => info!("Tor is {}.", status),
            TorEvent::Progress(pct) => info!("Bootstrapped {}%.", pct),
            TorEvent::Error(e) => warn!("Tor reported a problem: {}", e),
            _ => {}
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    setup_logging(&file.logging, cli.log_level.as_deref())?;

    let mut builder = file.launcher;
    if let Some(dir) = cli.data_dir {
        builder.data_dir(dir);
    }
    let config = builder.build().context("Invalid launcher configuration")?;
    let bridges = if cli.bridges.is_empty() {
        file.bridges
    } else {
        cli.bridges
    };
    if bridges.is_empty() {
        info!("No bridges configured; connecting to Tor directly.");
    }

    let runtime = PreferredRuntime::create().context("Unable to create runtime")?;
    let manager = TorManager::builder(runtime.clone(), config).build();

    runtime.block_on(async {
        let outcome = futures::select!(
            r = wait_for_ctrl_c().fuse() => r,
            r = run(&manager, &bridges).fuse() => r,
        );
        manager.stop().await;
        outcome
    })
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

    const SAMPLE: &str = include_str!("../tor-launcher.toml");

    #[test]
    fn sample_config_parses() {
        let file = FileConfig::parse(SAMPLE).unwrap();
        let config = file.launcher.build().unwrap();
        assert_eq!(config.socks_port(), 39050);
        assert_eq!(file.bridges.len(), 1);
        assert_eq!(file.logging.console.as_deref(), Some("info,tor_launcher=debug"));
    }

    #[test]
    fn unknown_sections_rejected() {
        assert!(FileConfig::parse("[proxy]\nport = 1\n").is_err());
    }

    #[test]
    fn missing_data_dir() {
        let file = FileConfig::parse("bridges = []\n").unwrap();
        assert!(file.launcher.build().is_err());
    }

    #[test]
    fn filter_precedence() {
        let config = LoggingConfig {
            console: Some("info,tor_launcher=loudly".into()),
        };
        // The command line wins, so the bad file value is never parsed.
        assert!(console_filter(&config, Some("debug")).is_ok());
        assert!(console_filter(&config, None).is_err());
        assert!(console_filter(&LoggingConfig::default(), None).is_ok());
    }

    #[test]
    fn cli_bridges() {
        let cli = Cli::try_parse_from([
            "tor-launcher",
            "-c",
            "x.toml",
            "--bridge",
            "obfs4 192.0.2.1:443 FP cert=a iat-mode=0",
            "--bridge",
            "meek_lite 192.0.2.2:80 FP url=https://example.com",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert_eq!(cli.bridges.len(), 2);
        assert!(cli.log_level.is_none());
    }
}
