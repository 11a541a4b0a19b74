//! Building the command line for a Tor process.
//!
//! A [`TorConfiguration`] is rebuilt from scratch on every start, from the
//! launcher configuration, the data-directory layout, the user's bridge
//! lines, and a fresh probe of the host's IPv6 connectivity.  Nothing here
//! touches the network or the disk, except [`RouteProbe`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use safelog::Sensitive;
use tracing::debug;

use crate::config::TorLauncherConfig;
use crate::fs::TorDirs;

/// How well this host can reach the Tor network over IPv6.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Ipv6Capability {
    /// Only IPv6 is available.
    Ipv6Only,
    /// Both IPv4 and IPv6 are available.
    DualStack,
    /// IPv6 is not available.
    Unavailable,
    /// We could not tell.
    Unknown,
}

/// Something that can tell us what kind of IP connectivity we have.
pub trait Ipv6Probe: Send + Sync + 'static {
    /// Classify the current connectivity of this host.
    fn probe(&self) -> Ipv6Capability;
}

/// An [`Ipv6Probe`] that asks the operating system whether it has a route
/// to well-known public IPv4 and IPv6 addresses.
///
/// No packets are sent: "connecting" a UDP socket only selects a route.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct RouteProbe;

impl RouteProbe {
    /// Return true if we have a route to `target`.
    fn has_route(target: SocketAddr) -> Option<bool> {
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let sock = match UdpSocket::bind(local) {
            Ok(s) => s,
            // No socket of this family at all: the stack is missing.
            Err(_) => return Some(false),
        };
        match sock.connect(target) {
            Ok(()) => Some(true),
            Err(e) if e.raw_os_error().is_some() => Some(false),
            Err(_) => None,
        }
    }
}

impl Ipv6Probe for RouteProbe {
    fn probe(&self) -> Ipv6Capability {
        // Well-known anycast resolvers; any public address would do.
        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 53);
        let v6 = SocketAddr::new(
            IpAddr::V6(Ipv6Addr::new(0x2620, 0xfe, 0, 0, 0, 0, 0, 0xfe)),
            53,
        );
        let capability = match (Self::has_route(v4), Self::has_route(v6)) {
            (Some(true), Some(true)) => Ipv6Capability::DualStack,
            (Some(false), Some(true)) => Ipv6Capability::Ipv6Only,
            (_, Some(false)) => Ipv6Capability::Unavailable,
            (None, Some(true)) | (_, None) => Ipv6Capability::Unknown,
        };
        debug!("IPv6 probe result: {:?}", capability);
        capability
    }
}

/// A fully worked-out set of arguments for one Tor launch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TorConfiguration {
    /// Where Tor keeps its state.
    dirs: TorDirs,
    /// Arguments to pass to the tor binary.
    args: Vec<String>,
    /// How many bridges we configured.
    n_bridges: usize,
    /// What the IPv6 probe told us.
    ipv6: Ipv6Capability,
}

impl TorConfiguration {
    /// Build the configuration for one launch.
    ///
    /// Blank bridge lines are skipped; all others are passed through as-is.
    pub fn build<S: AsRef<str>>(
        config: &TorLauncherConfig,
        dirs: &TorDirs,
        bridges: &[S],
        ipv6: Ipv6Capability,
    ) -> Self {
        let mut args = Args::default();

        args.flag("--allow-missing-torrc");
        args.flag("--ignore-missing-torrc");
        args.opt("--DataDirectory", dirs.data_dir().display());
        args.opt("--CookieAuthentication", 1);
        args.opt("--ClientOnly", 1);
        args.opt("--AvoidDiskWrites", 1);
        args.opt("--SocksPort", config.socks_port);
        args.opt("--ControlPort", config.control_addr);
        if config.verbose_tor_log {
            args.opt("--Log", "notice stdout");
        } else {
            args.opt("--Log", "err file /dev/null");
        }
        args.opt("--ClientUseIPv6", 1);
        args.opt(
            "--ClientTransportPlugin",
            format!("obfs4 socks5 127.0.0.1:{}", config.obfs4_port),
        );
        args.opt(
            "--ClientTransportPlugin",
            format!("meek_lite socks5 127.0.0.1:{}", config.meek_port),
        );
        args.opt("--ClientOnionAuthDir", dirs.auth_dir().display());

        let bridges: Vec<&str> = bridges
            .iter()
            .map(|b| b.as_ref().trim())
            .filter(|b| !b.is_empty())
            .collect();
        for line in &bridges {
            debug!("Using bridge {}", Sensitive::new(line));
            args.opt("--Bridge", line);
        }
        if !bridges.is_empty() {
            args.opt("--UseBridges", 1);
        }

        args.0.extend(ip_policy_args(ipv6, !bridges.is_empty()));

        TorConfiguration {
            dirs: dirs.clone(),
            args: args.0,
            n_bridges: bridges.len(),
            ipv6,
        }
    }

    /// The command-line arguments for the tor binary.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The data directory layout this configuration uses.
    pub fn dirs(&self) -> &TorDirs {
        &self.dirs
    }

    /// Whether any bridges are configured.
    pub fn uses_bridges(&self) -> bool {
        self.n_bridges > 0
    }

    /// The IPv6 capability this configuration was built for.
    pub fn ipv6(&self) -> Ipv6Capability {
        self.ipv6
    }
}

/// Arguments deciding which IP versions Tor uses to reach relays.
fn ip_policy_args(ipv6: Ipv6Capability, using_bridges: bool) -> Vec<String> {
    let (prefer_v6, use_v4) = match ipv6 {
        // Bridges are frequently IPv4-only, so keep IPv4 on for them.
        Ipv6Capability::Ipv6Only => ("1", if using_bridges { "1" } else { "0" }),
        Ipv6Capability::DualStack | Ipv6Capability::Unavailable | Ipv6Capability::Unknown => {
            ("auto", "1")
        }
    };
    vec![
        "--ClientPreferIPv6ORPort".into(),
        prefer_v6.into(),
        "--ClientUseIPv4".into(),
        use_v4.into(),
    ]
}

/// Accumulator for command-line arguments.
#[derive(Default)]
struct Args(Vec<String>);

impl Args {
    /// Push a flag that takes no value.
    fn flag(&mut self, flag: &str) {
        self.0.push(flag.into());
    }

    /// Push an option and its value.
    fn opt(&mut self, key: &str, val: impl std::fmt::Display) {
        self.0.push(key.into());
        self.0.push(val.to_string());
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

    const BRIDGE: &str = "obfs4 192.0.2.7:443 0123456789ABCDEF0123456789ABCDEF01234567 cert=AAAA iat-mode=0";

    fn config(verbose: bool) -> TorLauncherConfig {
        TorLauncherConfig::builder()
            .data_dir("/w/tor")
            .verbose_tor_log(verbose)
            .build()
            .unwrap()
    }

    /// Return the arguments that follow the base block.
    fn tail(cfg: &TorConfiguration) -> Vec<&str> {
        let args = cfg.args();
        let start = args
            .iter()
            .position(|a| a == "--ClientOnionAuthDir")
            .unwrap();
        args[start + 2..].iter().map(String::as_str).collect()
    }

    #[test]
    fn base_arguments() {
        let dirs = TorDirs::new("/w/tor");
        let cfg = TorConfiguration::build(&config(true), &dirs, &[] as &[&str], Ipv6Capability::DualStack);
        let expected = [
            "--allow-missing-torrc",
            "--ignore-missing-torrc",
            "--DataDirectory",
            "/w/tor",
            "--CookieAuthentication",
            "1",
            "--ClientOnly",
            "1",
            "--AvoidDiskWrites",
            "1",
            "--SocksPort",
            "39050",
            "--ControlPort",
            "127.0.0.1:39060",
            "--Log",
            "notice stdout",
            "--ClientUseIPv6",
            "1",
            "--ClientTransportPlugin",
            "obfs4 socks5 127.0.0.1:47351",
            "--ClientTransportPlugin",
            "meek_lite socks5 127.0.0.1:47352",
            "--ClientOnionAuthDir",
            "/w/tor/auth",
        ];
        assert_eq!(&cfg.args()[..expected.len()], &expected[..]);
        assert!(!cfg.uses_bridges());

        let quiet = TorConfiguration::build(&config(false), &dirs, &[] as &[&str], Ipv6Capability::DualStack);
        let pos = quiet.args().iter().position(|a| a == "--Log").unwrap();
        assert_eq!(quiet.args()[pos + 1], "err file /dev/null");
    }

    #[test]
    fn ip_policy_table() {
        use Ipv6Capability as C;
        let dirs = TorDirs::new("/w/tor");
        let cfg = config(true);

        let cases: [(C, bool, &[&str]); 6] = [
            (
                C::Ipv6Only,
                true,
                &["--ClientPreferIPv6ORPort", "1", "--ClientUseIPv4", "1"],
            ),
            (
                C::Ipv6Only,
                false,
                &["--ClientPreferIPv6ORPort", "1", "--ClientUseIPv4", "0"],
            ),
            (
                C::DualStack,
                true,
                &["--ClientPreferIPv6ORPort", "auto", "--ClientUseIPv4", "1"],
            ),
            (
                C::DualStack,
                false,
                &["--ClientPreferIPv6ORPort", "auto", "--ClientUseIPv4", "1"],
            ),
            (
                C::Unavailable,
                false,
                &["--ClientPreferIPv6ORPort", "auto", "--ClientUseIPv4", "1"],
            ),
            (
                C::Unknown,
                false,
                &["--ClientPreferIPv6ORPort", "auto", "--ClientUseIPv4", "1"],
            ),
        ];

        for (probe, with_bridges, policy) in cases {
            let bridges: &[&str] = if with_bridges { &[BRIDGE] } else { &[] };
            let built = TorConfiguration::build(&cfg, &dirs, bridges, probe);
            let mut expected: Vec<&str> = vec![];
            if with_bridges {
                expected.extend(["--Bridge", BRIDGE, "--UseBridges", "1"]);
            }
            expected.extend(policy);
            assert_eq!(tail(&built), expected, "{:?} bridges={}", probe, with_bridges);
            assert_eq!(built.ipv6(), probe);
        }
    }

    #[test]
    fn bridges_passed_through() {
        let dirs = TorDirs::new("/w/tor");
        let second = "meek_lite 192.0.2.2:80 url=https://meek.example.com/ front=www.example.com";
        let built = TorConfiguration::build(
            &config(true),
            &dirs,
            &[BRIDGE, "   ", second],
            Ipv6Capability::Unknown,
        );
        assert!(built.uses_bridges());
        assert_eq!(
            &tail(&built)[..6],
            &["--Bridge", BRIDGE, "--Bridge", second, "--UseBridges", "1"]
        );
    }
}
