//! Reading what a pluggable-transport helper says on its standard output.
//!
//! The helper speaks the managed-proxy protocol of pt-spec.txt.  We never
//! act on its messages; Tor connects to the transports on fixed ports.  We
//! only log them, and complain if the helper chose different ports.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;

use itertools::Itertools;
use tracing::{debug, error, info, trace, warn};

use crate::control::proto::{parse_arguments, parse_one_value};

/// Transports we ask the helper to provide.
pub(crate) const CLIENT_TRANSPORTS: [&str; 2] = ["obfs4", "meek_lite"];

/// A message sent from a pluggable-transport helper.
#[derive(PartialEq, Eq, Debug, Clone)]
#[non_exhaustive]
pub(crate) enum PtMessage {
    /// `VERSION-ERROR`: No compatible protocol version was offered.
    VersionError(String),
    /// `VERSION`: The protocol version the helper is using.
    Version(String),
    /// `ENV-ERROR`: The helper didn't like its environment.
    EnvError(String),
    /// `PROXY DONE`: The configured upstream proxy is in use.
    ProxyDone,
    /// `PROXY-ERROR`: The configured upstream proxy could not be used.
    ProxyError(String),
    /// `CMETHOD`: A client transport has been launched.
    ClientTransportLaunched {
        /// The name of the launched transport.
        transport: String,
        /// The protocol used ('socks4' or 'socks5').
        protocol: String,
        /// Where the transport accepts connections.
        endpoint: SocketAddr,
    },
    /// `CMETHOD-ERROR`: A client transport could not be launched.
    ClientTransportFailed {
        /// The name of the transport.
        transport: String,
        /// The error message.
        message: String,
    },
    /// `CMETHODS DONE`: Every supported client transport has been launched.
    ClientTransportsDone,
    /// `LOG`: A log message.
    Log {
        /// The severity (one of 'error', 'warning', 'notice', 'info', 'debug').
        severity: String,
        /// The log message.
        message: String,
    },
    /// `STATUS`: Key/value status for one transport.
    Status {
        /// The transport this is about.
        transport: String,
        /// Everything else the helper said.
        data: HashMap<String, String>,
    },
    /// A line containing an unknown command.
    Unknown(String),
}

impl FromStr for PtMessage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split(' ');
        let first_word = words.next().filter(|w| !w.is_empty()).ok_or("empty line")?;
        Ok(match first_word {
            "VERSION-ERROR" => Self::VersionError(words.join(" ")),
            "VERSION" => Self::Version(words.next().ok_or("no version")?.into()),
            "ENV-ERROR" => Self::EnvError(words.join(" ")),
            "PROXY" => match words.next() {
                Some("DONE") => Self::ProxyDone,
                _ => Self::Unknown(s.into()),
            },
            "PROXY-ERROR" => Self::ProxyError(words.join(" ")),
            "CMETHOD" => {
                let transport = words.next().ok_or("no transport")?;
                let protocol = words.next().ok_or("no protocol")?;
                let endpoint = words
                    .next()
                    .ok_or("no endpoint")?
                    .parse::<SocketAddr>()
                    .map_err(|e| format!("failed to parse endpoint: {}", e))?;
                Self::ClientTransportLaunched {
                    transport: transport.into(),
                    protocol: protocol.into(),
                    endpoint,
                }
            }
            "CMETHOD-ERROR" => {
                let transport = words.next().ok_or("no transport")?;
                Self::ClientTransportFailed {
                    transport: transport.into(),
                    message: words.join(" "),
                }
            }
            "CMETHODS" => match words.next() {
                Some("DONE") => Self::ClientTransportsDone,
                _ => Self::Unknown(s.into()),
            },
            "LOG" => {
                let severity = words
                    .next()
                    .ok_or("no severity")?
                    .strip_prefix("SEVERITY=")
                    .ok_or("badly formatted severity")?;
                let message = words.join(" ");
                let message = message
                    .strip_prefix("MESSAGE=")
                    .ok_or("no or badly formatted message")?;
                Self::Log {
                    severity: severity.into(),
                    message: parse_one_value(message)?.0,
                }
            }
            "STATUS" => {
                let (_, mut data) = parse_arguments(&words.join(" "))?;
                let transport = data.remove("TRANSPORT").ok_or("no TRANSPORT in STATUS")?;
                Self::Status { transport, data }
            }
            _ => Self::Unknown(s.into()),
        })
    }
}

/// Environment variables for a helper providing [`CLIENT_TRANSPORTS`].
pub(crate) fn environment_variables(state_location: &std::path::Path) -> Vec<(String, String)> {
    vec![
        ("TOR_PT_MANAGED_TRANSPORT_VER".into(), "1".into()),
        (
            "TOR_PT_STATE_LOCATION".into(),
            state_location.to_string_lossy().into_owned(),
        ),
        ("TOR_PT_CLIENT_TRANSPORTS".into(), CLIENT_TRANSPORTS.join(",")),
        ("TOR_PT_EXIT_ON_STDIN_CLOSE".into(), "1".into()),
    ]
}

/// Logs output from one helper process.
#[derive(Debug, Clone)]
pub(crate) struct PtOutputLogger {
    /// Identifier to put in log messages.
    identifier: String,
    /// The local port Tor expects each transport on.
    expected_ports: HashMap<String, u16>,
}

impl PtOutputLogger {
    /// Return a logger for the helper `identifier`, which should put each
    /// transport on the port in `expected_ports`.
    pub(crate) fn new(identifier: String, expected_ports: HashMap<String, u16>) -> Self {
        PtOutputLogger {
            identifier,
            expected_ports,
        }
    }

    /// Log one line of output.
    pub(crate) fn line(&self, line: &str) {
        trace!("<-- PT {}: {}", self.identifier, line);
        match line.parse::<PtMessage>() {
            Ok(msg) => self.message(&msg),
            Err(e) => warn!("[pt {}] unparseable line {:?}: {}", self.identifier, line, e),
        }
    }

    /// Log one parsed message.
    fn message(&self, msg: &PtMessage) {
        let id = &self.identifier;
        match msg {
            PtMessage::Log { severity, message } => match severity.as_str() {
                "error" => error!("[pt {}] {}", id, message),
                "warning" => warn!("[pt {}] {}", id, message),
                "notice" => info!("[pt {}] {}", id, message),
                "info" => debug!("[pt {}] {}", id, message),
                "debug" => trace!("[pt {}] {}", id, message),
                x => warn!("[pt {}] {} {}", id, x, message),
            },
            PtMessage::Version(v) if v != "1" => {
                warn!("[pt {}] speaks protocol version {}, we asked for 1", id, v);
            }
            PtMessage::Version(_) => debug!("[pt {}] protocol version 1", id),
            PtMessage::VersionError(e) | PtMessage::EnvError(e) | PtMessage::ProxyError(e) => {
                warn!("[pt {}] refused to start: {}", id, e);
            }
            PtMessage::ProxyDone => debug!("[pt {}] using upstream proxy", id),
            PtMessage::ClientTransportLaunched {
                transport,
                protocol,
                endpoint,
            } => match self.expected_ports.get(transport) {
                Some(port) if *port != endpoint.port() => warn!(
                    "[pt {}] {} listens on {}, but Tor will use port {}",
                    id, transport, endpoint, port
                ),
                Some(_) => info!("[pt {}] {} ready ({} on {})", id, transport, protocol, endpoint),
                None => warn!("[pt {}] launched unwanted transport {}", id, transport),
            },
            PtMessage::ClientTransportFailed { transport, message } => {
                warn!("[pt {}] {} failed: {}", id, transport, message);
            }
            PtMessage::ClientTransportsDone => info!("[pt {}] initialisation done", id),
            PtMessage::Status { transport, data } => {
                debug!("[pt {}] {} status: {:?}", id, transport, data);
            }
            PtMessage::Unknown(x) => warn!("[pt {}] unknown line: {}", id, x),
        }
    }
}
