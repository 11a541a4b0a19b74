//! Typed control-port events.
//!
//! Tor reports asynchronous events as loosely structured text.  Everything
//! that reaches the rest of this crate goes through [`ControlEvent::parse`]
//! first, so the string matching lives in exactly one place.

use std::collections::HashMap;

use crate::control::proto::parse_arguments;

/// The event type we subscribe to.
pub(crate) const STATUS_CLIENT: &str = "STATUS_CLIENT";

/// An asynchronous event from Tor that we care about.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ControlEvent {
    /// Tor has (`true`) or no longer has (`false`) a working circuit.
    CircuitEstablished(bool),
    /// Tor's bootstrap has reached this percentage.
    BootstrapProgress(u8),
    /// Anything else.
    Unrecognized,
}

/// An event split into its parts, before we decide what it means.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct RawEvent {
    /// The event type, such as `STATUS_CLIENT`.
    event_type: String,
    /// The action, such as `BOOTSTRAP`, for `STATUS_*` events.
    action: Option<String>,
    /// `KEY=VALUE` arguments.
    arguments: HashMap<String, String>,
}

impl RawEvent {
    /// Split the text of a `650` line.
    ///
    /// `STATUS_*` events have the form `TYPE SEVERITY ACTION ARGS...`.
    fn split(text: &str) -> Option<RawEvent> {
        let (event_type, rest) = match text.split_once(' ') {
            Some((t, rest)) => (t, rest),
            None => (text, ""),
        };
        if event_type.is_empty() {
            return None;
        }
        let (words, arguments) = parse_arguments(rest).ok()?;
        let action = if event_type.starts_with("STATUS_") {
            // words[0] is the severity.
            words.get(1).cloned()
        } else {
            None
        };
        Some(RawEvent {
            event_type: event_type.to_owned(),
            action,
            arguments,
        })
    }
}

impl From<RawEvent> for ControlEvent {
    fn from(raw: RawEvent) -> ControlEvent {
        if raw.event_type != STATUS_CLIENT {
            return ControlEvent::Unrecognized;
        }
        match raw.action.as_deref() {
            Some("BOOTSTRAP") => raw
                .arguments
                .get("PROGRESS")
                .and_then(|p| p.parse::<u8>().ok())
                .filter(|p| *p <= 100)
                .map(ControlEvent::BootstrapProgress)
                .unwrap_or(ControlEvent::Unrecognized),
            Some("CIRCUIT_ESTABLISHED") => ControlEvent::CircuitEstablished(true),
            Some("CIRCUIT_NOT_ESTABLISHED") => ControlEvent::CircuitEstablished(false),
            _ => ControlEvent::Unrecognized,
        }
    }
}

impl ControlEvent {
    /// Classify the text of an asynchronous event (without its `650 ` prefix).
    pub fn parse(text: &str) -> ControlEvent {
        RawEvent::split(text)
            .map(ControlEvent::from)
            .unwrap_or(ControlEvent::Unrecognized)
    }

    /// Classify the value of `GETINFO status/bootstrap-phase`.
    ///
    /// That value looks like a `STATUS_CLIENT` event without the event type.
    pub(crate) fn from_bootstrap_phase(value: &str) -> ControlEvent {
        ControlEvent::parse(&format!("{} {}", STATUS_CLIENT, value))
    }

    /// Classify the value of `GETINFO status/circuit-established`.
    pub(crate) fn from_circuit_established(value: &str) -> ControlEvent {
        match value.trim() {
            "1" => ControlEvent::CircuitEstablished(true),
            "0" => ControlEvent::CircuitEstablished(false),
            _ => ControlEvent::Unrecognized,
        }
    }
}
