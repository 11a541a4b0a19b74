//! Turning Tor's bootstrap events into status updates.

use std::sync::Arc;

use tor_error::warn_report;
use tracing::debug;

use crate::control::{ControlSession, ObserverHandle};
use crate::err::ControlError;
use crate::event::{ControlEvent, STATUS_CLIENT};
use crate::status::{BootstrapState, ConnectionStatus, StatusBoard};
use crate::watchdog::Watchdog;

/// `GETINFO` key for the last bootstrap status event.
const BOOTSTRAP_PHASE: &str = "status/bootstrap-phase";
/// `GETINFO` key for whether Tor has a working circuit.
const CIRCUIT_ESTABLISHED: &str = "status/circuit-established";

/// The observers registered for one session.
#[derive(Debug, Default)]
pub(crate) struct ObserverSet {
    /// Handles to remove at teardown.
    handles: Vec<ObserverHandle>,
}

impl ObserverSet {
    /// Unregister every observer in this set from `control`.
    pub(crate) fn remove_all(&mut self, control: &dyn ControlSession) {
        if self.handles.is_empty() {
            return;
        }
        control.remove_observers(&self.handles);
        debug!("Removed {} event observers", self.handles.len());
        self.handles.clear();
    }
}

/// Apply one event to the board.  Returns true if the event was one we act on.
fn apply(board: &StatusBoard, epoch: u64, watchdog: &Watchdog, event: &ControlEvent) -> bool {
    match event {
        ControlEvent::CircuitEstablished(true) => {
            board.set_status(epoch, ConnectionStatus::Connected);
            true
        }
        // Losing the circuit doesn't take us back to an earlier status.
        ControlEvent::CircuitEstablished(false) => false,
        ControlEvent::BootstrapProgress(progress) => {
            if board.set_progress(epoch, *progress) && *progress >= 100 {
                watchdog.cancel();
                board.set_bootstrap(epoch, BootstrapState::Finished);
            }
            true
        }
        _ => false,
    }
}

/// Register our observers on `control` and subscribe to `STATUS_CLIENT` events.
///
/// If the subscription fails, the observers are removed again.
pub(crate) async fn attach(
    control: &dyn ControlSession,
    board: &Arc<StatusBoard>,
    epoch: u64,
    watchdog: &Watchdog,
) -> Result<ObserverSet, ControlError> {
    let mut set = ObserverSet::default();

    let b = Arc::clone(board);
    let w = watchdog.clone();
    set.handles.push(control.add_observer(Box::new(move |ev| {
        matches!(ev, ControlEvent::CircuitEstablished(_)) && apply(&b, epoch, &w, ev)
    })));

    let b = Arc::clone(board);
    let w = watchdog.clone();
    set.handles.push(control.add_observer(Box::new(move |ev| {
        matches!(ev, ControlEvent::BootstrapProgress(_)) && apply(&b, epoch, &w, ev)
    })));

    if let Err(e) = control.set_events(&[STATUS_CLIENT]).await {
        set.remove_all(control);
        return Err(e);
    }
    Ok(set)
}

/// Ask Tor for its current bootstrap state, in case we missed events
/// before subscribing.
///
/// Failures are logged and otherwise ignored.
pub(crate) async fn replay_current_state(
    control: &dyn ControlSession,
    board: &StatusBoard,
    epoch: u64,
    watchdog: &Watchdog,
) {
    let info = match control
        .get_info(&[BOOTSTRAP_PHASE, CIRCUIT_ESTABLISHED])
        .await
    {
        Ok(info) => info,
        Err(e) => {
            warn_report!(&e, "Unable to ask Tor for its bootstrap status");
            return;
        }
    };
    if let Some(phase) = info.get(BOOTSTRAP_PHASE) {
        apply(board, epoch, watchdog, &ControlEvent::from_bootstrap_phase(phase));
    }
    if let Some(circ) = info.get(CIRCUIT_ESTABLISHED) {
        apply(board, epoch, watchdog, &ControlEvent::from_circuit_established(circ));
    }
}
