//! State machine for the live interview session
//!
//! Single-writer pattern: every transition goes through `reduce()`, which
//! returns the next state and a list of effects for the controller to run.
//! The reducer never touches devices or sockets.

use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

/// Why a session ended in `Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The microphone could not be opened
    PermissionDenied,
    /// The output device could not be opened
    OutputUnavailable,
    /// The transport never became ready
    ConnectionFailed,
    /// The transport failed after opening
    TransportFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::PermissionDenied => "permission_denied",
            FailureReason::OutputUnavailable => "output_unavailable",
            FailureReason::ConnectionFailed => "connection_failed",
            FailureReason::TransportFailed => "transport_failed",
        }
    }
}

/// Coarse session status, as observers see it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Ended,
    Error,
}

/// Internal state of the session workflow.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Idle,
    Connecting {
        session_id: Uuid,
    },
    Active {
        session_id: Uuid,
        started_at: Instant,
    },
    Ended {
        session_id: Uuid,
    },
    Error {
        reason: FailureReason,
        message: String,
    },
}

impl State {
    pub fn session_state(&self) -> SessionState {
        match self {
            State::Idle => SessionState::Idle,
            State::Connecting { .. } => SessionState::Connecting,
            State::Active { .. } => SessionState::Active,
            State::Ended { .. } => SessionState::Ended,
            State::Error { .. } => SessionState::Error,
        }
    }

    /// Id of the session that still owns resources, if any
    pub fn live_session_id(&self) -> Option<Uuid> {
        match self {
            State::Connecting { session_id } | State::Active { session_id, .. } => {
                Some(*session_id)
            }
            _ => None,
        }
    }
}

/// Events that can trigger state transitions.
/// Sent by the command handle, the setup task and the active transport.
#[derive(Debug, Clone)]
pub enum Event {
    /// User asked to start an interview
    Start,
    /// User asked to stop
    Stop,
    /// Application exit requested
    Exit,

    // Setup outcomes
    MicrophoneDenied {
        id: Uuid,
        err: String,
    },
    /// The speaker could not be opened
    AudioDeviceFailed {
        id: Uuid,
        err: String,
    },
    TransportOpened {
        id: Uuid,
    },
    TransportOpenFailed {
        id: Uuid,
        err: String,
    },

    // Transport events
    Interrupted {
        id: Uuid,
    },
    TransportClosed {
        id: Uuid,
        reason: Option<String>,
    },
    TransportFailed {
        id: Uuid,
        err: String,
    },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Acquire devices and open the transport for a new session
    StartSession { id: Uuid },
    /// Wire capture to the transport and the transport to playback
    ActivateSession { id: Uuid },
    /// Flush queued playback
    InterruptPlayback { id: Uuid },
    /// Cancel a pending setup or release an active session
    TeardownSession { id: Uuid },
    /// Publish a status update to observers
    EmitStatus,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - Always emit EmitStatus after state changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.live_session_id();
    let is_current = |eid: Uuid| current_id == Some(eid);

    let fail = |id: Uuid, reason: FailureReason, message: String| {
        (
            Error { reason, message },
            vec![TeardownSession { id }, EmitStatus],
        )
    };

    match (state, event) {
        // -----------------
        // Start
        // -----------------
        (Idle | Ended { .. } | Error { .. }, Start) => {
            let id = Uuid::new_v4();
            (
                Connecting { session_id: id },
                vec![StartSession { id }, EmitStatus],
            )
        }
        // One session at a time
        (Connecting { .. } | Active { .. }, Start) => (state.clone(), vec![]),

        // -----------------
        // Stop / Exit
        // -----------------
        (Connecting { session_id } | Active { session_id, .. }, Stop | Exit) => (
            Ended {
                session_id: *session_id,
            },
            vec![TeardownSession { id: *session_id }, EmitStatus],
        ),
        (_, Stop | Exit) => (state.clone(), vec![]),

        // -----------------
        // Connecting
        // -----------------
        (Connecting { session_id }, TransportOpened { id }) if *session_id == id => (
            Active {
                session_id: id,
                started_at: Instant::now(),
            },
            vec![ActivateSession { id }, EmitStatus],
        ),
        // Capture can still fail while being wired up
        (Connecting { .. } | Active { .. }, MicrophoneDenied { id, err }) if is_current(id) => {
            fail(id, FailureReason::PermissionDenied, err)
        }
        (Connecting { .. }, AudioDeviceFailed { id, err }) if is_current(id) => {
            fail(id, FailureReason::OutputUnavailable, err)
        }
        (Connecting { .. }, TransportOpenFailed { id, err }) if is_current(id) => {
            fail(id, FailureReason::ConnectionFailed, err)
        }

        // -----------------
        // Active
        // -----------------
        (Active { .. }, Interrupted { id }) if is_current(id) => {
            (state.clone(), vec![InterruptPlayback { id }])
        }
        (Active { session_id, started_at }, TransportClosed { id, reason }) if is_current(id) => {
            log::info!(
                "Session {} closed by server after {:?} (reason: {:?})",
                session_id,
                started_at.elapsed(),
                reason
            );
            (
                Ended { session_id: id },
                vec![TeardownSession { id }, EmitStatus],
            )
        }
        (Connecting { .. }, TransportClosed { id, reason }) if is_current(id) => fail(
            id,
            FailureReason::ConnectionFailed,
            reason.unwrap_or_else(|| "connection closed during setup".to_string()),
        ),
        (Connecting { .. } | Active { .. }, TransportFailed { id, err }) if is_current(id) => {
            fail(id, FailureReason::TransportFailed, err)
        }

        // -----------------
        // Stale or unhandled: no transition
        // -----------------
        (_, event) => {
            log::debug!("Ignoring {:?} in state {:?}", event, state.session_state());
            (state.clone(), vec![])
        }
    }
}
