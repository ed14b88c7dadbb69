//! voicebridge: push-to-talk voice session controller
//!
//! Coordinates microphone capture, gesture timing, upload of the captured
//! audio to a remote voice endpoint, and playback of the synthesized
//! response. The UI surface sends gesture events through a
//! [`SessionHandle`] and observes the controller through a watch channel of
//! [`ObservedState`]; all business logic lives in the [`session`] reducer.

pub mod audio;
pub mod config;
pub mod effects;
pub mod gesture;
pub mod playback;
pub mod session;
pub mod transport;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use effects::EffectRunner;
use session::{reduce, Effect, Event, State};

/// Observable state published to the UI surface.
/// Serializes as a tagged union: { "state": "idle" } or
/// { "state": "active", "attentive": true, "lastError": null }.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ObservedState {
    Idle,
    Active {
        attentive: bool,
        #[serde(rename = "lastError")]
        last_error: Option<String>,
    },
    Capturing,
    Validating,
    Uploading,
    Playing,
}

impl ObservedState {
    /// The error surfaced by the most recent failed stage, if any.
    pub fn last_error(&self) -> Option<&str> {
        match self {
            ObservedState::Active { last_error, .. } => last_error.as_deref(),
            _ => None,
        }
    }
}

fn state_to_observed(state: &State) -> ObservedState {
    match state {
        State::Idle => ObservedState::Idle,
        State::Active {
            attentive,
            last_error,
            ..
        } => ObservedState::Active {
            attentive: *attentive,
            last_error: last_error.as_ref().map(|e| e.to_string()),
        },
        State::Capturing { .. } => ObservedState::Capturing,
        State::Validating { .. } => ObservedState::Validating,
        State::Uploading { .. } => ObservedState::Uploading,
        State::Playing { .. } => ObservedState::Playing,
    }
}

/// Handle for dispatching UI events to the session loop.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Event>,
}

impl SessionHandle {
    /// Send an event to the state machine.
    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }
}

/// Run the session loop until the channel closes or `Shutdown` arrives.
///
/// Transitions are strictly serialized: one event is reduced at a time and
/// its effects are dispatched before the next event is read.
pub async fn run_session_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    ui_tx: watch::Sender<ObservedState>,
) {
    let mut state = State::default();

    ui_tx.send_replace(state_to_observed(&state));
    log::info!("Session loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        // Handle Shutdown at the edge
        if matches!(event, Event::Shutdown) {
            log::info!("Shutdown requested, ending session loop");
            break;
        }

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        let new_discriminant = std::mem::discriminant(&next);

        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }

        state = next;

        for eff in effects {
            match eff {
                Effect::NotifyUi => {
                    ui_tx.send_replace(state_to_observed(&state));
                }
                other => effect_runner.spawn(other, tx.clone()),
            }
        }
    }

    log::info!("Session loop ended");
}

/// Wire up channels, spawn the session loop on the current runtime, and
/// return the event handle plus the observable state receiver.
pub fn start(
    effect_runner: Arc<dyn EffectRunner>,
) -> (SessionHandle, watch::Receiver<ObservedState>) {
    let (tx, rx) = mpsc::channel::<Event>(32);
    let (ui_tx, ui_rx) = watch::channel(ObservedState::Idle);

    let loop_tx = tx.clone();
    tokio::spawn(run_session_loop(rx, loop_tx, effect_runner, ui_tx));

    (SessionHandle { tx }, ui_rx)
}
