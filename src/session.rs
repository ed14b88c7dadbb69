//! Session state machine for voicebridge
//!
//! This module implements the push-to-talk session workflow using a
//! single-writer pattern. All state transitions go through the `reduce()`
//! function, which returns a new state and a list of effects to execute.

use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::audio::Recording;
use crate::gesture::GestureTimer;
use crate::transport::SynthesizedResponse;

/// Delay between the acknowledgment tone and the attentive pulse.
pub const ATTENTIVE_DELAY: Duration = Duration::from_millis(500);

/// Settle delay between capture finalization and upload.
pub const UPLOAD_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Gestures shorter than this are logged as too short. The recording is
/// still uploaded (log-only policy carried over from the source behavior).
pub const MIN_GESTURE_MS: u64 = 500;

/// One push-to-talk interaction episode. At most one exists per controller.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub started_at: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Instant::now(),
        }
    }
}

/// Errors surfaced to the UI layer. None of these end the session; the
/// machine returns to `Active` and waits for another capture attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Microphone could not be acquired (no permission or no hardware).
    CaptureUnavailable(String),
    /// A capture was already active on the device handle.
    AlreadyCapturing,
    /// Connectivity or timeout failure while uploading.
    Network(String),
    /// The remote service returned a non-success status.
    Server { status: u16, message: String },
    /// The output device failed to play the synthesized response.
    Playback(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::CaptureUnavailable(e) => write!(f, "Microphone unavailable: {}", e),
            SessionError::AlreadyCapturing => write!(f, "A capture is already in progress"),
            SessionError::Network(e) => write!(f, "Network error: {}", e),
            SessionError::Server { status, message } => {
                write!(f, "Server error ({}): {}", status, message)
            }
            SessionError::Playback(e) => write!(f, "Playback failed: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

/// Internal state of the session workflow.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone)]
pub enum State {
    Idle,
    Active {
        session: Session,
        /// UI feedback only: set once the post-tone delay elapses.
        attentive: bool,
        last_error: Option<SessionError>,
    },
    Capturing {
        session: Session,
        gesture: GestureTimer,
    },
    Validating {
        session: Session,
        held_ms: u64,
    },
    Uploading {
        session: Session,
    },
    Playing {
        session: Session,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

/// Events that can trigger state transitions.
/// UI gesture events carry no id; completion events are tagged with the
/// session id so stale completions for a dead session are dropped.
#[derive(Debug, Clone)]
pub enum Event {
    // UI surface events
    StartSession,
    BeginCapture,
    EndCapture,
    /// Pointer left the capture element; cancels `Capturing` only.
    PointerLeave,
    EndSession,

    // Timer events
    AttentiveElapsed {
        id: Uuid,
    },
    SettleElapsed {
        id: Uuid,
        recording: Recording,
    },

    // Capture events
    CaptureStarted {
        id: Uuid,
    },
    CaptureStartFailed {
        id: Uuid,
        err: String,
    },
    CaptureStopped {
        id: Uuid,
        recording: Recording,
    },

    // Transport events
    UploadFinished {
        id: Uuid,
        response: SynthesizedResponse,
    },
    UploadFailed {
        id: Uuid,
        err: SessionError,
    },

    // Playback events
    PlaybackFinished {
        id: Uuid,
    },
    PlaybackFailed {
        id: Uuid,
        err: String,
    },

    /// Controller shutdown requested
    Shutdown,
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone)]
pub enum Effect {
    PlayAckTone,
    StartAttentiveDelay {
        id: Uuid,
        duration: Duration,
    },
    StartCapture {
        id: Uuid,
    },
    StopCapture {
        id: Uuid,
    },
    /// Stop any in-progress capture and drop the buffered audio unheard.
    DiscardCapture {
        id: Uuid,
    },
    /// Hold the recording for the settle delay, then report `SettleElapsed`.
    StartUploadSettle {
        id: Uuid,
        recording: Recording,
        duration: Duration,
    },
    Upload {
        id: Uuid,
        recording: Recording,
    },
    PlayResponse {
        id: Uuid,
        audio: SynthesizedResponse,
    },
    /// Return the microphone handle; must never be held across `Idle`.
    ReleaseDevice,
    /// Signal to publish the observable state to the UI surface.
    NotifyUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Drop completion events with stale session IDs
/// - Events invalid for the current state are rejected, not queued
/// - Always emit NotifyUi after state changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    // Helper: extract current session id (if any)
    let current_id: Option<Uuid> = match state {
        Idle => None,
        Active { session, .. }
        | Capturing { session, .. }
        | Validating { session, .. }
        | Uploading { session }
        | Playing { session } => Some(session.id),
    };

    // Helper: check if a completion event belongs to a different session
    let is_stale = |eid: Uuid| current_id.is_some() && Some(eid) != current_id;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, StartSession) => {
            let session = Session::new();
            let id = session.id;
            log::info!("Session {} started", id);
            (
                Active {
                    session,
                    attentive: false,
                    last_error: None,
                },
                vec![
                    PlayAckTone,
                    StartAttentiveDelay {
                        id,
                        duration: ATTENTIVE_DELAY,
                    },
                    NotifyUi,
                ],
            )
        }
        (Idle, EndSession) => (Idle, vec![]),

        // -----------------
        // Active
        // -----------------
        (
            Active {
                session,
                last_error,
                ..
            },
            AttentiveElapsed { id },
        ) if session.id == id => (
            Active {
                session: session.clone(),
                attentive: true,
                last_error: last_error.clone(),
            },
            vec![NotifyUi],
        ),
        (Active { session, .. }, BeginCapture) => {
            let mut gesture = GestureTimer::new();
            gesture.on_press();
            (
                Capturing {
                    session: session.clone(),
                    gesture,
                },
                vec![StartCapture { id: session.id }, NotifyUi],
            )
        }
        // Release without a preceding press is a no-op
        (Active { .. }, EndCapture) => (state.clone(), vec![]),

        // -----------------
        // Capturing
        // -----------------
        (Capturing { .. }, CaptureStarted { id }) if Some(id) == current_id => {
            // Device is buffering; nothing to do until release
            (state.clone(), vec![])
        }
        (Capturing { session, .. }, CaptureStartFailed { id, err }) if session.id == id => {
            log::error!("Capture unavailable for session {}: {}", id, err);
            (
                Active {
                    session: session.clone(),
                    attentive: true,
                    last_error: Some(SessionError::CaptureUnavailable(err)),
                },
                vec![NotifyUi],
            )
        }
        // Pointer-leave maps to the same stop as an explicit release
        (Capturing { session, gesture }, EndCapture | PointerLeave) => {
            let held_ms = gesture.clone().on_release();
            if held_ms < MIN_GESTURE_MS {
                log::warn!(
                    "Gesture too short ({}ms < {}ms); recording kept (log-only policy)",
                    held_ms,
                    MIN_GESTURE_MS
                );
            }
            (
                Validating {
                    session: session.clone(),
                    held_ms,
                },
                vec![StopCapture { id: session.id }, NotifyUi],
            )
        }
        (Capturing { session, .. }, EndSession) => (
            Idle,
            vec![
                DiscardCapture { id: session.id },
                ReleaseDevice,
                NotifyUi,
            ],
        ),

        // -----------------
        // Validating
        // -----------------
        (Validating { session, held_ms }, CaptureStopped { id, recording })
            if session.id == id =>
        {
            if recording.is_empty() {
                // Hard rule: an empty payload is never transmitted
                log::info!(
                    "Session {}: empty recording ({}ms gesture), upload skipped",
                    id,
                    held_ms
                );
                (
                    Active {
                        session: session.clone(),
                        attentive: true,
                        last_error: None,
                    },
                    vec![NotifyUi],
                )
            } else {
                log::debug!(
                    "Session {}: recording accepted ({} bytes, {}ms), settling",
                    id,
                    recording.size_bytes(),
                    recording.duration_ms
                );
                (
                    state.clone(),
                    vec![StartUploadSettle {
                        id,
                        recording,
                        duration: UPLOAD_SETTLE_DELAY,
                    }],
                )
            }
        }
        (Validating { session, .. }, SettleElapsed { id, recording }) if session.id == id => (
            Uploading {
                session: session.clone(),
            },
            vec![Upload { id, recording }, NotifyUi],
        ),

        // -----------------
        // Uploading
        // -----------------
        (Uploading { session }, UploadFinished { id, response }) if session.id == id => (
            Playing {
                session: session.clone(),
            },
            vec![
                PlayResponse {
                    id,
                    audio: response,
                },
                NotifyUi,
            ],
        ),
        (Uploading { session }, UploadFailed { id, err }) if session.id == id => {
            log::error!("Session {}: upload failed: {}", id, err);
            (
                Active {
                    session: session.clone(),
                    attentive: true,
                    last_error: Some(err),
                },
                vec![NotifyUi],
            )
        }

        // -----------------
        // Playing
        // -----------------
        (Playing { session }, PlaybackFinished { id }) if session.id == id => (
            Active {
                session: session.clone(),
                attentive: true,
                last_error: None,
            },
            vec![NotifyUi],
        ),
        (Playing { session }, PlaybackFailed { id, err }) if session.id == id => {
            log::error!("Session {}: playback failed: {}", id, err);
            (
                Active {
                    session: session.clone(),
                    attentive: true,
                    last_error: Some(SessionError::Playback(err)),
                },
                vec![NotifyUi],
            )
        }

        // -----------------
        // End session from any remaining non-Idle state.
        // Capture/validation/upload are abandoned; playback already in
        // flight is left to finish on its own.
        // -----------------
        (Active { session, .. }, EndSession)
        | (Validating { session, .. }, EndSession)
        | (Uploading { session }, EndSession)
        | (Playing { session }, EndSession) => {
            log::info!("Session {} ended", session.id);
            (Idle, vec![ReleaseDevice, NotifyUi])
        }

        // -----------------
        // Late capture starts: the device finished acquiring after the
        // capture stopped being wanted (quick release, session end, or a
        // previous session). The live handle must be reclaimed here or the
        // microphone stays held and every later start fails with
        // AlreadyCapturing.
        // -----------------
        (Idle, CaptureStarted { id }) => {
            log::warn!("Capture started after session end; releasing the device");
            (Idle, vec![DiscardCapture { id }, ReleaseDevice])
        }
        (_, CaptureStarted { id }) => {
            log::warn!("Late capture start for session {}; discarding", id);
            (state.clone(), vec![DiscardCapture { id }])
        }

        // -----------------
        // Stale completion events (drop silently)
        // -----------------
        (_, CaptureStartFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, CaptureStopped { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, SettleElapsed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, UploadFinished { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, UploadFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, PlaybackFinished { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, PlaybackFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, AttentiveElapsed { id }) if is_stale(id) => (state.clone(), vec![]),

        // -----------------
        // Unhandled: rejected transition (includes completions arriving in
        // Idle after EndSession - the response for a dead session is dropped)
        // -----------------
        (_, event) => {
            log::debug!("No transition for {:?} in current state", event);
            (state.clone(), vec![])
        }
    }
}
