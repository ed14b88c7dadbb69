//! End-to-end session scenarios driven through the full event loop
//!
//! A scripted effect runner stands in for the microphone, the network, and
//! the output device, so every gesture sequence runs deterministically and
//! the tests can count transport calls and gate upload completion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};

use voicebridge::audio::Recording;
use voicebridge::effects::EffectRunner;
use voicebridge::session::{Effect, Event, SessionError};
use voicebridge::transport::SynthesizedResponse;
use voicebridge::{start, ObservedState};

/// Effect runner with canned outcomes for every asynchronous stage.
struct ScriptedRunner {
    /// What the microphone "captured" for this test.
    recording: Recording,
    /// Whether device acquisition succeeds.
    capture_start: Result<(), String>,
    /// What the remote endpoint "returns".
    upload_result: Result<Vec<u8>, SessionError>,
    /// Whether playback of the response succeeds.
    playback_ok: bool,
    /// Number of Upload effects dispatched.
    transport_calls: Arc<AtomicUsize>,
    /// Number of DiscardCapture effects dispatched.
    discarded_captures: Arc<AtomicUsize>,
    /// When set, uploads stall until the gate is notified.
    upload_gate: Option<Arc<Notify>>,
    /// When set, device acquisition stalls until the gate is notified.
    capture_start_gate: Option<Arc<Notify>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self {
            recording: Recording::new(vec![0u8; 20_000], 800),
            capture_start: Ok(()),
            upload_result: Ok(vec![1u8; 64]),
            playback_ok: true,
            transport_calls: Arc::new(AtomicUsize::new(0)),
            discarded_captures: Arc::new(AtomicUsize::new(0)),
            upload_gate: None,
            capture_start_gate: None,
        }
    }
}

impl EffectRunner for ScriptedRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::PlayAckTone => {}

            Effect::StartAttentiveDelay { id, .. } => {
                tokio::spawn(async move {
                    let _ = tx.send(Event::AttentiveElapsed { id }).await;
                });
            }

            Effect::StartCapture { id } => {
                let outcome = self.capture_start.clone();
                let gate = self.capture_start_gate.clone();
                tokio::spawn(async move {
                    if let Some(gate) = gate {
                        gate.notified().await;
                    }
                    let event = match outcome {
                        Ok(()) => Event::CaptureStarted { id },
                        Err(err) => Event::CaptureStartFailed { id, err },
                    };
                    let _ = tx.send(event).await;
                });
            }

            Effect::StopCapture { id } => {
                let recording = self.recording.clone();
                tokio::spawn(async move {
                    let _ = tx.send(Event::CaptureStopped { id, recording }).await;
                });
            }

            Effect::DiscardCapture { .. } => {
                self.discarded_captures.fetch_add(1, Ordering::SeqCst);
            }

            Effect::StartUploadSettle { id, recording, .. } => {
                tokio::spawn(async move {
                    let _ = tx.send(Event::SettleElapsed { id, recording }).await;
                });
            }

            Effect::Upload { id, .. } => {
                self.transport_calls.fetch_add(1, Ordering::SeqCst);
                let outcome = self.upload_result.clone();
                let gate = self.upload_gate.clone();
                tokio::spawn(async move {
                    if let Some(gate) = gate {
                        gate.notified().await;
                    }
                    let event = match outcome {
                        Ok(bytes) => Event::UploadFinished {
                            id,
                            response: SynthesizedResponse::new(bytes),
                        },
                        Err(err) => Event::UploadFailed { id, err },
                    };
                    let _ = tx.send(event).await;
                });
            }

            Effect::PlayResponse { id, .. } => {
                let ok = self.playback_ok;
                tokio::spawn(async move {
                    let event = if ok {
                        Event::PlaybackFinished { id }
                    } else {
                        Event::PlaybackFailed {
                            id,
                            err: "no output device".to_string(),
                        }
                    };
                    let _ = tx.send(event).await;
                });
            }

            Effect::ReleaseDevice => {}

            Effect::NotifyUi => unreachable!("NotifyUi is handled in the session loop"),
        }
    }
}

/// Wait until the observed state satisfies the predicate, failing loudly
/// if it never does.
async fn wait_for<F>(rx: &mut watch::Receiver<ObservedState>, what: &str, pred: F)
where
    F: Fn(&ObservedState) -> bool,
{
    let outcome = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if pred(&rx.borrow_and_update()) {
                return;
            }
            rx.changed().await.expect("session loop ended unexpectedly");
        }
    })
    .await;

    if outcome.is_err() {
        panic!("timed out waiting for {}; last state: {:?}", what, *rx.borrow());
    }
}

fn is_active(state: &ObservedState) -> bool {
    matches!(state, ObservedState::Active { .. })
}

#[tokio::test]
async fn full_cycle_makes_exactly_one_transport_call() {
    // Scenario A: press, hold, release, 20,000-byte payload
    let runner = Arc::new(ScriptedRunner::default());
    let calls = runner.transport_calls.clone();
    let (handle, mut state_rx) = start(runner);

    handle.send(Event::StartSession).await.unwrap();
    wait_for(&mut state_rx, "Active", is_active).await;

    handle.send(Event::BeginCapture).await.unwrap();
    wait_for(&mut state_rx, "Capturing", |s| {
        matches!(s, ObservedState::Capturing)
    })
    .await;

    handle.send(Event::EndCapture).await.unwrap();
    wait_for(&mut state_rx, "Active after playback", is_active).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(state_rx.borrow().last_error(), None);
}

#[tokio::test]
async fn empty_recording_makes_no_transport_call() {
    // Scenario B: short press produces a zero-byte payload
    let runner = Arc::new(ScriptedRunner {
        recording: Recording::empty(),
        ..Default::default()
    });
    let calls = runner.transport_calls.clone();
    let (handle, mut state_rx) = start(runner);

    handle.send(Event::StartSession).await.unwrap();
    wait_for(&mut state_rx, "Active", is_active).await;

    handle.send(Event::BeginCapture).await.unwrap();
    wait_for(&mut state_rx, "Capturing", |s| {
        matches!(s, ObservedState::Capturing)
    })
    .await;

    handle.send(Event::EndCapture).await.unwrap();
    wait_for(&mut state_rx, "Active after rejection", is_active).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(state_rx.borrow().last_error(), None);
}

#[tokio::test]
async fn short_gesture_with_audio_still_makes_one_transport_call() {
    // A sub-500ms press only warns; a non-empty payload is still uploaded
    let runner = Arc::new(ScriptedRunner {
        recording: Recording::new(vec![0u8; 4_000], 120),
        ..Default::default()
    });
    let calls = runner.transport_calls.clone();
    let (handle, mut state_rx) = start(runner);

    handle.send(Event::StartSession).await.unwrap();
    wait_for(&mut state_rx, "Active", is_active).await;

    handle.send(Event::BeginCapture).await.unwrap();
    wait_for(&mut state_rx, "Capturing", |s| {
        matches!(s, ObservedState::Capturing)
    })
    .await;

    handle.send(Event::EndCapture).await.unwrap();
    wait_for(&mut state_rx, "Active after playback", is_active).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(state_rx.borrow().last_error(), None);
}

#[tokio::test]
async fn capture_handle_arriving_after_release_is_reclaimed() {
    // The press/release pair completes before the device finishes
    // acquiring; the stop finds nothing and reports empty, and the handle
    // that lands afterwards must be discarded rather than left streaming.
    let gate = Arc::new(Notify::new());
    let runner = Arc::new(ScriptedRunner {
        recording: Recording::empty(),
        capture_start_gate: Some(gate.clone()),
        ..Default::default()
    });
    let calls = runner.transport_calls.clone();
    let discards = runner.discarded_captures.clone();
    let (handle, mut state_rx) = start(runner);

    handle.send(Event::StartSession).await.unwrap();
    wait_for(&mut state_rx, "Active", is_active).await;

    handle.send(Event::BeginCapture).await.unwrap();
    wait_for(&mut state_rx, "Capturing", |s| {
        matches!(s, ObservedState::Capturing)
    })
    .await;

    handle.send(Event::EndCapture).await.unwrap();
    wait_for(&mut state_rx, "Active after empty stop", is_active).await;
    assert_eq!(discards.load(Ordering::SeqCst), 0);

    // Device acquisition completes only now, in Active
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(discards.load(Ordering::SeqCst), 1);
    assert!(is_active(&state_rx.borrow()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn pointer_leave_uploads_like_a_release() {
    // Scenario C: pointer leaves the element before release
    let runner = Arc::new(ScriptedRunner::default());
    let calls = runner.transport_calls.clone();
    let (handle, mut state_rx) = start(runner);

    handle.send(Event::StartSession).await.unwrap();
    wait_for(&mut state_rx, "Active", is_active).await;

    handle.send(Event::BeginCapture).await.unwrap();
    wait_for(&mut state_rx, "Capturing", |s| {
        matches!(s, ObservedState::Capturing)
    })
    .await;

    handle.send(Event::PointerLeave).await.unwrap();
    wait_for(&mut state_rx, "Active after playback", is_active).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn playback_failure_surfaces_error_and_session_survives() {
    // Scenario D: upload succeeds, the output device fails
    let runner = Arc::new(ScriptedRunner {
        playback_ok: false,
        ..Default::default()
    });
    let (handle, mut state_rx) = start(runner);

    handle.send(Event::StartSession).await.unwrap();
    wait_for(&mut state_rx, "Active", is_active).await;

    handle.send(Event::BeginCapture).await.unwrap();
    wait_for(&mut state_rx, "Capturing", |s| {
        matches!(s, ObservedState::Capturing)
    })
    .await;

    handle.send(Event::EndCapture).await.unwrap();
    wait_for(&mut state_rx, "Active with playback error", |s| {
        s.last_error().map_or(false, |e| e.contains("Playback failed"))
    })
    .await;

    // Session remains usable: another capture can begin
    handle.send(Event::BeginCapture).await.unwrap();
    wait_for(&mut state_rx, "Capturing again", |s| {
        matches!(s, ObservedState::Capturing)
    })
    .await;
}

#[tokio::test]
async fn end_session_during_upload_discards_the_late_response() {
    // Scenario E: the response for an abandoned session is dropped
    let gate = Arc::new(Notify::new());
    let runner = Arc::new(ScriptedRunner {
        upload_gate: Some(gate.clone()),
        ..Default::default()
    });
    let calls = runner.transport_calls.clone();
    let (handle, mut state_rx) = start(runner);

    handle.send(Event::StartSession).await.unwrap();
    wait_for(&mut state_rx, "Active", is_active).await;

    handle.send(Event::BeginCapture).await.unwrap();
    wait_for(&mut state_rx, "Capturing", |s| {
        matches!(s, ObservedState::Capturing)
    })
    .await;

    handle.send(Event::EndCapture).await.unwrap();
    wait_for(&mut state_rx, "Uploading", |s| {
        matches!(s, ObservedState::Uploading)
    })
    .await;

    handle.send(Event::EndSession).await.unwrap();
    wait_for(&mut state_rx, "Idle", |s| matches!(s, ObservedState::Idle)).await;

    // Release the in-flight upload; its response must be discarded quietly
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(*state_rx.borrow(), ObservedState::Idle));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn end_capture_without_begin_changes_nothing() {
    let runner = Arc::new(ScriptedRunner::default());
    let calls = runner.transport_calls.clone();
    let (handle, mut state_rx) = start(runner);

    handle.send(Event::StartSession).await.unwrap();
    wait_for(&mut state_rx, "Active", is_active).await;

    handle.send(Event::EndCapture).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(is_active(&state_rx.borrow()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn capture_unavailable_keeps_the_session_active() {
    let runner = Arc::new(ScriptedRunner {
        capture_start: Err("permission denied".to_string()),
        ..Default::default()
    });
    let calls = runner.transport_calls.clone();
    let (handle, mut state_rx) = start(runner);

    handle.send(Event::StartSession).await.unwrap();
    wait_for(&mut state_rx, "Active", is_active).await;

    handle.send(Event::BeginCapture).await.unwrap();
    wait_for(&mut state_rx, "Active with capture error", |s| {
        s.last_error()
            .map_or(false, |e| e.contains("Microphone unavailable"))
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn session_can_restart_after_ending() {
    let runner = Arc::new(ScriptedRunner::default());
    let (handle, mut state_rx) = start(runner);

    handle.send(Event::StartSession).await.unwrap();
    wait_for(&mut state_rx, "Active", is_active).await;

    handle.send(Event::EndSession).await.unwrap();
    wait_for(&mut state_rx, "Idle", |s| matches!(s, ObservedState::Idle)).await;

    handle.send(Event::StartSession).await.unwrap();
    wait_for(&mut state_rx, "Active again", is_active).await;
}
