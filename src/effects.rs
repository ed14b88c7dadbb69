//! Effect runner for voicebridge
//!
//! Executes the effects produced by the session state machine: microphone
//! capture, the settle/attentive timers, the transport exchange, and
//! playback. Completion is reported back to the event loop as `Event`s.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::audio::{CaptureDevice, CaptureError, CaptureHandle, Recording};
use crate::config::AppConfig;
use crate::playback::{PlaybackEngine, PlaybackError};
use crate::session::{Effect, Event, SessionError};
use crate::transport::{TransportClient, TransportError};

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

type PlaybackSlot = Arc<std::sync::Mutex<Option<Arc<PlaybackEngine>>>>;

/// Real effect runner: cpal capture, reqwest transport, rodio playback.
pub struct SessionEffectRunner {
    device: Arc<Mutex<Option<CaptureDevice>>>,
    active_capture: Arc<Mutex<Option<(Uuid, CaptureHandle)>>>,
    playback: PlaybackSlot,
    transport: Arc<TransportClient>,
}

impl SessionEffectRunner {
    /// Create a runner for the configured endpoint.
    /// Returns Ok even if no audio output is available - playback errors
    /// happen when a response actually needs to be played.
    pub fn new(config: AppConfig) -> Arc<Self> {
        let playback = match PlaybackEngine::new() {
            Ok(engine) => {
                log::info!("Playback engine initialized");
                Some(Arc::new(engine))
            }
            Err(e) => {
                log::warn!("Playback init failed (will retry on play): {}", e);
                None
            }
        };

        Arc::new(Self {
            device: Arc::new(Mutex::new(None)),
            active_capture: Arc::new(Mutex::new(None)),
            playback: Arc::new(std::sync::Mutex::new(playback)),
            transport: Arc::new(TransportClient::new(config.endpoint)),
        })
    }

    /// Whether a synthesized response is currently audible.
    pub fn is_playing(&self) -> bool {
        self.playback
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |engine| engine.is_playing())
    }
}

fn ensure_playback(slot: &PlaybackSlot) -> Result<Arc<PlaybackEngine>, PlaybackError> {
    let mut guard = slot.lock().unwrap();
    if let Some(engine) = guard.as_ref() {
        return Ok(engine.clone());
    }
    let engine = Arc::new(PlaybackEngine::new()?);
    *guard = Some(engine.clone());
    Ok(engine)
}

fn transport_to_session_error(err: TransportError) -> SessionError {
    match err {
        TransportError::Network(message) => SessionError::Network(message),
        TransportError::Server { status, message } => SessionError::Server { status, message },
    }
}

impl EffectRunner for SessionEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::PlayAckTone => {
                let slot = self.playback.clone();
                tokio::task::spawn_blocking(move || match ensure_playback(&slot) {
                    Ok(engine) => {
                        if let Err(e) = engine.play_ack_tone() {
                            log::warn!("Acknowledgment tone failed: {}", e);
                        }
                    }
                    Err(e) => log::warn!("Acknowledgment tone skipped: {}", e),
                });
            }

            Effect::StartAttentiveDelay { id, duration } => {
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    let _ = tx.send(Event::AttentiveElapsed { id }).await;
                });
            }

            Effect::StartCapture { id } => {
                let device = self.device.clone();
                let active = self.active_capture.clone();

                tokio::spawn(async move {
                    // Device acquisition and stream startup both block, so
                    // the whole start runs on the blocking pool.
                    let start_result = tokio::task::spawn_blocking(move || {
                        let mut guard = device.blocking_lock();
                        if guard.is_none() {
                            *guard = Some(CaptureDevice::acquire()?);
                        }
                        guard
                            .as_ref()
                            .ok_or(CaptureError::Disconnected)
                            .and_then(|dev| dev.start())
                    })
                    .await;

                    match start_result {
                        Ok(Ok(handle)) => {
                            log::info!("Capture started for session {}", id);
                            let mut guard = active.lock().await;
                            if let Some((old_id, _)) = guard.replace((id, handle)) {
                                log::warn!("Replaced stale capture handle for {}", old_id);
                            }
                            drop(guard);
                            let _ = tx.send(Event::CaptureStarted { id }).await;
                        }
                        Ok(Err(e)) => {
                            log::error!("Failed to start capture: {}", e);
                            let _ = tx
                                .send(Event::CaptureStartFailed {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                        Err(e) => {
                            log::error!("Capture start task failed: {}", e);
                            let _ = tx
                                .send(Event::CaptureStartFailed {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::StopCapture { id } => {
                let active = self.active_capture.clone();

                tokio::spawn(async move {
                    let handle = {
                        let mut guard = active.lock().await;
                        match guard.take() {
                            Some((hid, handle)) if hid == id => Some(handle),
                            Some(other) => {
                                // Capture belongs to a different session
                                *guard = Some(other);
                                None
                            }
                            None => None,
                        }
                    };

                    let Some(handle) = handle else {
                        // Stop without a prior start: empty recording
                        log::warn!("StopCapture: no active capture for id={}", id);
                        let _ = tx
                            .send(Event::CaptureStopped {
                                id,
                                recording: Recording::empty(),
                            })
                            .await;
                        return;
                    };

                    match tokio::task::spawn_blocking(move || handle.stop()).await {
                        Ok(Ok(recording)) => {
                            log::info!(
                                "Capture stopped: {} bytes, {}ms",
                                recording.size_bytes(),
                                recording.duration_ms
                            );
                            let _ = tx.send(Event::CaptureStopped { id, recording }).await;
                        }
                        Ok(Err(e)) => {
                            // Finalize failure: report an empty recording so
                            // validation aborts the upload
                            log::error!("Failed to finalize capture: {}", e);
                            let _ = tx
                                .send(Event::CaptureStopped {
                                    id,
                                    recording: Recording::empty(),
                                })
                                .await;
                        }
                        Err(e) => {
                            log::error!("Capture stop task failed: {}", e);
                            let _ = tx
                                .send(Event::CaptureStopped {
                                    id,
                                    recording: Recording::empty(),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::DiscardCapture { id } => {
                let active = self.active_capture.clone();
                tokio::spawn(async move {
                    let mut guard = active.lock().await;
                    match guard.take() {
                        Some((hid, handle)) if hid == id => {
                            // Dropping the handle stops the stream and
                            // discards the buffered audio
                            drop(handle);
                            log::info!("Discarded partial capture for session {}", id);
                        }
                        Some(other) => *guard = Some(other),
                        None => {}
                    }
                });
            }

            Effect::StartUploadSettle {
                id,
                recording,
                duration,
            } => {
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    let _ = tx.send(Event::SettleElapsed { id, recording }).await;
                });
            }

            Effect::Upload { id, recording } => {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    match transport.send(recording).await {
                        Ok(response) => {
                            let _ = tx.send(Event::UploadFinished { id, response }).await;
                        }
                        Err(e) => {
                            let _ = tx
                                .send(Event::UploadFailed {
                                    id,
                                    err: transport_to_session_error(e),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::PlayResponse { id, audio } => {
                let slot = self.playback.clone();
                tokio::spawn(async move {
                    let bytes = audio.into_bytes();
                    // Decode, play, and block until the sink drains
                    let played = tokio::task::spawn_blocking(move || {
                        let engine = ensure_playback(&slot)?;
                        let handle = engine.play(bytes)?;
                        handle.wait();
                        Ok::<(), PlaybackError>(())
                    })
                    .await;

                    match played {
                        Ok(Ok(())) => {
                            let _ = tx.send(Event::PlaybackFinished { id }).await;
                        }
                        Ok(Err(e)) => {
                            log::error!("Playback failed: {}", e);
                            let _ = tx
                                .send(Event::PlaybackFailed {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                        Err(e) => {
                            log::error!("Playback task failed: {}", e);
                            let _ = tx
                                .send(Event::PlaybackFailed {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::ReleaseDevice => {
                let device = self.device.clone();
                let active = self.active_capture.clone();
                tokio::spawn(async move {
                    if let Some((id, handle)) = active.lock().await.take() {
                        drop(handle);
                        log::debug!("Dropped leftover capture handle for {}", id);
                    }
                    if device.lock().await.take().is_some() {
                        log::info!("Microphone released");
                    }
                });
            }

            Effect::NotifyUi => {
                // Handled in the session loop, not here
                unreachable!("NotifyUi should be handled in run_session_loop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_transport_error_maps_to_network_session_error() {
        let err = transport_to_session_error(TransportError::Network("timed out".to_string()));
        assert_eq!(err, SessionError::Network("timed out".to_string()));
    }

    #[test]
    fn server_transport_error_keeps_status_and_message() {
        let err = transport_to_session_error(TransportError::Server {
            status: 500,
            message: "synthesis failed".to_string(),
        });
        assert_eq!(
            err,
            SessionError::Server {
                status: 500,
                message: "synthesis failed".to_string(),
            }
        );
    }
}
