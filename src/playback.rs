//! Audio playback via rodio
//!
//! A dedicated thread owns the rodio `OutputStream` (it is not `Send`);
//! the engine keeps the stream handle and hands out one sink at a time.
//! Starting a new playback stops the previous one.

use std::io::Cursor;
use std::sync::mpsc::{sync_channel, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rodio::source::{SineWave, Source};
use rodio::{Decoder, OutputStream, Sink};

/// Frequency and length of the session-start acknowledgment tone.
const ACK_TONE_HZ: f32 = 880.0;
const ACK_TONE_DURATION: Duration = Duration::from_millis(150);
const ACK_TONE_GAIN: f32 = 0.2;

/// Errors that can occur during playback.
#[derive(Debug, Clone)]
pub enum PlaybackError {
    /// No output device or the output stream could not be opened.
    OutputUnavailable(String),
    /// The response bytes are not a decodable audio stream.
    DecodeFailed(String),
    SinkFailed(String),
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::OutputUnavailable(e) => write!(f, "Audio output unavailable: {}", e),
            PlaybackError::DecodeFailed(e) => write!(f, "Failed to decode audio response: {}", e),
            PlaybackError::SinkFailed(e) => write!(f, "Failed to open playback sink: {}", e),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// Handle to one playback. Waiting blocks until the sink drains; dropping
/// the handle does not stop the sound (the engine still owns the sink).
pub struct PlaybackHandle {
    sink: Arc<Sink>,
}

impl PlaybackHandle {
    /// Block until playback completes or is stopped.
    pub fn wait(&self) {
        self.sink.sleep_until_end();
    }

    /// Stop this playback early and release the decoded buffer.
    pub fn stop(&self) {
        self.sink.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.sink.empty()
    }
}

/// Playback engine over the default output device.
pub struct PlaybackEngine {
    handle: rodio::OutputStreamHandle,
    current: Mutex<Option<Arc<Sink>>>,
    // Keeps the output thread (and with it the OutputStream) alive; the
    // thread exits when the engine is dropped.
    _keepalive: Sender<()>,
}

impl PlaybackEngine {
    /// Open the default output device.
    pub fn new() -> Result<Self, PlaybackError> {
        let (ready_tx, ready_rx) =
            sync_channel::<Result<rodio::OutputStreamHandle, PlaybackError>>(1);
        let (keepalive_tx, keepalive_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("voicebridge-playback".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    // Hold the stream until the engine is dropped
                    let _stream = stream;
                    let _ = keepalive_rx.recv();
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(PlaybackError::OutputUnavailable(e.to_string())));
                }
            })
            .map_err(|e| PlaybackError::OutputUnavailable(e.to_string()))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| PlaybackError::OutputUnavailable("output thread died".to_string()))??;

        Ok(Self {
            handle,
            current: Mutex::new(None),
            _keepalive: keepalive_tx,
        })
    }

    /// Play a binary audio payload (WAV, MP3, ... - anything rodio decodes).
    /// Any previously active playback on this engine is stopped first.
    pub fn play(&self, bytes: Vec<u8>) -> Result<PlaybackHandle, PlaybackError> {
        let source = Decoder::new(Cursor::new(bytes))
            .map_err(|e| PlaybackError::DecodeFailed(e.to_string()))?;

        let sink =
            Sink::try_new(&self.handle).map_err(|e| PlaybackError::SinkFailed(e.to_string()))?;
        sink.append(source);
        let sink = Arc::new(sink);

        let mut current = self.current.lock().unwrap();
        if let Some(previous) = current.take() {
            log::debug!("Stopping previous playback");
            previous.stop();
        }
        *current = Some(sink.clone());

        Ok(PlaybackHandle { sink })
    }

    /// Short sine burst acknowledging session start. Fire-and-forget; does
    /// not count as the active playback.
    pub fn play_ack_tone(&self) -> Result<(), PlaybackError> {
        let tone = SineWave::new(ACK_TONE_HZ)
            .take_duration(ACK_TONE_DURATION)
            .amplify(ACK_TONE_GAIN);

        let sink =
            Sink::try_new(&self.handle).map_err(|e| PlaybackError::SinkFailed(e.to_string()))?;
        sink.append(tone);
        sink.detach();
        Ok(())
    }

    /// Whether a synthesized response is currently playing.
    pub fn is_playing(&self) -> bool {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |sink| !sink.empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_unavailable_display() {
        let err = PlaybackError::OutputUnavailable("no default device".to_string());
        assert!(err.to_string().contains("no default device"));
    }

    #[test]
    fn decode_failed_display() {
        let err = PlaybackError::DecodeFailed("unrecognized format".to_string());
        assert!(err.to_string().contains("unrecognized format"));
    }
}
