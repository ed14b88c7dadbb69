//! Microphone capture using CPAL, encoded to in-memory WAV with hound
//!
//! Capture runs on a dedicated OS thread because cpal streams are not
//! `Send`; the returned `CaptureHandle` only holds channel endpoints. The
//! finished payload stays in memory - nothing is written to disk.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use hound::{WavSpec, WavWriter};

/// Errors that can occur during audio capture.
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// No permission or no input hardware.
    DeviceUnavailable(String),
    /// A capture is already active on this device handle.
    AlreadyCapturing,
    NoSupportedConfig,
    StreamCreationFailed(String),
    EncodeFailed(String),
    /// The capture thread went away without reporting a result.
    Disconnected,
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::DeviceUnavailable(e) => write!(f, "Input device unavailable: {}", e),
            CaptureError::AlreadyCapturing => write!(f, "A capture is already active"),
            CaptureError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            CaptureError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            CaptureError::EncodeFailed(e) => write!(f, "Failed to encode WAV data: {}", e),
            CaptureError::Disconnected => write!(f, "Capture thread ended unexpectedly"),
        }
    }
}

impl std::error::Error for CaptureError {}

/// The captured audio payload from one press-hold-release cycle.
#[derive(Clone, PartialEq, Eq)]
pub struct Recording {
    pub payload: Vec<u8>,
    pub duration_ms: u64,
}

impl Recording {
    pub fn new(payload: Vec<u8>, duration_ms: u64) -> Self {
        Self {
            payload,
            duration_ms,
        }
    }

    /// The stop-without-start result: zero bytes, zero duration.
    pub fn empty() -> Self {
        Self::new(Vec::new(), 0)
    }

    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// Manual Debug: the payload can be hundreds of kilobytes and events are
// logged with {:?}.
impl std::fmt::Debug for Recording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recording")
            .field("size_bytes", &self.size_bytes())
            .field("duration_ms", &self.duration_ms)
            .finish()
    }
}

/// Handle to an active capture.
///
/// `stop()` finalizes and returns the Recording. Dropping the handle
/// instead signals the capture thread to stop and discards the buffered
/// audio, so the device is released even if `stop()` is never called.
pub struct CaptureHandle {
    stop_tx: Sender<()>,
    done_rx: Receiver<Result<Recording, CaptureError>>,
}

impl CaptureHandle {
    /// Stop capturing and finalize the WAV payload.
    /// Blocks until the capture thread has encoded the recording.
    pub fn stop(self) -> Result<Recording, CaptureError> {
        let CaptureHandle { stop_tx, done_rx } = self;
        // Dropping the sender unblocks the capture thread's stop wait
        drop(stop_tx);
        done_rx.recv().map_err(|_| CaptureError::Disconnected)?
    }
}

/// Exclusive handle to the default input device.
pub struct CaptureDevice {
    active: Arc<AtomicBool>,
}

impl CaptureDevice {
    /// Obtain access to the input device, failing if none is available.
    pub fn acquire() -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no input device found".to_string()))?;

        log::info!("Acquired audio input device: {:?}", device.name());

        Ok(Self {
            active: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start buffering microphone input.
    /// Fails with `AlreadyCapturing` if a capture is active on this handle.
    pub fn start(&self) -> Result<CaptureHandle, CaptureError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::AlreadyCapturing);
        }

        let (ready_tx, ready_rx) = sync_channel::<Result<(), CaptureError>>(1);
        let (stop_tx, stop_rx) = channel::<()>();
        let (done_tx, done_rx) = channel::<Result<Recording, CaptureError>>();

        let active = self.active.clone();
        std::thread::Builder::new()
            .name("voicebridge-capture".to_string())
            .spawn(move || run_capture(ready_tx, stop_rx, done_tx, active))
            .map_err(|e| {
                self.active.store(false, Ordering::SeqCst);
                CaptureError::StreamCreationFailed(e.to_string())
            })?;

        // Wait for the stream to be up before reporting success
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(CaptureHandle { stop_tx, done_rx }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CaptureError::Disconnected),
        }
    }
}

/// Body of the capture thread: open the stream, buffer samples until the
/// stop signal, then encode the buffer to WAV.
fn run_capture(
    ready_tx: SyncSender<Result<(), CaptureError>>,
    stop_rx: Receiver<()>,
    done_tx: Sender<Result<Recording, CaptureError>>,
    active: Arc<AtomicBool>,
) {
    let setup = open_input_stream();
    let (stream, samples, channels, sample_rate) = match setup {
        Ok(parts) => {
            let _ = ready_tx.send(Ok(()));
            parts
        }
        Err(e) => {
            active.store(false, Ordering::SeqCst);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Returns on an explicit stop or when the handle is dropped
    let _ = stop_rx.recv();
    drop(stream);

    let samples = samples.lock().unwrap();
    let result = encode_wav(&samples, channels, sample_rate);
    active.store(false, Ordering::SeqCst);

    // Receiver gone means the handle was dropped: discard the recording
    let _ = done_tx.send(result);
}

type SampleBuffer = Arc<Mutex<Vec<i16>>>;

fn open_input_stream() -> Result<(Stream, SampleBuffer, u16, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::DeviceUnavailable("no input device found".to_string()))?;

    let supported_config = device
        .default_input_config()
        .map_err(|_| CaptureError::NoSupportedConfig)?;

    log::info!(
        "Capture config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let channels = config.channels;
    let sample_rate = config.sample_rate.0;

    let samples: SampleBuffer = Arc::new(Mutex::new(Vec::new()));
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, samples.clone(), err_fn),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, samples.clone(), err_fn),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, samples.clone(), err_fn),
        _ => Err(CaptureError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| CaptureError::StreamCreationFailed(format!("Failed to start stream: {}", e)))?;

    Ok((stream, samples, channels, sample_rate))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    samples: SampleBuffer,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<Stream, CaptureError>
where
    T: cpal::Sample<Float = f32> + cpal::SizedSample + Send + 'static,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mut buf = samples.lock().unwrap();
                for &sample in data {
                    buf.push(sample_to_i16(sample));
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::StreamCreationFailed(e.to_string()))
}

/// Encode buffered samples as a 16-bit WAV payload.
fn encode_wav(samples: &[i16], channels: u16, sample_rate: u32) -> Result<Recording, CaptureError> {
    if samples.is_empty() {
        return Ok(Recording::empty());
    }

    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            WavWriter::new(&mut cursor, spec).map_err(|e| CaptureError::EncodeFailed(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| CaptureError::EncodeFailed(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| CaptureError::EncodeFailed(e.to_string()))?;
    }

    let frames = samples.len() as u64 / channels.max(1) as u64;
    let duration_ms = frames * 1000 / sample_rate.max(1) as u64;

    Ok(Recording::new(cursor.into_inner(), duration_ms))
}

/// Convert any sample type to i16 for WAV encoding.
fn sample_to_i16<T: cpal::Sample<Float = f32>>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);

        // Clamping
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-2.0f32), -i16::MAX);
    }

    #[test]
    fn empty_buffer_encodes_to_empty_recording() {
        let rec = encode_wav(&[], 1, 48_000).unwrap();
        assert!(rec.is_empty());
        assert_eq!(rec.size_bytes(), 0);
        assert_eq!(rec.duration_ms, 0);
    }

    #[test]
    fn encoded_wav_reports_duration_from_frame_count() {
        // 1 channel at 1000 Hz: 800 samples = 800 ms
        let samples = vec![0i16; 800];
        let rec = encode_wav(&samples, 1, 1000).unwrap();
        assert_eq!(rec.duration_ms, 800);
        // RIFF header + 16-bit samples
        assert!(rec.size_bytes() > 800 * 2);
        assert_eq!(&rec.payload[..4], b"RIFF");
    }

    #[test]
    fn stereo_duration_counts_frames_not_samples() {
        // 2 channels at 1000 Hz: 2000 samples = 1000 frames = 1000 ms
        let samples = vec![0i16; 2000];
        let rec = encode_wav(&samples, 2, 1000).unwrap();
        assert_eq!(rec.duration_ms, 1000);
    }

    #[test]
    fn recording_debug_hides_the_payload() {
        let rec = Recording::new(vec![0u8; 20_000], 800);
        let rendered = format!("{:?}", rec);
        assert!(rendered.contains("size_bytes: 20000"));
        assert!(rendered.contains("duration_ms: 800"));
    }
}
