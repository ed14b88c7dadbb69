//! Audio capture module for voicebridge
//!
//! Microphone input capture and in-memory WAV encoding.
//! Uses CPAL for audio capture and hound for WAV encoding.

pub mod capture;

pub use capture::{CaptureDevice, CaptureError, CaptureHandle, Recording};
