//! Transport client for the remote voice inference endpoint
//!
//! Sends one Recording per request as a multipart POST and returns the
//! synthesized audio response as opaque bytes. The whole payload is sent
//! atomically and the response is buffered to completion before playback.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::Client;

use crate::audio::Recording;

/// Field name the endpoint expects for the binary audio part.
const AUDIO_FIELD_NAME: &str = "audio_file";
const AUDIO_FILE_NAME: &str = "recording.wav";
const AUDIO_MIME: &str = "audio/wav";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Errors that can occur during the transport exchange
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Connectivity or timeout failure
    Network(String),
    /// The endpoint returned a non-success status
    Server { status: u16, message: String },
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Network(e) => write!(f, "Network error: {}", e),
            TransportError::Server { status, message } => {
                write!(f, "Server error ({}): {}", status, message)
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Binary audio returned by the remote service for one Recording.
#[derive(Clone, PartialEq, Eq)]
pub struct SynthesizedResponse {
    audio: Vec<u8>,
}

impl SynthesizedResponse {
    pub fn new(audio: Vec<u8>) -> Self {
        Self { audio }
    }

    pub fn size_bytes(&self) -> usize {
        self.audio.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.audio
    }
}

// Manual Debug: responses can be large and events are logged with {:?}.
impl std::fmt::Debug for SynthesizedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesizedResponse")
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}

/// Client for the voice chat endpoint.
pub struct TransportClient {
    endpoint: String,
}

impl TransportClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Upload one Recording and return the synthesized audio response.
    ///
    /// The caller guarantees the payload is non-empty; the controller never
    /// hands an empty Recording to the transport.
    pub async fn send(&self, recording: Recording) -> Result<SynthesizedResponse, TransportError> {
        debug_assert!(!recording.is_empty(), "empty payload must never be sent");

        log::info!(
            "Uploading recording to {} ({} bytes, {}ms)",
            self.endpoint,
            recording.size_bytes(),
            recording.duration_ms
        );

        let part = Part::bytes(recording.payload)
            .file_name(AUDIO_FILE_NAME)
            .mime_str(AUDIO_MIME)
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let form = Form::new().part(AUDIO_FIELD_NAME, part);

        let response = http_client()
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            log::error!("Voice endpoint error ({}): {}", status.as_u16(), message);
            return Err(TransportError::Server {
                status: status.as_u16(),
                message,
            });
        }

        // Buffer the full response before handing it to playback
        let audio = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        log::info!("Received synthesized response ({} bytes)", audio.len());
        Ok(SynthesizedResponse::new(audio.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_error_display() {
        let err = TransportError::Network("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn server_error_display_includes_status() {
        let err = TransportError::Server {
            status: 502,
            message: "bad gateway".to_string(),
        };
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("bad gateway"));
    }

    #[test]
    fn synthesized_response_debug_hides_the_audio() {
        let response = SynthesizedResponse::new(vec![0u8; 4096]);
        let rendered = format!("{:?}", response);
        assert!(rendered.contains("size_bytes: 4096"));
        assert!(!rendered.contains("[0"));
    }

    #[test]
    fn client_remembers_its_endpoint() {
        let client = TransportClient::new("http://127.0.0.1:8000/voice_chat");
        assert_eq!(client.endpoint(), "http://127.0.0.1:8000/voice_chat");
    }
}
