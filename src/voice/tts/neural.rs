//! Network neural-voice engine
//!
//! Talks to any server exposing an OpenAI-compatible `/audio/speech`
//! endpoint, e.g. a local Kokoro server or the `OpenAI` API itself.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{EngineCapabilities, EngineKind, SpeechEngine, VoiceSettings, apply_volume};
use crate::voice::playback::{AudioSink, decode_audio};
use crate::{Error, Result};

/// Voice used when none is configured
const DEFAULT_VOICE: &str = "af_heart";

/// Synthesizes through an HTTP speech endpoint and plays locally
pub struct NeuralVoice {
    client: reqwest::Client,
    base_url: String,
    model: String,
    sink: Arc<dyn AudioSink>,
}

impl NeuralVoice {
    /// Create an engine for the server at `base_url` (e.g. `http://localhost:8880/v1`)
    #[must_use]
    pub fn new(base_url: String, model: String, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            sink,
        }
    }

    /// Fetch synthesized audio bytes
    async fn synthesize(&self, text: &str, settings: &VoiceSettings) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct SpeechRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            speed: Option<f32>,
            response_format: &'a str,
        }

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: settings.voice.as_deref().unwrap_or(DEFAULT_VOICE),
            speed: settings.rate.map(|r| r.clamp(0.25, 4.0)),
            response_format: "mp3",
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Tts(format!("neural voice server unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("neural voice error {status}: {body}")));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl SpeechEngine for NeuralVoice {
    fn kind(&self) -> EngineKind {
        EngineKind::Neural
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            rate: true,
            volume: true,
            voice: true,
        }
    }

    async fn speak(&self, text: &str, settings: &VoiceSettings) -> Result<()> {
        let audio = self.synthesize(text, settings).await?;
        let (mut samples, sample_rate) = decode_audio(&audio)?;
        apply_volume(&mut samples, settings.volume);
        self.sink.play(samples, sample_rate).await
    }

    fn stop(&self) {
        self.sink.stop();
    }

    async fn list_voices(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct VoicesResponse {
            voices: Vec<String>,
        }

        let response: VoicesResponse = self
            .client
            .get(format!("{}/audio/voices", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.voices)
    }
}
