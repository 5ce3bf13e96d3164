//! Premium cloud voice engine (`ElevenLabs`)

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{EngineCapabilities, EngineKind, SpeechEngine, VoiceSettings, apply_volume};
use crate::voice::playback::{AudioSink, decode_audio};
use crate::{Error, Result};

/// `ElevenLabs` API root
const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";

/// "Rachel", the stock `ElevenLabs` voice
const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

/// Synthesizes through the `ElevenLabs` API and plays locally
pub struct CloudVoice {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    sink: Arc<dyn AudioSink>,
}

impl CloudVoice {
    /// Create an engine using `api_key`
    #[must_use]
    pub fn new(api_key: SecretString, model: String, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model,
            sink,
        }
    }

    /// Point at a different API root
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("{}/v1/text-to-speech/{voice_id}", self.base_url);
        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Tts(format!("cloud voice unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl SpeechEngine for CloudVoice {
    fn kind(&self) -> EngineKind {
        EngineKind::Cloud
    }

    fn capabilities(&self) -> EngineCapabilities {
        // ElevenLabs has no speed control on this endpoint
        EngineCapabilities {
            rate: false,
            volume: true,
            voice: true,
        }
    }

    async fn speak(&self, text: &str, settings: &VoiceSettings) -> Result<()> {
        let voice_id = settings.voice.as_deref().unwrap_or(DEFAULT_VOICE_ID);
        let audio = self.synthesize(text, voice_id).await?;
        let (mut samples, sample_rate) = decode_audio(&audio)?;
        apply_volume(&mut samples, settings.volume);
        self.sink.play(samples, sample_rate).await
    }

    fn stop(&self) {
        self.sink.stop();
    }

    async fn list_voices(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Voice {
            voice_id: String,
        }

        #[derive(Deserialize)]
        struct VoicesResponse {
            voices: Vec<Voice>,
        }

        let response: VoicesResponse = self
            .client
            .get(format!("{}/v1/voices", self.base_url))
            .header("xi-api-key", self.api_key.expose_secret())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.voices.into_iter().map(|v| v.voice_id).collect())
    }
}
