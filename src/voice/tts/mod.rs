//! Speech synthesis engines
//!
//! Every engine exposes the same contract: speak, stop, list voices, and a
//! declaration of which voice settings it honours.

mod cloud;
mod local;
mod neural;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use cloud::CloudVoice;
pub use local::{LocalSynth, SynthFlavor};
pub use neural::NeuralVoice;

use super::playback::AudioSink;
use crate::config::VoiceConfig;
use crate::{Error, Result};

/// Available synthesis engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Platform synthesizer (`say`, `espeak-ng`)
    Local,
    /// Network neural-voice server (OpenAI-compatible speech endpoint)
    Neural,
    /// Premium cloud voice API
    Cloud,
}

impl EngineKind {
    /// Short identifier used in config and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Neural => "neural",
            Self::Cloud => "cloud",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" | "system" | "say" | "espeak" => Ok(Self::Local),
            "neural" | "kokoro" | "edge" => Ok(Self::Neural),
            "cloud" | "elevenlabs" => Ok(Self::Cloud),
            other => Err(Error::Config(format!("unknown speech engine: {other}"))),
        }
    }
}

/// Voice settings an engine honours
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Speaking rate
    pub rate: bool,
    /// Output volume
    pub volume: bool,
    /// Voice identity
    pub voice: bool,
}

/// Operator voice preferences
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceSettings {
    /// Rate multiplier, 1.0 is the engine default
    pub rate: Option<f32>,
    /// Volume, 0.0 to 1.0
    pub volume: Option<f32>,
    /// Engine-specific voice identifier
    pub voice: Option<String>,
}

impl VoiceSettings {
    /// Drop the settings an engine does not support
    #[must_use]
    pub fn restricted_to(&self, capabilities: EngineCapabilities) -> Self {
        Self {
            rate: self.rate.filter(|_| capabilities.rate),
            volume: self.volume.filter(|_| capabilities.volume),
            voice: self.voice.clone().filter(|_| capabilities.voice),
        }
    }
}

/// A speech synthesis engine
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Which engine this is
    fn kind(&self) -> EngineKind;

    /// Settings this engine honours
    fn capabilities(&self) -> EngineCapabilities;

    /// Synthesize and play `text`, returning once playback finishes
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or playback fails
    async fn speak(&self, text: &str, settings: &VoiceSettings) -> Result<()>;

    /// Interrupt in-progress playback
    fn stop(&self);

    /// Voices this engine can use
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be queried
    async fn list_voices(&self) -> Result<Vec<String>>;
}

/// Build every engine that can be initialized from `config`
///
/// Engines that cannot start (missing binary, missing API key) are skipped
/// with a warning.
#[must_use]
pub fn build_engines(
    config: &VoiceConfig,
    sink: &Arc<dyn AudioSink>,
) -> HashMap<EngineKind, Arc<dyn SpeechEngine>> {
    let mut engines: HashMap<EngineKind, Arc<dyn SpeechEngine>> = HashMap::new();

    match LocalSynth::detect() {
        Ok(engine) => {
            engines.insert(EngineKind::Local, Arc::new(engine));
        }
        Err(e) => tracing::warn!(error = %e, "local synthesizer unavailable"),
    }

    if let Some(url) = &config.neural_url {
        engines.insert(
            EngineKind::Neural,
            Arc::new(NeuralVoice::new(
                url.clone(),
                config.neural_model.clone(),
                Arc::clone(sink),
            )),
        );
    }

    match &config.cloud_api_key {
        Some(key) => {
            engines.insert(
                EngineKind::Cloud,
                Arc::new(CloudVoice::new(
                    key.clone(),
                    config.cloud_model.clone(),
                    Arc::clone(sink),
                )),
            );
        }
        None => tracing::debug!("no cloud voice API key configured"),
    }

    tracing::info!(
        engines = ?engines.keys().map(|k| k.as_str()).collect::<Vec<_>>(),
        "speech engines ready"
    );
    engines
}

/// Scale samples by `volume` (0.0 to 1.0)
pub(crate) fn apply_volume(samples: &mut [f32], volume: Option<f32>) {
    let Some(volume) = volume else {
        return;
    };
    let gain = volume.clamp(0.0, 1.0);
    for sample in samples {
        *sample *= gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_settings_are_dropped() {
        let settings = VoiceSettings {
            rate: Some(1.5),
            volume: Some(0.4),
            voice: Some("Rachel".to_string()),
        };
        let caps = EngineCapabilities {
            rate: false,
            volume: true,
            voice: true,
        };

        let restricted = settings.restricted_to(caps);
        assert_eq!(restricted.rate, None);
        assert_eq!(restricted.volume, Some(0.4));
        assert_eq!(restricted.voice.as_deref(), Some("Rachel"));
    }

    #[test]
    fn engine_kind_parses_aliases() {
        assert_eq!("espeak".parse::<EngineKind>().unwrap(), EngineKind::Local);
        assert_eq!("Kokoro".parse::<EngineKind>().unwrap(), EngineKind::Neural);
        assert_eq!("elevenlabs".parse::<EngineKind>().unwrap(), EngineKind::Cloud);
        assert!("festival".parse::<EngineKind>().is_err());
    }

    #[test]
    fn volume_scales_and_clamps() {
        let mut samples = vec![0.5, -1.0];
        apply_volume(&mut samples, Some(0.5));
        assert_eq!(samples, vec![0.25, -0.5]);

        let mut loud = vec![0.5];
        apply_volume(&mut loud, Some(3.0));
        assert_eq!(loud, vec![0.5]);

        let mut untouched = vec![0.3];
        apply_volume(&mut untouched, None);
        assert_eq!(untouched, vec![0.3]);
    }
}
