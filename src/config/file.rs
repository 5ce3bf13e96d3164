//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! Every field is optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ParleyConfigFile {
    pub capture: CaptureFileConfig,
    pub backends: BackendsFileConfig,
    pub context: ContextFileConfig,
    pub voice: VoiceFileConfig,
    pub tools: ToolsFileConfig,
    pub paths: PathsFileConfig,
}

/// Capture helper and utterance timing
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CaptureFileConfig {
    /// Helper executable name or path
    pub helper: Option<String>,
    pub helper_args: Option<Vec<String>>,
    pub continuous: Option<bool>,
    pub voice_threshold: Option<u8>,
    pub silence_threshold: Option<u8>,
    pub silence_timeout_ms: Option<u64>,
    pub force_send_timeout_ms: Option<u64>,
    pub settle_delay_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
    /// Treat pending interim text as final when the recognizer rejects speech
    pub promote_rejected: Option<bool>,
    pub min_promote_chars: Option<usize>,
}

/// LLM backends
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BackendsFileConfig {
    /// "auto", "local", "gateway" or "fallback"
    pub backend: Option<String>,
    /// Auto-mode order, e.g. `["local", "gateway", "fallback"]`
    pub priority: Option<Vec<String>>,
    pub local_url: Option<String>,
    pub gateway_url: Option<String>,
    pub fallback_url: Option<String>,
    pub gateway_api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_iterations: Option<usize>,
    pub probe_timeout_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub system_prompt: Option<String>,
}

/// Context window tracking
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ContextFileConfig {
    pub window_size: Option<u32>,
    pub threshold: Option<f64>,
}

/// Speech output
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VoiceFileConfig {
    /// "local", "neural" or "cloud"
    pub engine: Option<String>,
    pub rate: Option<f32>,
    pub volume: Option<f32>,
    pub voice: Option<String>,
    pub neural_url: Option<String>,
    pub neural_model: Option<String>,
    pub cloud_api_key: Option<String>,
    pub cloud_model: Option<String>,
}

/// Tool executor service
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ToolsFileConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PathsFileConfig {
    pub data_dir: Option<String>,
    pub shared_config: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ParleyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ParleyConfigFile {
    config_file_path().map_or_else(ParleyConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_from(path: &Path) -> ParleyConfigFile {
    if !path.exists() {
        return ParleyConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ParleyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ParleyConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/parley/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Return the parley config directory: `~/.config/parley`
pub fn config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley"))
}
