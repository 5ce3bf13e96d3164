//! Configuration management
//!
//! Precedence: environment > `~/.config/parley/config.toml` > defaults.
//! Model settings that change at runtime live in a separate shared JSON
//! file, see [`shared`].

pub mod file;
pub mod shared;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::agent::BackendKind;
use crate::voice::{CaptureConfig, EngineKind};
use crate::{Error, Result};

pub use shared::{ModelSettings, ProviderChoice, SharedConfig, SharedConfigWatcher};

/// Default priority when auto-detecting a backend
pub const DEFAULT_PRIORITY: [BackendKind; 3] = [
    BackendKind::LocalInference,
    BackendKind::GatewayRouted,
    BackendKind::RemoteFallback,
];

const DEFAULT_SYSTEM_PROMPT: &str = "You are a voice assistant. Replies are spoken aloud, \
so answer in short plain sentences without markdown, lists, or code.";

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub capture: CaptureSettings,
    pub backends: BackendsConfig,
    pub context: ContextConfig,
    pub voice: VoiceConfig,
    pub tools: ToolsConfig,

    /// Path to data directory (turn log database)
    pub data_dir: PathBuf,

    /// Shared model settings file, watched for changes
    pub shared_config_path: Option<PathBuf>,
}

/// Capture helper process and state machine tuning
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Helper executable name or path, resolved on `PATH`
    pub helper: String,
    pub helper_args: Vec<String>,
    /// Send after silence following interim text
    pub continuous: bool,
    pub machine: CaptureConfig,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            helper: "parley-listen".to_string(),
            helper_args: Vec::new(),
            continuous: true,
            machine: CaptureConfig::default(),
        }
    }
}

/// LLM backend endpoints and turn limits
#[derive(Debug, Clone)]
pub struct BackendsConfig {
    /// Local inference server (OpenAI-compatible base URL)
    pub local_url: Option<String>,
    /// Tool-augmenting gateway
    pub gateway_url: Option<String>,
    /// Remote CLI-proxy fallback
    pub fallback_url: Option<String>,
    pub gateway_api_key: Option<SecretString>,

    /// Operator-pinned backend; `None` auto-detects
    pub pinned: Option<BackendKind>,
    pub priority: Vec<BackendKind>,

    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,

    /// Upper bound on backend calls per turn
    pub max_iterations: usize,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub system_prompt: String,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            local_url: Some("http://127.0.0.1:1234/v1".to_string()),
            gateway_url: Some("http://127.0.0.1:18789/v1".to_string()),
            fallback_url: Some("http://127.0.0.1:3456/v1".to_string()),
            gateway_api_key: None,
            pinned: None,
            priority: DEFAULT_PRIORITY.to_vec(),
            model: None,
            temperature: 0.7,
            max_tokens: 512,
            max_iterations: 3,
            probe_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(120),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl BackendsConfig {
    /// Base URL configured for `kind`
    #[must_use]
    pub fn url_for(&self, kind: BackendKind) -> Option<&str> {
        match kind {
            BackendKind::LocalInference => self.local_url.as_deref(),
            BackendKind::GatewayRouted => self.gateway_url.as_deref(),
            BackendKind::RemoteFallback => self.fallback_url.as_deref(),
        }
    }
}

/// Context window tracking
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Assumed window until backend metadata reveals the real one
    pub window_size: u32,
    /// Fraction of the window that triggers eviction
    pub threshold: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_size: 8192,
            threshold: 0.80,
        }
    }
}

/// Speech output configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub engine: EngineKind,
    pub rate: Option<f32>,
    pub volume: Option<f32>,
    pub voice: Option<String>,
    /// OpenAI-compatible speech server; the neural engine is disabled without it
    pub neural_url: Option<String>,
    pub neural_model: String,
    /// Cloud voice API key; the cloud engine is disabled without it
    pub cloud_api_key: Option<SecretString>,
    pub cloud_model: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Local,
            rate: None,
            volume: None,
            voice: None,
            neural_url: None,
            neural_model: "kokoro".to_string(),
            cloud_api_key: None,
            cloud_model: "eleven_turbo_v2_5".to_string(),
        }
    }
}

/// Tool executor service
#[derive(Debug, Clone, Default)]
pub struct ToolsConfig {
    /// Tool service base URL; tools are disabled without it
    pub url: Option<String>,
    pub api_key: Option<SecretString>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            backends: BackendsConfig::default(),
            context: ContextConfig::default(),
            voice: VoiceConfig::default(),
            tools: ToolsConfig::default(),
            data_dir: default_data_dir(),
            shared_config_path: file::config_dir().map(|d| d.join("models.json")),
        }
    }
}

impl Config {
    /// Load configuration from the config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if a value names an unknown backend or engine
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value names an unknown backend or engine
    #[allow(clippy::too_many_lines)]
    pub fn from_sources(
        fc: file::ParleyConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();
        let env_parse = |key: &str| env(key).and_then(|v| v.parse().ok());
        let ms = Duration::from_millis;

        // Capture (toml > default; helper also from env)
        let dc = defaults.capture.machine;
        let capture = CaptureSettings {
            helper: env("PARLEY_HELPER")
                .or(fc.capture.helper)
                .unwrap_or(defaults.capture.helper),
            helper_args: fc.capture.helper_args.unwrap_or_default(),
            continuous: fc.capture.continuous.unwrap_or(defaults.capture.continuous),
            machine: CaptureConfig {
                voice_threshold: fc.capture.voice_threshold.unwrap_or(dc.voice_threshold),
                silence_threshold: fc
                    .capture
                    .silence_threshold
                    .unwrap_or(dc.silence_threshold),
                silence_timeout: fc
                    .capture
                    .silence_timeout_ms
                    .map_or(dc.silence_timeout, ms),
                force_send_timeout: fc
                    .capture
                    .force_send_timeout_ms
                    .map_or(dc.force_send_timeout, ms),
                settle_delay: fc.capture.settle_delay_ms.map_or(dc.settle_delay, ms),
                grace_period: fc.capture.grace_period_ms.map_or(dc.grace_period, ms),
                promote_rejected: fc.capture.promote_rejected.unwrap_or(dc.promote_rejected),
                min_promote_chars: fc
                    .capture
                    .min_promote_chars
                    .unwrap_or(dc.min_promote_chars),
            },
        };

        // Backends (env > toml > default)
        let db = defaults.backends;
        let pinned = match env("PARLEY_BACKEND").or(fc.backends.backend) {
            Some(value) => parse_backend_choice(&value)?,
            None => None,
        };
        let priority = match fc.backends.priority {
            Some(names) => names
                .iter()
                .map(|n| n.parse())
                .collect::<Result<Vec<BackendKind>>>()?,
            None => db.priority,
        };
        let backends = BackendsConfig {
            local_url: endpoint(env("PARLEY_LOCAL_URL").or(fc.backends.local_url), db.local_url)?,
            gateway_url: endpoint(
                env("PARLEY_GATEWAY_URL").or(fc.backends.gateway_url),
                db.gateway_url,
            )?,
            fallback_url: endpoint(
                env("PARLEY_FALLBACK_URL").or(fc.backends.fallback_url),
                db.fallback_url,
            )?,
            gateway_api_key: env("PARLEY_GATEWAY_API_KEY")
                .or(fc.backends.gateway_api_key)
                .map(SecretString::from),
            pinned,
            priority,
            model: env("PARLEY_MODEL").or(fc.backends.model).or(db.model),
            temperature: fc.backends.temperature.unwrap_or(db.temperature),
            max_tokens: fc.backends.max_tokens.unwrap_or(db.max_tokens),
            max_iterations: fc
                .backends
                .max_iterations
                .unwrap_or(db.max_iterations)
                .max(1),
            probe_timeout: fc.backends.probe_timeout_ms.map_or(db.probe_timeout, ms),
            request_timeout: fc
                .backends
                .request_timeout_secs
                .map_or(db.request_timeout, Duration::from_secs),
            system_prompt: fc.backends.system_prompt.unwrap_or(db.system_prompt),
        };

        let context = ContextConfig {
            window_size: env_parse("PARLEY_CONTEXT_WINDOW")
                .or(fc.context.window_size)
                .unwrap_or(defaults.context.window_size),
            threshold: fc
                .context
                .threshold
                .unwrap_or(defaults.context.threshold)
                .clamp(0.05, 1.0),
        };

        // Voice (env > toml > default)
        let dv = defaults.voice;
        let engine = match env("PARLEY_TTS_ENGINE").or(fc.voice.engine) {
            Some(name) => name.parse()?,
            None => dv.engine,
        };
        let voice = VoiceConfig {
            engine,
            rate: fc.voice.rate.or(dv.rate),
            volume: fc.voice.volume.or(dv.volume),
            voice: fc.voice.voice.or(dv.voice),
            neural_url: endpoint(env("PARLEY_NEURAL_URL").or(fc.voice.neural_url), dv.neural_url)?,
            neural_model: fc.voice.neural_model.unwrap_or(dv.neural_model),
            cloud_api_key: env("ELEVENLABS_API_KEY")
                .or(fc.voice.cloud_api_key)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            cloud_model: fc.voice.cloud_model.unwrap_or(dv.cloud_model),
        };

        let tools = ToolsConfig {
            url: endpoint(env("PARLEY_TOOLS_URL").or(fc.tools.url), None)?,
            api_key: env("PARLEY_TOOLS_API_KEY")
                .or(fc.tools.api_key)
                .map(SecretString::from),
        };

        let data_dir = env("PARLEY_DATA_DIR")
            .or(fc.paths.data_dir)
            .map_or(defaults.data_dir, PathBuf::from);
        let shared_config_path = env("PARLEY_SHARED_CONFIG")
            .or(fc.paths.shared_config)
            .map(PathBuf::from)
            .or(defaults.shared_config_path);

        Ok(Self {
            capture,
            backends,
            context,
            voice,
            tools,
            data_dir,
            shared_config_path,
        })
    }

    /// Path to the turn log database
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("parley.db")
    }
}

/// `auto` (or empty) means no pin
fn parse_backend_choice(value: &str) -> Result<Option<BackendKind>> {
    match value.trim().to_lowercase().as_str() {
        "" | "auto" => Ok(None),
        other => other.parse().map(Some),
    }
}

/// An explicitly empty URL disables the endpoint
fn endpoint(configured: Option<String>, default: Option<String>) -> Result<Option<String>> {
    let url = match configured {
        Some(url) if url.trim().is_empty() => return Ok(None),
        Some(url) => url.trim().trim_end_matches('/').to_string(),
        None => return Ok(default),
    };
    let parsed = url::Url::parse(&url)
        .map_err(|e| Error::Config(format!("invalid endpoint URL {url}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::Config(format!("endpoint URL must be http(s): {url}")));
    }
    Ok(Some(url))
}

/// Default data directory: `~/.local/share/parley` on Linux
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/parley"),
        |d| d.data_dir().join("parley"),
    )
}
