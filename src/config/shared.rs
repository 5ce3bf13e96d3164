//! Shared model configuration
//!
//! A versioned JSON document shared with other tools on the machine:
//!
//! ```json
//! {"version": 1, "domains": {"voice": {"provider": "auto", "modelId": "qwen3-8b",
//!  "temperature": 0.7, "maxTokens": 512}}}
//! ```
//!
//! The file is watched and the `voice` domain is republished on every valid
//! change, so model switches apply without a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::watch;

use crate::agent::BackendKind;
use crate::{Error, Result};

/// Only document version understood
pub const SUPPORTED_VERSION: u32 = 1;

/// Domain read by the voice pipeline
pub const VOICE_DOMAIN: &str = "voice";

/// Backend choice from the shared file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ProviderChoice {
    #[default]
    Auto,
    Pinned(BackendKind),
}

impl TryFrom<String> for ProviderChoice {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Ok(match super::parse_backend_choice(&value)? {
            None => Self::Auto,
            Some(kind) => Self::Pinned(kind),
        })
    }
}

impl ProviderChoice {
    /// The pinned backend, if any
    #[must_use]
    pub const fn pinned(self) -> Option<BackendKind> {
        match self {
            Self::Auto => None,
            Self::Pinned(kind) => Some(kind),
        }
    }
}

/// Model settings for one domain
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSettings {
    #[serde(default)]
    pub provider: ProviderChoice,
    pub model_id: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// The whole shared document
#[derive(Debug, Clone, Deserialize)]
pub struct SharedConfig {
    pub version: u32,
    #[serde(default)]
    pub domains: HashMap<String, ModelSettings>,
}

impl SharedConfig {
    /// Parse and version-check a document
    ///
    /// # Errors
    ///
    /// Returns error on malformed JSON or an unsupported version
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        if config.version != SUPPORTED_VERSION {
            return Err(Error::Config(format!(
                "unsupported shared config version {} (expected {SUPPORTED_VERSION})",
                config.version
            )));
        }
        Ok(config)
    }

    /// Settings for the voice domain
    #[must_use]
    pub fn voice(&self) -> Option<&ModelSettings> {
        self.domains.get(VOICE_DOMAIN)
    }
}

/// Read the voice domain from `path`; a missing file yields `None`
///
/// # Errors
///
/// Returns error if the file exists but cannot be read or parsed
pub fn read_voice_settings(path: &Path) -> Result<Option<ModelSettings>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(SharedConfig::parse(&content)?.voice().cloned())
}

/// Re-read `path` and publish the voice settings if they changed
///
/// Invalid documents keep the previous settings. Returns whether a new
/// value was published.
pub fn reload(path: &Path, tx: &watch::Sender<Option<ModelSettings>>) -> bool {
    match read_voice_settings(path) {
        Ok(settings) => {
            let changed = tx.send_if_modified(|current| {
                if *current == settings {
                    false
                } else {
                    current.clone_from(&settings);
                    true
                }
            });
            if changed {
                tracing::info!(
                    path = %path.display(),
                    provider = ?settings.as_ref().map(|s| s.provider),
                    model = ?settings.as_ref().and_then(|s| s.model_id.as_deref()),
                    "shared model settings updated"
                );
            }
            changed
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "ignoring invalid shared config, keeping previous settings"
            );
            false
        }
    }
}

/// Watches the shared config file and publishes voice settings
pub struct SharedConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: watch::Receiver<Option<ModelSettings>>,
    path: PathBuf,
}

impl SharedConfigWatcher {
    /// Load `path` and start watching its directory
    ///
    /// # Errors
    ///
    /// Returns error if the watcher cannot be created or the directory watched
    pub fn start(path: &Path) -> Result<Self> {
        let initial = read_voice_settings(path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "invalid shared config");
            None
        });
        let (tx, rx) = watch::channel(initial);

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let file_name = path.file_name().map(ToOwned::to_owned);
        let target = path.to_path_buf();

        // Watch the directory: editors replace files rather than write in place
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let Ok(event) = res else {
                    return;
                };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                let touches_target = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(ToOwned::to_owned) == file_name);
                if touches_target {
                    reload(&target, &tx);
                }
            },
            Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %path.display(), "watching shared config");

        Ok(Self {
            _watcher: watcher,
            rx,
            path: path.to_path_buf(),
        })
    }

    /// Receive voice settings as they change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<ModelSettings>> {
        self.rx.clone()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "version": 1,
        "domains": {
            "voice": {"provider": "gateway", "modelId": "qwen3-8b", "temperature": 0.4, "maxTokens": 256},
            "chat": {"provider": "auto"}
        }
    }"#;

    #[test]
    fn parses_voice_domain() {
        let config = SharedConfig::parse(DOC).unwrap();
        let voice = config.voice().unwrap();
        assert_eq!(voice.provider, ProviderChoice::Pinned(BackendKind::GatewayRouted));
        assert_eq!(voice.model_id.as_deref(), Some("qwen3-8b"));
        assert_eq!(voice.max_tokens, Some(256));
    }

    #[test]
    fn rejects_unknown_version() {
        let err = SharedConfig::parse(r#"{"version": 2, "domains": {}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_unknown_provider() {
        let doc = r#"{"version": 1, "domains": {"voice": {"provider": "mainframe"}}}"#;
        assert!(SharedConfig::parse(doc).is_err());
    }

    #[test]
    fn missing_provider_is_auto() {
        let doc = r#"{"version": 1, "domains": {"voice": {"modelId": "m"}}}"#;
        let config = SharedConfig::parse(doc).unwrap();
        assert_eq!(config.voice().unwrap().provider, ProviderChoice::Auto);
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_voice_settings(&dir.path().join("models.json")).unwrap().is_none());
    }

    #[test]
    fn reload_publishes_changes_and_keeps_previous_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        let (tx, rx) = watch::channel(None);

        std::fs::write(&path, DOC).unwrap();
        assert!(reload(&path, &tx));
        assert_eq!(
            rx.borrow().as_ref().and_then(|s| s.model_id.clone()).as_deref(),
            Some("qwen3-8b")
        );

        // Same content publishes nothing
        assert!(!reload(&path, &tx));

        std::fs::write(&path, r#"{"version": 9}"#).unwrap();
        assert!(!reload(&path, &tx));
        assert!(rx.borrow().is_some());
    }
}
