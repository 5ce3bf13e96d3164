//! Playback coordination
//!
//! Serializes speech requests across the available engines so that at most
//! one utterance plays at a time, and reports playback boundaries to the
//! capture side so the assistant never hears itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::{Mutex, oneshot};

use super::speech_text::clean_for_speech;
use super::tts::{EngineKind, SpeechEngine, VoiceSettings};
use crate::{Error, Result};

/// Receives playback start/end notifications
#[async_trait]
pub trait PlaybackObserver: Send + Sync {
    /// Called with `true` when audio starts and `false` once it has ended
    async fn playback_changed(&self, playing: bool);
}

/// Observer that ignores notifications (one-shot `say`, tests)
pub struct NoopObserver;

#[async_trait]
impl PlaybackObserver for NoopObserver {
    async fn playback_changed(&self, _playing: bool) {}
}

/// Lifecycle of one speech request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Queued,
    Playing,
    Done,
    Failed,
}

/// Snapshot of a speech request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSession {
    pub id: u64,
    pub engine: EngineKind,
    pub text: String,
    pub status: PlaybackStatus,
}

struct Active {
    id: u64,
    engine: Arc<dyn SpeechEngine>,
    cancel: oneshot::Sender<()>,
}

/// Owns the speech engines and plays one session at a time
pub struct PlaybackCoordinator {
    engines: HashMap<EngineKind, Arc<dyn SpeechEngine>>,
    preferred: RwLock<EngineKind>,
    settings: RwLock<VoiceSettings>,
    observer: Arc<dyn PlaybackObserver>,
    active: Mutex<Option<Active>>,
    last: std::sync::Mutex<Option<PlaybackSession>>,
    next_id: AtomicU64,
}

impl PlaybackCoordinator {
    /// Create a coordinator over `engines`, preferring `engine`
    #[must_use]
    pub fn new(
        engines: HashMap<EngineKind, Arc<dyn SpeechEngine>>,
        engine: EngineKind,
        settings: VoiceSettings,
        observer: Arc<dyn PlaybackObserver>,
    ) -> Self {
        Self {
            engines,
            preferred: RwLock::new(engine),
            settings: RwLock::new(settings),
            observer,
            active: Mutex::new(None),
            last: std::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Speak `text` on the preferred engine, replacing anything playing
    ///
    /// Returns once this session finishes. A session replaced by a newer
    /// `speak` or by [`Self::stop`] returns `Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns error if the engine is unavailable or synthesis fails
    pub async fn speak(&self, text: &str) -> Result<()> {
        let text = clean_for_speech(text);
        if text.is_empty() {
            return Ok(());
        }

        let kind = self.engine();
        let engine = self
            .engines
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Tts(format!("speech engine {kind} is not available")))?;
        let settings = self.settings().restricted_to(engine.capabilities());

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.record(id, kind, &text, PlaybackStatus::Queued);

        let (cancel, cancelled) = oneshot::channel();
        {
            // Observer calls happen under the lock so start and end never reorder
            let mut active = self.active.lock().await;
            let previous = active.replace(Active {
                id,
                engine: Arc::clone(&engine),
                cancel,
            });
            match previous {
                Some(prev) => {
                    tracing::debug!(replaced = prev.id, session = id, "interrupting playback");
                    let _ = prev.cancel.send(());
                    prev.engine.stop();
                }
                None => self.observer.playback_changed(true).await,
            }
        }

        tracing::debug!(session = id, engine = %kind, chars = text.len(), "speaking");
        self.record(id, kind, &text, PlaybackStatus::Playing);

        let result = tokio::select! {
            result = engine.speak(&text, &settings) => result,
            _ = cancelled => Err(Error::Cancelled),
        };

        // Only the session still on record ends playback
        {
            let mut active = self.active.lock().await;
            if active.as_ref().is_some_and(|a| a.id == id) {
                active.take();
                self.observer.playback_changed(false).await;
            }
        }

        let status = if result.is_ok() {
            PlaybackStatus::Done
        } else {
            PlaybackStatus::Failed
        };
        self.record(id, kind, &text, status);

        if let Err(e) = &result
            && !matches!(e, Error::Cancelled)
        {
            tracing::warn!(session = id, engine = %kind, error = %e, "speech failed");
        }
        result
    }

    /// Stop the active session, if any, and report playback ended
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        if let Some(session) = active.take() {
            tracing::debug!(session = session.id, "stopping playback");
            let _ = session.cancel.send(());
            session.engine.stop();
            self.observer.playback_changed(false).await;
        }
    }

    /// Whether a session is playing
    pub async fn is_playing(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Select the engine for subsequent `speak` calls
    pub fn set_engine(&self, engine: EngineKind) {
        *self.preferred.write().unwrap_or_else(PoisonError::into_inner) = engine;
        tracing::info!(engine = %engine, "speech engine selected");
    }

    /// The engine the next `speak` call will use
    #[must_use]
    pub fn engine(&self) -> EngineKind {
        *self.preferred.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace voice settings for subsequent `speak` calls
    pub fn set_settings(&self, settings: VoiceSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    #[must_use]
    pub fn settings(&self) -> VoiceSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Engines that initialized successfully
    #[must_use]
    pub fn available_engines(&self) -> Vec<EngineKind> {
        let mut kinds: Vec<_> = self.engines.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// Most recent session, with its latest status
    #[must_use]
    pub fn last_session(&self) -> Option<PlaybackSession> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Voices offered by `engine`
    ///
    /// # Errors
    ///
    /// Returns error if the engine is unavailable or cannot be queried
    pub async fn list_voices(&self, engine: EngineKind) -> Result<Vec<String>> {
        let engine = self
            .engines
            .get(&engine)
            .ok_or_else(|| Error::Tts(format!("speech engine {engine} is not available")))?;
        engine.list_voices().await
    }

    fn record(&self, id: u64, engine: EngineKind, text: &str, status: PlaybackStatus) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        // An older session finishing late must not overwrite a newer one
        if last.as_ref().is_some_and(|s| s.id > id) {
            return;
        }
        *last = Some(PlaybackSession {
            id,
            engine,
            text: text.to_string(),
            status,
        });
    }
}
