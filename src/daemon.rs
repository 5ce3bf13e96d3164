//! Voice loop
//!
//! Wires the capture machine, the backend router, and playback together:
//! every transcript becomes one turn, and the reply (preceded by any
//! pending notices) is spoken while capture is paused.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::agent::{BackendRouter, Notice, TurnRecord};
use crate::config::{Config, SharedConfigWatcher};
use crate::db::{self, TurnRepo};
use crate::voice::{
    AudioPlayback, AudioSink, CaptureHandle, CaptureOutput, PlaybackCoordinator,
    ProcessCaptureSource, VoiceSettings, build_engines,
};
use crate::{Error, Result};

/// The running voice assistant
pub struct Daemon {
    config: Config,
    router: BackendRouter,
    notices: mpsc::UnboundedReceiver<Notice>,
    capture: CaptureHandle,
    playback: Arc<PlaybackCoordinator>,
    turn_logger: Option<JoinHandle<()>>,
    // Dropping the watcher stops hot reload
    _watcher: Option<SharedConfigWatcher>,
}

impl Daemon {
    /// Build every component from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the capture helper or audio output cannot be set up,
    /// or no backend is configured
    pub fn new(config: Config) -> Result<Self> {
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let mut router = BackendRouter::from_config(&config)?.with_notices(notice_tx);

        let turn_logger = match db::init(config.db_path()) {
            Ok(pool) => {
                let (turn_tx, turn_rx) = mpsc::unbounded_channel::<TurnRecord>();
                router = router.with_turn_log(turn_tx);
                Some(db::spawn_turn_logger(TurnRepo::new(pool), turn_rx))
            }
            Err(e) => {
                tracing::warn!(error = %e, "turn log disabled");
                None
            }
        };

        let watcher = start_watcher(&config);
        if let Some(watcher) = &watcher {
            router = router.with_shared_settings(watcher.subscribe());
        }

        let source =
            ProcessCaptureSource::new(&config.capture.helper, config.capture.helper_args.clone())?;
        let capture = CaptureHandle::spawn(Arc::new(source), config.capture.machine.clone());

        let playback = build_playback(&config, Arc::new(capture.clone()))?;

        Ok(Self {
            config,
            router,
            notices,
            capture,
            playback,
            turn_logger,
            _watcher: watcher,
        })
    }

    /// Run until Ctrl-C or until the capture helper dies
    ///
    /// # Errors
    ///
    /// Returns error if capture cannot be started
    pub async fn run(mut self) -> Result<()> {
        match self.router.probe_backends().await {
            Ok(routing) => tracing::info!(routing = %routing, "backend selected"),
            Err(e) => {
                tracing::warn!(error = %e, "no backend yet, will retry on first turn");
                self.say(&e.spoken()).await;
            }
        }
        self.speak_notices().await;

        let (output_tx, mut outputs) = mpsc::unbounded_channel();
        self.capture
            .start_capture(output_tx, self.config.capture.continuous)
            .await?;
        tracing::info!(helper = %self.config.capture.helper, "listening");

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            let output = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                output = outputs.recv() => output,
            };

            match output {
                Some(CaptureOutput::VoiceDetected) => tracing::debug!("voice detected"),
                Some(CaptureOutput::Transcript(text)) => {
                    tokio::select! {
                        _ = &mut shutdown => {
                            tracing::info!("shutdown requested");
                            break;
                        }
                        () = self.respond(&text) => {}
                    }
                }
                Some(CaptureOutput::HelperExited) => {
                    tracing::error!("capture helper exited, stopping");
                    break;
                }
                None => break,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Run one turn and speak the outcome
    async fn respond(&mut self, text: &str) {
        tracing::info!(transcript = %text, "heard");
        let reply = self.router.send(text).await;
        self.speak_notices().await;

        match reply {
            Ok(reply) => {
                tracing::info!(reply_len = reply.len(), "replying");
                self.say(&reply).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "turn failed");
                self.say(&e.spoken()).await;
            }
        }
    }

    async fn speak_notices(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            self.say(&notice.text()).await;
        }
    }

    async fn say(&self, text: &str) {
        match self.playback.speak(text).await {
            Ok(()) | Err(Error::Cancelled) => {}
            Err(e) => tracing::warn!(error = %e, "speech failed"),
        }
    }

    async fn shutdown(self) {
        self.capture.stop_capture().await;
        self.playback.stop().await;
        // Closing the turn channel lets the logger flush and exit
        drop(self.router);
        if let Some(logger) = self.turn_logger {
            let _ = logger.await;
        }
        tracing::info!("stopped");
    }
}

/// Build the playback coordinator over the default output device
///
/// # Errors
///
/// Returns error if no audio output device is available
pub fn build_playback(
    config: &Config,
    observer: Arc<dyn crate::voice::PlaybackObserver>,
) -> Result<Arc<PlaybackCoordinator>> {
    let sink: Arc<dyn AudioSink> = Arc::new(AudioPlayback::new()?);
    let engines = build_engines(&config.voice, &sink);
    if !engines.contains_key(&config.voice.engine) {
        tracing::warn!(engine = %config.voice.engine, "preferred speech engine unavailable");
    }

    let settings = VoiceSettings {
        rate: config.voice.rate,
        volume: config.voice.volume,
        voice: config.voice.voice.clone(),
    };
    Ok(Arc::new(PlaybackCoordinator::new(
        engines,
        config.voice.engine,
        settings,
        observer,
    )))
}

fn start_watcher(config: &Config) -> Option<SharedConfigWatcher> {
    let path = config.shared_config_path.as_ref()?;
    if !path.parent().is_some_and(std::path::Path::exists) {
        tracing::debug!(path = %path.display(), "shared config directory missing, hot reload off");
        return None;
    }
    match SharedConfigWatcher::start(path) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "failed to watch shared config");
            None
        }
    }
}
