//! Capture state machine
//!
//! Drives the external capture helper, interprets its event stream, and
//! resolves utterances into transcripts. One task owns all state; the
//! cloneable [`CaptureHandle`] talks to it over a command channel, so every
//! transition is triggered either by a helper line or by a command.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::coordinator::PlaybackObserver;
use super::helper::{CaptureSource, HelperProcess};
use super::protocol::CaptureEvent;
use crate::{Error, Result};

/// Capture pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Not capturing
    Idle,
    /// Helper running, waiting for speech
    Listening,
    /// Voice activity detected
    Hearing,
    /// Recognizer is producing interim text
    Processing,
    /// Transcript delivered, grace period before listening again
    Sending,
    /// Suspended while synthesized speech plays
    Responding,
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Hearing => "hearing",
            Self::Processing => "processing",
            Self::Sending => "sending",
            Self::Responding => "responding",
        };
        f.write_str(name)
    }
}

/// Output delivered to the consumer of a capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutput {
    /// Voice activity started a new utterance
    VoiceDetected,
    /// An utterance resolved into text
    Transcript(String),
    /// The helper died outside a playback pause; capture is now idle
    HelperExited,
}

/// Capture thresholds and timers
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Level at or above which voice activity starts an utterance
    pub voice_threshold: u8,
    /// Level below which the input counts as silence
    pub silence_threshold: u8,
    /// Silence after interim text before the utterance is sent (continuous mode)
    pub silence_timeout: Duration,
    /// Hard cap on utterance length
    pub force_send_timeout: Duration,
    /// Delay before restarting the helper after playback ends
    pub settle_delay: Duration,
    /// Time spent in `Sending` before listening again
    pub grace_period: Duration,
    /// Promote pending interim text when the recognizer rejects a segment
    pub promote_rejected: bool,
    /// Minimum interim length (chars) eligible for promotion
    pub min_promote_chars: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            voice_threshold: 15,
            silence_threshold: 5,
            silence_timeout: Duration::from_millis(1500),
            force_send_timeout: Duration::from_secs(15),
            settle_delay: Duration::from_millis(500),
            grace_period: Duration::from_millis(300),
            promote_rejected: true,
            min_promote_chars: 1,
        }
    }
}

/// Commands accepted by the capture task
enum Command {
    Start {
        output: mpsc::UnboundedSender<CaptureOutput>,
        continuous: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Playback {
        playing: bool,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running capture state machine
#[derive(Clone)]
pub struct CaptureHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<CaptureState>,
}

impl CaptureHandle {
    /// Spawn the capture task
    ///
    /// The task ends (and kills any helper) once every handle is dropped.
    #[must_use]
    pub fn spawn(source: Arc<dyn CaptureSource>, config: CaptureConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(CaptureState::Idle);

        let machine = CaptureMachine {
            config,
            source,
            state_tx,
            session: None,
            helper: None,
            paused: false,
            utterance: None,
            resume_at: None,
            listen_at: None,
        };
        tokio::spawn(machine.run(commands_rx));

        Self {
            commands: commands_tx,
            state: state_rx,
        }
    }

    /// Start (or resume) capturing
    ///
    /// Outputs are delivered on `output`. In continuous mode an utterance is
    /// also sent after a period of silence following interim text.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyActive` if a session is running and not paused for
    /// playback, or a capture error if the helper cannot be started.
    pub async fn start_capture(
        &self,
        output: mpsc::UnboundedSender<CaptureOutput>,
        continuous: bool,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start {
                output,
                continuous,
                reply,
            })
            .await
            .map_err(|_| machine_gone())?;
        rx.await.map_err(|_| machine_gone())?
    }

    /// Stop capturing and return to idle; safe to call in any state
    pub async fn stop_capture(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Suspend (`true`) or resume (`false`) capture around audio playback
    pub async fn notify_playback_state(&self, playing: bool) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Playback { playing, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.state.clone()
    }
}

#[async_trait]
impl PlaybackObserver for CaptureHandle {
    async fn playback_changed(&self, playing: bool) {
        self.notify_playback_state(playing).await;
    }
}

fn machine_gone() -> Error {
    Error::Capture("capture machine is not running".to_string())
}

/// The consumer side of an active capture session
struct Session {
    output: mpsc::UnboundedSender<CaptureOutput>,
    continuous: bool,
}

/// An in-flight spoken segment
#[derive(Debug)]
struct Utterance {
    started_at: Instant,
    interim_text: String,
    silence_deadline: Option<Instant>,
    force_send_deadline: Option<Instant>,
}

impl Utterance {
    fn has_pending_text(&self) -> bool {
        !self.interim_text.trim().is_empty()
    }
}

struct CaptureMachine {
    config: CaptureConfig,
    source: Arc<dyn CaptureSource>,
    state_tx: watch::Sender<CaptureState>,
    session: Option<Session>,
    helper: Option<HelperProcess>,
    paused: bool,
    utterance: Option<Utterance>,
    resume_at: Option<Instant>,
    listen_at: Option<Instant>,
}

impl CaptureMachine {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                line = next_line(&mut self.helper) => match line {
                    Some(line) => self.handle_line(&line),
                    None => self.helper_exited(),
                },
                () = sleep_until(deadline) => self.fire_deadlines(Instant::now()),
            }
        }

        self.reset();
        tracing::debug!("capture machine shut down");
    }

    fn state(&self) -> CaptureState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: CaptureState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "capture state");
        }
    }

    fn emit(&self, output: CaptureOutput) {
        if let Some(session) = &self.session {
            if session.output.send(output).is_err() {
                tracing::debug!("capture output receiver dropped");
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let utterance = self
            .utterance
            .iter()
            .flat_map(|u| [u.silence_deadline, u.force_send_deadline]);
        [self.resume_at, self.listen_at]
            .into_iter()
            .chain(utterance)
            .flatten()
            .min()
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                output,
                continuous,
                reply,
            } => {
                let _ = reply.send(self.start(output, continuous));
            }
            Command::Stop { reply } => {
                if self.session.is_some() {
                    tracing::info!("capture stopped");
                }
                self.reset();
                let _ = reply.send(());
            }
            Command::Playback { playing, reply } => {
                if playing {
                    self.pause();
                } else {
                    self.schedule_resume();
                }
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self, output: mpsc::UnboundedSender<CaptureOutput>, continuous: bool) -> Result<()> {
        if self.session.is_some() && !self.paused {
            return Err(Error::AlreadyActive);
        }

        if self.paused {
            // Resumes when playback ends
            self.session = Some(Session { output, continuous });
            self.set_state(CaptureState::Responding);
            tracing::info!(continuous, "capture armed, waiting for playback to end");
            return Ok(());
        }

        let helper = self.source.spawn()?;
        self.helper = Some(helper);
        self.session = Some(Session { output, continuous });
        self.set_state(CaptureState::Listening);
        tracing::info!(continuous, "capture started");
        Ok(())
    }

    fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.resume_at = None;
        self.listen_at = None;
        self.utterance = None;
        if let Some(helper) = self.helper.take() {
            helper.kill();
        }
        if self.session.is_some() {
            self.set_state(CaptureState::Responding);
            tracing::debug!("capture paused for playback");
        }
    }

    fn schedule_resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        if self.session.is_some() {
            self.resume_at = Some(Instant::now() + self.config.settle_delay);
            tracing::debug!(
                settle_ms = self.config.settle_delay.as_millis(),
                "capture resuming after settle delay"
            );
        }
    }

    fn resume(&mut self) {
        if self.paused || self.session.is_none() {
            return;
        }
        match self.source.spawn() {
            Ok(helper) => {
                self.helper = Some(helper);
                self.set_state(CaptureState::Listening);
                tracing::debug!("capture resumed");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to restart capture helper after playback");
                self.emit(CaptureOutput::HelperExited);
                self.reset();
            }
        }
    }

    fn helper_exited(&mut self) {
        self.helper = None;
        if self.paused || self.session.is_none() {
            return;
        }
        tracing::warn!("capture helper exited unexpectedly, resetting");
        self.emit(CaptureOutput::HelperExited);
        self.reset();
    }

    /// Full reset to idle: no helper, no session, no timers
    fn reset(&mut self) {
        if let Some(helper) = self.helper.take() {
            helper.kill();
        }
        self.session = None;
        self.utterance = None;
        self.resume_at = None;
        self.listen_at = None;
        self.set_state(CaptureState::Idle);
    }

    fn fire_deadlines(&mut self, now: Instant) {
        if self.resume_at.is_some_and(|at| at <= now) {
            self.resume_at = None;
            self.resume();
        }

        if self.listen_at.is_some_and(|at| at <= now) {
            self.listen_at = None;
            if self.session.is_some() && self.helper.is_some() {
                self.set_state(CaptureState::Listening);
            } else if !self.paused {
                self.set_state(CaptureState::Idle);
            }
        }

        let Some(utterance) = &self.utterance else {
            return;
        };
        let silence = utterance.silence_deadline.is_some_and(|at| at <= now);
        let forced = utterance.force_send_deadline.is_some_and(|at| at <= now);
        if silence || forced {
            tracing::debug!(
                trigger = if silence { "silence" } else { "force_send" },
                elapsed_ms = now.duration_since(utterance.started_at).as_millis(),
                "utterance deadline fired"
            );
            let text = utterance.interim_text.clone();
            self.finalize(text);
        }
    }

    fn handle_line(&mut self, line: &str) {
        let Some(event) = CaptureEvent::parse(line) else {
            tracing::trace!(line, "ignoring unrecognized capture line");
            return;
        };

        let state = self.state();
        if matches!(
            state,
            CaptureState::Idle | CaptureState::Responding | CaptureState::Sending
        ) {
            tracing::trace!(?event, %state, "ignoring capture event");
            return;
        }

        let continuous = self.session.as_ref().is_some_and(|s| s.continuous);

        match event {
            CaptureEvent::Level(level) => {
                if state == CaptureState::Listening && level >= self.config.voice_threshold {
                    self.begin_voice();
                } else if level < self.config.silence_threshold && continuous {
                    let timeout = self.config.silence_timeout;
                    if let Some(utterance) = self.utterance.as_mut() {
                        if utterance.has_pending_text() {
                            utterance.silence_deadline = Some(Instant::now() + timeout);
                        }
                    }
                }
            }
            CaptureEvent::VoiceDetected => {
                if state == CaptureState::Listening {
                    self.begin_voice();
                }
            }
            CaptureEvent::Status(status) => {
                tracing::debug!(status = %status, "capture helper status");
            }
            CaptureEvent::InterimTranscript(text) => {
                self.ensure_utterance();
                let timeout = self.config.silence_timeout;
                if let Some(utterance) = self.utterance.as_mut() {
                    if !text.is_empty() {
                        utterance.interim_text = text;
                    }
                    if continuous {
                        utterance.silence_deadline = Some(Instant::now() + timeout);
                    }
                }
                self.set_state(CaptureState::Processing);
            }
            CaptureEvent::FinalTranscript(text) => {
                let text = if text.trim().is_empty() {
                    self.utterance
                        .as_ref()
                        .map(|u| u.interim_text.clone())
                        .unwrap_or_default()
                } else {
                    text
                };
                self.finalize(text);
            }
            CaptureEvent::Rejected => self.rejected(),
            CaptureEvent::Heartbeat => tracing::trace!("capture helper heartbeat"),
        }
    }

    fn begin_voice(&mut self) {
        self.ensure_utterance();
        self.set_state(CaptureState::Hearing);
    }

    fn ensure_utterance(&mut self) {
        let now = Instant::now();
        let force_send = now + self.config.force_send_timeout;
        if let Some(utterance) = self.utterance.as_mut() {
            utterance.force_send_deadline.get_or_insert(force_send);
            return;
        }

        self.utterance = Some(Utterance {
            started_at: now,
            interim_text: String::new(),
            silence_deadline: None,
            force_send_deadline: Some(force_send),
        });
        self.emit(CaptureOutput::VoiceDetected);
    }

    fn rejected(&mut self) {
        let promotable = self.utterance.as_ref().and_then(|u| {
            let text = u.interim_text.trim();
            (self.config.promote_rejected
                && !text.is_empty()
                && text.chars().count() >= self.config.min_promote_chars)
                .then(|| text.to_string())
        });

        if let Some(text) = promotable {
            tracing::debug!(text = %text, "recognizer rejected segment, promoting interim text");
            self.finalize(text);
        } else {
            self.utterance = None;
            self.set_state(CaptureState::Listening);
        }
    }

    /// Resolve the current utterance; clears both deadlines at once
    fn finalize(&mut self, text: String) {
        self.utterance = None;
        let text = text.trim().to_string();
        if text.is_empty() {
            self.set_state(CaptureState::Listening);
            return;
        }

        tracing::info!(transcript = %text, "utterance resolved");
        self.set_state(CaptureState::Sending);
        self.emit(CaptureOutput::Transcript(text));
        self.listen_at = Some(Instant::now() + self.config.grace_period);
    }
}

async fn next_line(helper: &mut Option<HelperProcess>) -> Option<String> {
    match helper {
        Some(helper) => helper.next_line().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
