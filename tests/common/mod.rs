//! Shared test doubles
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use parley::agent::{BackendKind, ChatBackend, ChatRequest, ChatResponse, TokenUsage};
use parley::tools::{ToolCall, ToolDefinition, ToolExecutor};
use parley::voice::{
    CaptureSource, EngineCapabilities, EngineKind, HelperProcess, PlaybackObserver, SpeechEngine,
    VoiceSettings,
};
use parley::{Error, Result};

/// Capture source whose helpers are fed by the test
#[derive(Default)]
pub struct ScriptedSource {
    helpers: Mutex<Vec<mpsc::Sender<String>>>,
}

impl ScriptedSource {
    /// Number of helpers spawned so far
    pub fn spawned(&self) -> usize {
        self.helpers.lock().unwrap().len()
    }

    /// Write one line to the most recent helper's stdout
    pub async fn line(&self, line: &str) {
        let tx = self.helpers.lock().unwrap().last().cloned().unwrap();
        // The helper may already be gone; that's what some tests check
        let _ = tx.send(line.to_string()).await;
    }

    /// Simulate the most recent helper exiting
    pub fn crash(&self) {
        if let Some(tx) = self.helpers.lock().unwrap().last_mut() {
            let (closed, _) = mpsc::channel(1);
            *tx = closed;
        }
    }
}

impl CaptureSource for ScriptedSource {
    fn spawn(&self) -> Result<HelperProcess> {
        let (tx, rx) = mpsc::channel(64);
        self.helpers.lock().unwrap().push(tx);
        Ok(HelperProcess::detached(rx))
    }
}

/// One scripted backend reaction
#[derive(Debug, Clone)]
pub enum Step {
    Reply(ChatResponse),
    Unreachable,
    Fail,
}

/// Backend with a scripted probe result and responses
pub struct FakeBackend {
    kind: BackendKind,
    up: AtomicBool,
    script: Mutex<VecDeque<Step>>,
    fallback: Mutex<Step>,
    requests: Mutex<Vec<ChatRequest>>,
    window: Option<u32>,
}

impl FakeBackend {
    pub fn new(kind: BackendKind, up: bool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            up: AtomicBool::new(up),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Step::Reply(ChatResponse::text(&format!("hello from {kind}")))),
            requests: Mutex::new(Vec::new()),
            window: None,
        })
    }

    pub fn with_window(kind: BackendKind, window: u32) -> Arc<Self> {
        Arc::new(Self {
            kind,
            up: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Step::Reply(ChatResponse::text("ok"))),
            requests: Mutex::new(Vec::new()),
            window: Some(window),
        })
    }

    /// Queue a reaction for the next request
    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    /// Reaction once the queue is empty
    pub fn always(&self, step: Step) {
        *self.fallback.lock().unwrap() = step;
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn endpoint(&self) -> &str {
        "http://fake.invalid/v1"
    }

    async fn probe(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone());
        match step {
            Step::Reply(response) => Ok(response),
            Step::Unreachable => Err(Error::BackendUnavailable {
                backend: self.kind,
                endpoint: self.endpoint().to_string(),
            }),
            Step::Fail => Err(Error::Backend {
                backend: self.kind,
                message: "HTTP 500".to_string(),
            }),
        }
    }

    async fn context_window(&self, _model: Option<&str>) -> Option<u32> {
        self.window
    }
}

/// Response asking for one tool call
pub fn tool_call(id: &str, name: &str) -> ChatResponse {
    ChatResponse {
        content: None,
        tool_calls: vec![ToolCall::new(id, name, "{}")],
        usage: None,
    }
}

/// Text response carrying usage figures
pub fn text_with_usage(text: &str, prompt_tokens: u32) -> ChatResponse {
    ChatResponse {
        content: Some(text.to_string()),
        tool_calls: Vec::new(),
        usage: Some(TokenUsage {
            prompt_tokens,
            completion_tokens: 10,
            total_tokens: prompt_tokens + 10,
        }),
    }
}

/// Tool service with a `clock` tool that works and a `broken` tool that fails
#[derive(Default)]
pub struct FakeTools {
    calls: Mutex<Vec<String>>,
}

impl FakeTools {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for FakeTools {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        Ok(vec![
            ToolDefinition::function("clock", "Current time", serde_json::json!({"type": "object"})),
            ToolDefinition::function("broken", "Always fails", serde_json::json!({"type": "object"})),
        ])
    }

    async fn call(&self, name: &str, _arguments: &Value) -> Result<String> {
        self.calls.lock().unwrap().push(name.to_string());
        match name {
            "clock" => Ok("12:00".to_string()),
            _ => Err(Error::Tool("boom".to_string())),
        }
    }
}

/// Observer that records every playback notification
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<bool>>,
    start_delay: Duration,
}

impl RecordingObserver {
    /// Observer that takes `delay` to acknowledge playback starting
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            start_delay: delay,
        }
    }

    pub fn events(&self) -> Vec<bool> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlaybackObserver for RecordingObserver {
    async fn playback_changed(&self, playing: bool) {
        if playing {
            tokio::time::sleep(self.start_delay).await;
        }
        self.events.lock().unwrap().push(playing);
    }
}

/// Engine that "speaks" by sleeping
pub struct FakeEngine {
    kind: EngineKind,
    capabilities: EngineCapabilities,
    delay: Duration,
    fail: bool,
    spoken: Mutex<Vec<(String, VoiceSettings)>>,
    stops: AtomicUsize,
}

impl FakeEngine {
    pub fn new(kind: EngineKind, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            kind,
            capabilities: EngineCapabilities {
                rate: true,
                volume: true,
                voice: true,
            },
            delay,
            fail: false,
            spoken: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn failing(kind: EngineKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            capabilities: EngineCapabilities::default(),
            delay: Duration::ZERO,
            fail: true,
            spoken: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn with_capabilities(kind: EngineKind, capabilities: EngineCapabilities) -> Arc<Self> {
        Arc::new(Self {
            kind,
            capabilities,
            delay: Duration::ZERO,
            fail: false,
            spoken: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn spoken(&self) -> Vec<(String, VoiceSettings)> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechEngine for FakeEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    async fn speak(&self, text: &str, settings: &VoiceSettings) -> Result<()> {
        self.spoken
            .lock()
            .unwrap()
            .push((text.to_string(), settings.clone()));
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(Error::Tts("synthesizer crashed".to_string()));
        }
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    async fn list_voices(&self) -> Result<Vec<String>> {
        Ok(vec![format!("{}-default", self.kind)])
    }
}
