//! Backend routing and the tool-calling loop
//!
//! The router probes the configured backends, picks one (or routes the
//! winner through the gateway to gain tools), and runs each user turn as a
//! bounded loop of completions and tool calls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};

use super::BackendKind;
use super::backend::{ChatBackend, ChatRequest, ChatResponse, OpenAiCompatBackend};
use super::context::{ContextTracker, ContextUsage};
use super::history::{ChatMessage, ConversationHistory};
use crate::config::{BackendsConfig, Config, ContextConfig, DEFAULT_PRIORITY, ModelSettings};
use crate::tools::{HttpToolExecutor, ToolCall, ToolDefinition, ToolExecutor};
use crate::{Error, Result};

/// Reply when the tool loop runs out of iterations
pub const APOLOGY: &str =
    "Sorry, I couldn't finish working that out. Could you try asking in a different way?";

/// Which backend answers and whether the gateway sits in front of it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendSelection {
    pub active: BackendKind,
    /// Requests go through the gateway, which adds tools
    pub routed: bool,
}

impl BackendSelection {
    /// Human-readable description of the routing
    #[must_use]
    pub fn describe(&self) -> String {
        match (self.active, self.routed) {
            (BackendKind::GatewayRouted, _) => "gateway, with tools".to_string(),
            (kind, true) => format!("{} through the gateway, with tools", kind.label()),
            (kind, false) => format!("{}, without tools", kind.label()),
        }
    }
}

/// Short spoken messages produced outside the reply itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// First backend selected
    Connected(BackendSelection),
    /// The active backend changed
    Switched { from: BackendKind, to: BackendKind },
    /// History was cleared to stay inside the context window
    ContextCleared,
}

impl Notice {
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Connected(selection) => format!("Connected to the {}.", selection.active.label()),
            Self::Switched { from, to } => {
                format!("Switching from the {} to the {}.", from.label(), to.label())
            }
            Self::ContextCleared => {
                "Our conversation was getting long, so I've cleared my memory of it.".to_string()
            }
        }
    }
}

/// Summary of one completed turn, for the turn log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRecord {
    pub backend: BackendKind,
    pub routed: bool,
    pub user_text: String,
    pub reply_text: String,
    /// Backend calls made during the turn
    pub iterations: usize,
    pub prompt_tokens: u32,
}

/// Routing and turn parameters
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub pinned: Option<BackendKind>,
    pub priority: Vec<BackendKind>,
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_iterations: usize,
    pub system_prompt: String,
    pub window_size: u32,
    pub threshold: f64,
}

impl RouterOptions {
    #[must_use]
    pub fn from_config(backends: &BackendsConfig, context: &ContextConfig) -> Self {
        Self {
            pinned: backends.pinned,
            priority: if backends.priority.is_empty() {
                DEFAULT_PRIORITY.to_vec()
            } else {
                backends.priority.clone()
            },
            model: backends.model.clone(),
            temperature: backends.temperature,
            max_tokens: backends.max_tokens,
            max_iterations: backends.max_iterations.max(1),
            system_prompt: backends.system_prompt.clone(),
            window_size: context.window_size,
            threshold: context.threshold,
        }
    }
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self::from_config(&BackendsConfig::default(), &ContextConfig::default())
    }
}

/// Sends turns to the selected backend and resolves tool calls
pub struct BackendRouter {
    backends: HashMap<BackendKind, Arc<dyn ChatBackend>>,
    tools: Option<Arc<dyn ToolExecutor>>,
    tool_cache: Option<Vec<ToolDefinition>>,
    options: RouterOptions,
    history: ConversationHistory,
    tracker: ContextTracker,
    selection: Option<BackendSelection>,
    reachable: HashSet<BackendKind>,
    shared: Option<watch::Receiver<Option<ModelSettings>>>,
    overrides: Option<ModelSettings>,
    needs_probe: bool,
    notices: Option<mpsc::UnboundedSender<Notice>>,
    turns: Option<mpsc::UnboundedSender<TurnRecord>>,
}

impl BackendRouter {
    #[must_use]
    pub fn new(backends: Vec<Arc<dyn ChatBackend>>, options: RouterOptions) -> Self {
        let backends = backends.into_iter().map(|b| (b.kind(), b)).collect();
        Self {
            backends,
            tools: None,
            tool_cache: None,
            history: ConversationHistory::new(&options.system_prompt),
            tracker: ContextTracker::new(options.window_size, options.threshold),
            options,
            selection: None,
            reachable: HashSet::new(),
            shared: None,
            overrides: None,
            needs_probe: true,
            notices: None,
            turns: None,
        }
    }

    /// Build HTTP backends and the tool executor from configuration
    ///
    /// # Errors
    ///
    /// Returns error if no backend URL is configured or a client cannot be built
    pub fn from_config(config: &Config) -> Result<Self> {
        let cfg = &config.backends;
        let mut backends: Vec<Arc<dyn ChatBackend>> = Vec::new();
        for kind in DEFAULT_PRIORITY {
            let Some(url) = cfg.url_for(kind) else {
                continue;
            };
            let mut backend = OpenAiCompatBackend::new(kind, url, cfg.request_timeout)?
                .with_probe_timeout(cfg.probe_timeout);
            if kind == BackendKind::GatewayRouted {
                backend = backend.with_api_key(cfg.gateway_api_key.clone());
            }
            backends.push(Arc::new(backend));
        }
        if backends.is_empty() {
            return Err(Error::Config("no backend URLs configured".to_string()));
        }

        let mut router = Self::new(
            backends,
            RouterOptions::from_config(cfg, &config.context),
        );
        if let Some(url) = &config.tools.url {
            router = router.with_tools(Arc::new(HttpToolExecutor::new(
                url,
                config.tools.api_key.clone(),
            )));
        }
        Ok(router)
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self.tool_cache = None;
        self
    }

    /// Deliver announcements and eviction notices on `tx`
    #[must_use]
    pub fn with_notices(mut self, tx: mpsc::UnboundedSender<Notice>) -> Self {
        self.notices = Some(tx);
        self
    }

    /// Deliver a record of every completed turn on `tx`
    #[must_use]
    pub fn with_turn_log(mut self, tx: mpsc::UnboundedSender<TurnRecord>) -> Self {
        self.turns = Some(tx);
        self
    }

    /// Follow hot-reloaded model settings
    #[must_use]
    pub fn with_shared_settings(mut self, mut rx: watch::Receiver<Option<ModelSettings>>) -> Self {
        self.overrides = rx.borrow_and_update().clone();
        self.shared = Some(rx);
        self
    }

    /// Current selection, if a probe has succeeded
    #[must_use]
    pub const fn selection(&self) -> Option<BackendSelection> {
        self.selection
    }

    #[must_use]
    pub fn usage(&self) -> ContextUsage {
        self.tracker.usage()
    }

    #[must_use]
    pub const fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Backends that answered the last probe
    #[must_use]
    pub fn reachable(&self) -> Vec<BackendKind> {
        DEFAULT_PRIORITY
            .into_iter()
            .filter(|k| self.reachable.contains(k))
            .collect()
    }

    /// Backend the operator pinned; the shared file takes precedence
    fn pinned(&self) -> Option<BackendKind> {
        self.overrides
            .as_ref()
            .map_or(self.options.pinned, |s| s.provider.pinned())
    }

    fn model(&self) -> Option<String> {
        self.overrides
            .as_ref()
            .and_then(|s| s.model_id.clone())
            .or_else(|| self.options.model.clone())
    }

    fn temperature(&self) -> f32 {
        self.overrides
            .as_ref()
            .and_then(|s| s.temperature)
            .unwrap_or(self.options.temperature)
    }

    fn max_tokens(&self) -> u32 {
        self.overrides
            .as_ref()
            .and_then(|s| s.max_tokens)
            .unwrap_or(self.options.max_tokens)
    }

    /// Probe every backend in parallel and select one
    ///
    /// Returns a description of the active routing.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the pinned backend does not answer, or
    /// `NoBackendAvailable` if nothing answers in auto mode
    pub async fn probe_backends(&mut self) -> Result<String> {
        let probes = self.backends.values().map(|backend| {
            let backend = Arc::clone(backend);
            async move { (backend.kind(), backend.probe().await) }
        });
        self.reachable = join_all(probes)
            .await
            .into_iter()
            .filter_map(|(kind, up)| up.then_some(kind))
            .collect();
        self.needs_probe = false;

        let pinned = self.pinned();
        tracing::info!(
            reachable = ?self.reachable(),
            pinned = ?pinned,
            "backend probe complete"
        );

        let selection = match self.choose(pinned) {
            Ok(selection) => selection,
            Err(e) => {
                self.selection = None;
                return Err(e);
            }
        };
        self.adopt(selection).await;
        Ok(selection.describe())
    }

    /// Apply the selection rules to the last probe result
    fn choose(&self, pinned: Option<BackendKind>) -> Result<BackendSelection> {
        let active = match pinned {
            Some(kind) if self.reachable.contains(&kind) => kind,
            Some(kind) => {
                return Err(Error::BackendUnavailable {
                    backend: kind,
                    endpoint: self.backends.get(&kind).map_or_else(
                        || "(no URL configured)".to_string(),
                        |b| b.endpoint().to_string(),
                    ),
                });
            }
            None => self
                .options
                .priority
                .iter()
                .copied()
                .find(|k| self.reachable.contains(k))
                .ok_or(Error::NoBackendAvailable)?,
        };

        let routed = match active {
            BackendKind::GatewayRouted => true,
            BackendKind::LocalInference => self.reachable.contains(&BackendKind::GatewayRouted),
            BackendKind::RemoteFallback => false,
        };
        Ok(BackendSelection { active, routed })
    }

    /// Record a new selection, announcing it if the backend changed
    async fn adopt(&mut self, selection: BackendSelection) {
        let previous = self.selection.replace(selection);
        match previous {
            None => {
                tracing::info!(
                    backend = %selection.active,
                    routed = selection.routed,
                    "backend connected"
                );
                self.notify(Notice::Connected(selection));
            }
            Some(prev) if prev.active != selection.active => {
                tracing::info!(
                    from = %prev.active,
                    to = %selection.active,
                    routed = selection.routed,
                    "backend switched"
                );
                self.notify(Notice::Switched {
                    from: prev.active,
                    to: selection.active,
                });
            }
            Some(_) => {}
        }

        if previous.map(|p| p.active) != Some(selection.active) {
            self.discover_window(selection.active).await;
        }
    }

    async fn discover_window(&mut self, kind: BackendKind) {
        let Some(backend) = self.backends.get(&kind).cloned() else {
            return;
        };
        if let Some(window) = backend.context_window(self.model().as_deref()).await {
            self.tracker.set_window_size(window);
        }
    }

    /// Pick up changed shared settings; a provider change forces a re-probe
    fn refresh_settings(&mut self) {
        let Some(rx) = self.shared.as_mut() else {
            return;
        };
        if !rx.has_changed().unwrap_or(false) {
            return;
        }
        let settings = rx.borrow_and_update().clone();

        let before = self.pinned();
        self.overrides = settings;
        if self.pinned() != before {
            tracing::info!(from = ?before, to = ?self.pinned(), "provider changed, re-probing");
            self.needs_probe = true;
        }
    }

    /// Run one user turn and return the reply text
    ///
    /// Backend calls are capped at the configured iteration bound; running
    /// out yields [`APOLOGY`] rather than an error.
    ///
    /// # Errors
    ///
    /// Returns error if no backend can be reached
    pub async fn send(&mut self, user_text: &str) -> Result<String> {
        self.refresh_settings();
        if self.selection.is_none() || self.needs_probe {
            self.probe_backends().await?;
        }

        self.history.push(ChatMessage::user(user_text));

        let mut evict = false;
        let outcome = self.run_turn(&mut evict).await;

        let prompt_tokens = self.tracker.usage().prompt_tokens;
        // Applied after the turn so the tool exchange stays intact, even when it failed
        if evict {
            self.evict();
        }
        let (reply, iterations) = outcome?;

        if let (Some(tx), Some(selection)) = (&self.turns, self.selection) {
            let _ = tx.send(TurnRecord {
                backend: selection.active,
                routed: selection.routed,
                user_text: user_text.to_string(),
                reply_text: reply.clone(),
                iterations,
                prompt_tokens,
            });
        }

        Ok(reply)
    }

    /// The bounded tool loop; sets `evict` as soon as usage crosses the threshold
    async fn run_turn(&mut self, evict: &mut bool) -> Result<(String, usize)> {
        let mut iterations = 0;

        while iterations < self.options.max_iterations {
            iterations += 1;
            let response = self.complete_with_cascade().await?;

            if let Some(usage) = response.usage {
                *evict |= self.tracker.record_usage(usage);
            }

            if response.tool_calls.is_empty() {
                let text = response.content.unwrap_or_default();
                self.history.push(ChatMessage::assistant(&text));
                return Ok((text, iterations));
            }

            tracing::debug!(
                iteration = iterations,
                calls = response.tool_calls.len(),
                "backend requested tools"
            );
            self.history.push(ChatMessage::tool_request(
                response.content,
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let output = self.run_tool(call).await;
                self.history.push(ChatMessage::tool_result(&call.id, &output));
            }
        }

        tracing::warn!(iterations, "tool loop exhausted without a final answer");
        self.history.push(ChatMessage::assistant(APOLOGY));
        Ok((APOLOGY.to_string(), iterations))
    }

    /// Request a completion, moving down the priority list on failure in auto mode
    async fn complete_with_cascade(&mut self) -> Result<ChatResponse> {
        loop {
            let selection = self.selection.ok_or(Error::NoBackendAvailable)?;
            let transport = self.transport(selection)?;
            let request = self.build_request(selection).await;

            let error = match transport.complete(&request).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            tracing::warn!(backend = %transport.kind(), error = %error, "completion failed");

            if self.pinned().is_some() {
                return Err(error);
            }

            self.reachable.remove(&transport.kind());
            match self.choose(None) {
                Ok(next) => self.adopt(next).await,
                Err(e) => {
                    self.selection = None;
                    return Err(e);
                }
            }
        }
    }

    /// Backend that carries requests for `selection`
    fn transport(&self, selection: BackendSelection) -> Result<Arc<dyn ChatBackend>> {
        let kind = if selection.routed {
            BackendKind::GatewayRouted
        } else {
            selection.active
        };
        self.backends
            .get(&kind)
            .cloned()
            .ok_or(Error::NoBackendAvailable)
    }

    async fn build_request(&mut self, selection: BackendSelection) -> ChatRequest {
        let tools = if selection.routed {
            self.tool_definitions().await
        } else {
            None
        };
        let backend = (selection.routed && selection.active != BackendKind::GatewayRouted)
            .then(|| selection.active.as_str().to_string());

        ChatRequest {
            messages: self.history.to_request(),
            model: self.model(),
            tools,
            temperature: self.temperature(),
            max_tokens: self.max_tokens(),
            backend,
        }
    }

    /// Tool definitions, fetched once from the executor
    async fn tool_definitions(&mut self) -> Option<Vec<ToolDefinition>> {
        let executor = self.tools.as_ref()?;
        if self.tool_cache.is_none() {
            match executor.list_tools().await {
                Ok(definitions) => {
                    tracing::info!(count = definitions.len(), "tools available");
                    self.tool_cache = Some(definitions);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to list tools");
                    return None;
                }
            }
        }
        self.tool_cache.clone().filter(|d| !d.is_empty())
    }

    /// Run one tool call; failures become an error string for the backend
    async fn run_tool(&self, call: &ToolCall) -> String {
        let Some(executor) = &self.tools else {
            return "Error: no tool service is configured".to_string();
        };

        let name = &call.function.name;
        tracing::info!(tool = %name, id = %call.id, "running tool");
        match executor.call(name, &call.parsed_arguments()).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "tool failed");
                match e {
                    Error::Tool(message) => format!("Error: {message}"),
                    other => format!("Error: {other}"),
                }
            }
        }
    }

    /// Clear the conversation and restart context accounting
    fn evict(&mut self) {
        tracing::info!(
            messages = self.history.len(),
            window = self.tracker.window_size(),
            "evicting conversation history"
        );
        self.history.clear();
        self.tracker.reset();
        self.notify(Notice::ContextCleared);
    }

    /// Forget the conversation without a notice
    pub fn reset_conversation(&mut self) {
        self.history.clear();
        self.tracker.reset();
    }

    fn notify(&self, notice: Notice) {
        if let Some(tx) = &self.notices {
            let _ = tx.send(notice);
        }
    }
}
