//! Language-model side of the pipeline
//!
//! Backends, conversation history, context tracking, and the router that
//! ties them together with the tool-calling loop.

mod backend;
mod context;
mod history;
mod router;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use backend::{ChatBackend, ChatRequest, ChatResponse, OpenAiCompatBackend, window_from_metadata};
pub use context::{ContextTracker, ContextUsage, TokenUsage};
pub use history::{ChatMessage, ConversationHistory, Role};
pub use router::{
    APOLOGY, BackendRouter, BackendSelection, Notice, RouterOptions, TurnRecord,
};

/// Interchangeable sources of completions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Local inference server (LM Studio, Ollama, llama.cpp)
    #[serde(rename = "local")]
    LocalInference,
    /// Gateway that adds tool support and can route to other providers
    #[serde(rename = "gateway")]
    GatewayRouted,
    /// Remote CLI-proxy fallback
    #[serde(rename = "fallback")]
    RemoteFallback,
}

impl BackendKind {
    /// Short identifier used in config, logs, and the gateway `backend` field
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalInference => "local",
            Self::GatewayRouted => "gateway",
            Self::RemoteFallback => "fallback",
        }
    }

    /// Name used when speaking to the user
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::LocalInference => "local model",
            Self::GatewayRouted => "gateway",
            Self::RemoteFallback => "remote fallback",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" | "local_inference" | "lmstudio" | "ollama" => Ok(Self::LocalInference),
            "gateway" | "gateway_routed" => Ok(Self::GatewayRouted),
            "fallback" | "remote" | "remote_fallback" | "proxy" => Ok(Self::RemoteFallback),
            other => Err(Error::Config(format!("unknown backend: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::LocalInference);
        assert_eq!("Ollama".parse::<BackendKind>().unwrap(), BackendKind::LocalInference);
        assert_eq!("gateway".parse::<BackendKind>().unwrap(), BackendKind::GatewayRouted);
        assert_eq!("proxy".parse::<BackendKind>().unwrap(), BackendKind::RemoteFallback);
        assert!("auto".parse::<BackendKind>().is_err());
    }

    #[test]
    fn serde_uses_short_names() {
        let json = serde_json::to_string(&BackendKind::RemoteFallback).unwrap();
        assert_eq!(json, "\"fallback\"");
    }
}
