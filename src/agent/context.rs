//! Context window tracking
//!
//! Usage reported by the backend is compared against the model's window.
//! Crossing the threshold asks the owner to evict: the whole history is
//! cleared and counting restarts from zero.

use serde::{Deserialize, Serialize};

/// Token usage as reported by a backend response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Snapshot of context consumption
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub window_size: u32,
    /// `prompt_tokens / window_size`
    pub percentage: f64,
}

#[derive(Debug, Clone)]
pub struct ContextTracker {
    window_size: u32,
    threshold: f64,
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
    /// Set once the threshold is crossed, until the next eviction
    eviction_requested: bool,
}

impl ContextTracker {
    #[must_use]
    pub fn new(window_size: u32, threshold: f64) -> Self {
        Self {
            window_size: window_size.max(1),
            threshold,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            eviction_requested: false,
        }
    }

    /// Record usage from one response
    ///
    /// The prompt size is a high-water mark: every request carries the whole
    /// history, so the largest prompt seen is the current footprint. Returns
    /// `true` exactly once per threshold crossing.
    pub fn record_usage(&mut self, usage: TokenUsage) -> bool {
        self.prompt_tokens = self.prompt_tokens.max(usage.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(usage.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(usage.total_tokens);

        let percentage = self.percentage();
        tracing::debug!(
            prompt = self.prompt_tokens,
            window = self.window_size,
            percentage = format!("{:.1}", percentage * 100.0),
            "context usage"
        );

        if percentage >= self.threshold && !self.eviction_requested {
            self.eviction_requested = true;
            tracing::info!(
                prompt = self.prompt_tokens,
                window = self.window_size,
                "context threshold crossed"
            );
            return true;
        }
        false
    }

    /// Adopt the window size discovered from backend metadata
    pub fn set_window_size(&mut self, window_size: u32) {
        if window_size == 0 || window_size == self.window_size {
            return;
        }
        tracing::info!(
            previous = self.window_size,
            window = window_size,
            "context window updated"
        );
        self.window_size = window_size;
    }

    /// Reset all counters after the history was cleared
    pub fn reset(&mut self) {
        self.prompt_tokens = 0;
        self.completion_tokens = 0;
        self.total_tokens = 0;
        self.eviction_requested = false;
    }

    #[must_use]
    pub const fn window_size(&self) -> u32 {
        self.window_size
    }

    #[must_use]
    pub fn percentage(&self) -> f64 {
        f64::from(self.prompt_tokens) / f64::from(self.window_size)
    }

    #[must_use]
    pub fn usage(&self) -> ContextUsage {
        ContextUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            window_size: self.window_size,
            percentage: self.percentage(),
        }
    }
}
