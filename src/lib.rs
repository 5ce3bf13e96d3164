//! Parley - a voice interaction pipeline for language models
//!
//! Speech is captured by an external helper, turned into transcripts by the
//! capture state machine, answered by whichever LLM backend is reachable,
//! and spoken back through a pluggable synthesis engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │   Capture helper  ──▶  CaptureHandle (state machine) │
//! └────────────────────────┬─────────────────────────────┘
//!                          │ transcripts
//! ┌────────────────────────▼─────────────────────────────┐
//! │   BackendRouter                                      │
//! │   local  │  gateway (tools)  │  remote fallback      │
//! └────────────────────────┬─────────────────────────────┘
//!                          │ replies and notices
//! ┌────────────────────────▼─────────────────────────────┐
//! │   PlaybackCoordinator                                │
//! │   local synth  │  neural voice  │  cloud voice       │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod tools;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
