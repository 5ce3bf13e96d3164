//! Voice pipeline
//!
//! Capture drives an external helper process and resolves utterances into
//! transcripts. Playback serializes synthesis across engines and pauses
//! capture while audio is playing.

mod capture;
mod coordinator;
mod helper;
mod playback;
mod protocol;
mod speech_text;
pub mod tts;

pub use capture::{CaptureConfig, CaptureHandle, CaptureOutput, CaptureState};
pub use coordinator::{
    NoopObserver, PlaybackCoordinator, PlaybackObserver, PlaybackSession, PlaybackStatus,
};
pub use helper::{CaptureSource, HelperProcess, ProcessCaptureSource};
pub use playback::{AudioPlayback, AudioSink, decode_audio};
pub use protocol::CaptureEvent;
pub use speech_text::clean_for_speech;
pub use tts::{EngineCapabilities, EngineKind, SpeechEngine, VoiceSettings, build_engines};
