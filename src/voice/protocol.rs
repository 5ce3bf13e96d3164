//! Capture helper line protocol
//!
//! The helper writes one event per line on stdout:
//!
//! ```text
//! LEVEL:<0-100>
//! VOICE: | VOICE:1
//! STATUS:<text>
//! INTERIM:<text>
//! TRANSCRIPT:<text>
//! REJECTED
//! HEARTBEAT
//! ```

/// A single event emitted by the capture helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Input level in the range 0-100
    Level(u8),
    /// Voice activity reported by the helper's own detector
    VoiceDetected,
    /// Free-form helper status
    Status(String),
    /// Partial recognition result
    InterimTranscript(String),
    /// Final recognition result
    FinalTranscript(String),
    /// Recognizer gave up on the current segment
    Rejected,
    /// Liveness signal
    Heartbeat,
}

impl CaptureEvent {
    /// Classify one line of helper output
    ///
    /// Returns `None` for blank or unrecognized lines.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        match trimmed {
            "REJECTED" => return Some(Self::Rejected),
            "HEARTBEAT" => return Some(Self::Heartbeat),
            _ => {}
        }

        let (tag, payload) = trimmed.split_once(':')?;
        match tag {
            "LEVEL" => {
                let level = payload.trim().parse::<f32>().ok()?;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                Some(Self::Level(level.clamp(0.0, 100.0).round() as u8))
            }
            "VOICE" => match payload.trim() {
                "" | "1" => Some(Self::VoiceDetected),
                _ => None,
            },
            "STATUS" => Some(Self::Status(payload.trim().to_string())),
            "INTERIM" => Some(Self::InterimTranscript(payload.trim().to_string())),
            "TRANSCRIPT" => Some(Self::FinalTranscript(payload.trim().to_string())),
            _ => None,
        }
    }
}
