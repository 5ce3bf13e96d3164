//! Platform speech synthesizer (`say` on macOS, `espeak-ng` elsewhere)

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Notify;

use super::{EngineCapabilities, EngineKind, SpeechEngine, VoiceSettings};
use crate::{Error, Result};

/// Default speaking rate in words per minute for both synthesizers
const BASE_WPM: f32 = 175.0;

/// Command-line dialect of the synthesizer binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthFlavor {
    /// macOS `say`
    Say,
    /// `espeak-ng` / `espeak`
    Espeak,
}

/// Speaks through a local synthesizer subprocess
pub struct LocalSynth {
    program: PathBuf,
    flavor: SynthFlavor,
    stop: Notify,
}

impl LocalSynth {
    /// Find a synthesizer on `PATH`
    ///
    /// # Errors
    ///
    /// Returns error if no supported synthesizer is installed
    pub fn detect() -> Result<Self> {
        let candidates: &[(&str, SynthFlavor)] = if cfg!(target_os = "macos") {
            &[("say", SynthFlavor::Say), ("espeak-ng", SynthFlavor::Espeak)]
        } else {
            &[("espeak-ng", SynthFlavor::Espeak), ("espeak", SynthFlavor::Espeak)]
        };

        candidates
            .iter()
            .find_map(|(bin, flavor)| {
                which::which(bin)
                    .ok()
                    .map(|program| Self::with_program(program, *flavor))
            })
            .ok_or_else(|| Error::Tts("no local speech synthesizer found".to_string()))
    }

    /// Use a specific synthesizer binary
    #[must_use]
    pub fn with_program(program: PathBuf, flavor: SynthFlavor) -> Self {
        tracing::debug!(program = %program.display(), ?flavor, "local synthesizer");
        Self {
            program,
            flavor,
            stop: Notify::new(),
        }
    }
}

#[async_trait]
impl SpeechEngine for LocalSynth {
    fn kind(&self) -> EngineKind {
        EngineKind::Local
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            rate: true,
            volume: self.flavor == SynthFlavor::Espeak,
            voice: true,
        }
    }

    async fn speak(&self, text: &str, settings: &VoiceSettings) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(synth_args(self.flavor, settings))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tts(format!("failed to start synthesizer: {e}")))?;

        // Text goes over stdin so it can never be parsed as a flag
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(Error::Tts(format!("synthesizer exited with {status}")))
                }
            }
            () = self.stop.notified() => {
                let _ = child.kill().await;
                Err(Error::Cancelled)
            }
        }
    }

    fn stop(&self) {
        self.stop.notify_waiters();
    }

    async fn list_voices(&self) -> Result<Vec<String>> {
        let args: &[&str] = match self.flavor {
            SynthFlavor::Say => &["-v", "?"],
            SynthFlavor::Espeak => &["--voices"],
        };
        let output = Command::new(&self.program).args(args).output().await?;
        if !output.status.success() {
            return Err(Error::Tts(format!(
                "voice listing exited with {}",
                output.status
            )));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(match self.flavor {
            SynthFlavor::Say => parse_say_voices(&listing),
            SynthFlavor::Espeak => parse_espeak_voices(&listing),
        })
    }
}

/// Command-line flags for the given settings
fn synth_args(flavor: SynthFlavor, settings: &VoiceSettings) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(rate) = settings.rate {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let wpm = (BASE_WPM * rate.clamp(0.25, 4.0)).round() as u32;
        let flag = match flavor {
            SynthFlavor::Say => "-r",
            SynthFlavor::Espeak => "-s",
        };
        args.push(flag.to_string());
        args.push(wpm.to_string());
    }

    if let (SynthFlavor::Espeak, Some(volume)) = (flavor, settings.volume) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let amplitude = (volume.clamp(0.0, 1.0) * 200.0).round() as u32;
        args.push("-a".to_string());
        args.push(amplitude.to_string());
    }

    if let Some(voice) = &settings.voice {
        args.push("-v".to_string());
        args.push(voice.clone());
    }

    if flavor == SynthFlavor::Espeak {
        args.push("--stdin".to_string());
    }

    args
}

/// `say -v ?` prints `Name   locale   # sample`; names may contain spaces
fn parse_say_voices(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let name = line.split("  ").next()?.trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

/// Language codes from `espeak --voices`, the names `-v` accepts
///
/// The listing is a header row, then `Pty Language Age/Gender VoiceName ...`;
/// the descriptive `VoiceName` column is not a valid `-v` argument.
fn parse_espeak_voices(listing: &str) -> Vec<String> {
    listing
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1).map(ToString::to_string))
        .collect()
}
