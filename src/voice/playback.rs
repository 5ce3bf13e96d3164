//! Audio playback to speakers
//!
//! Network voice engines return encoded audio; it is decoded here, resampled
//! to the device rate, and played through an [`AudioSink`].

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Preferred output rate (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Resampler chunk size in frames
const RESAMPLE_CHUNK: usize = 1024;

/// Destination for decoded mono audio
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play mono samples, returning once playback finishes or is stopped
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if stopped, or an audio error if the device fails
    async fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<()>;

    /// Stop whatever is playing now
    fn stop(&self);
}

/// Plays audio to the default output device
pub struct AudioPlayback {
    config: StreamConfig,
    current: Mutex<Option<Arc<AtomicBool>>>,
}

impl AudioPlayback {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supports = |channels: u16| {
            move |c: &cpal::SupportedStreamConfigRange| {
                c.channels() == channels
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            }
        };

        let config = match device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(supports(1))
            .or_else(|| device.supported_output_configs().ok()?.find(supports(2)))
        {
            Some(range) => range.with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE)).config(),
            // Fall back to whatever the device prefers and resample to it
            None => device
                .default_output_config()
                .map_err(|e| Error::Audio(e.to_string()))?
                .config(),
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            config,
            current: Mutex::new(None),
        })
    }

    /// Output sample rate of the device stream
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Register a fresh stop flag, stopping any previous playback
    fn begin(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = current.replace(Arc::clone(&flag)) {
            previous.store(true, Ordering::SeqCst);
        }
        flag
    }
}

#[async_trait]
impl AudioSink for AudioPlayback {
    async fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let target_rate = self.sample_rate();
        let samples = if sample_rate == target_rate {
            samples
        } else {
            resample(&samples, sample_rate, target_rate)?
        };

        let stop = self.begin();
        let config = self.config.clone();
        let stopped = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || play_blocking(&config, samples, &stopped))
            .await
            .map_err(|e| Error::Audio(format!("playback task failed: {e}")))??;

        if stop.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn stop(&self) {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flag) = current.as_ref() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Play samples on the default device until done or stopped
fn play_blocking(config: &StreamConfig, samples: Vec<f32>, stop: &Arc<AtomicBool>) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let channels = usize::from(config.channels);
    let total = samples.len();
    let samples = Arc::new(samples);
    let position = Arc::new(AtomicUsize::new(0));

    let stream = {
        let samples = Arc::clone(&samples);
        let position = Arc::clone(&position);
        let stop = Arc::clone(stop);
        device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let halted = stop.load(Ordering::Relaxed);
                    for frame in data.chunks_mut(channels) {
                        let pos = position.load(Ordering::Relaxed);
                        let sample = if halted {
                            0.0
                        } else {
                            samples.get(pos).copied().unwrap_or(0.0)
                        };
                        frame.fill(sample);
                        if pos < samples.len() {
                            position.store(pos + 1, Ordering::Relaxed);
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?
    };

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let duration_ms = (total as u64 * 1000) / u64::from(config.sample_rate.0);
    let timeout = Duration::from_millis(duration_ms + 500);
    let start = Instant::now();

    while position.load(Ordering::Relaxed) < total && !stop.load(Ordering::Relaxed) {
        if start.elapsed() > timeout {
            tracing::warn!("playback timed out before the buffer drained");
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    if !stop.load(Ordering::Relaxed) {
        // Let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));
    }

    drop(stream);
    tracing::debug!(samples = total, "playback complete");
    Ok(())
}

/// Decode MP3 or WAV bytes into mono samples and their sample rate
///
/// # Errors
///
/// Returns error if the data cannot be decoded
pub fn decode_audio(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    if data.starts_with(b"RIFF") {
        decode_wav(data)
    } else {
        decode_mp3(data)
    }
}

/// Decode WAV bytes, downmixing to mono
fn decode_wav(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::new(Cursor::new(data)).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        hound::SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(e.to_string()))?
        }
    };

    Ok((downmix(&interleaved, channels), spec.sample_rate))
}

/// Decode MP3 bytes to f32 samples
fn decode_mp3(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(data));
    let mut samples = Vec::new();
    let mut sample_rate = PLAYBACK_SAMPLE_RATE;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(PLAYBACK_SAMPLE_RATE);
                let pcm: Vec<f32> = frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&pcm, frame.channels.max(1)));
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => {}
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok((samples, sample_rate))
}

/// Average interleaved channels into mono
#[allow(clippy::cast_precision_loss)]
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono audio using rubato
#[allow(clippy::cast_possible_truncation)]
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, RESAMPLE_CHUNK, 2, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let mut output = Vec::with_capacity(samples.len() * to_rate as usize / from_rate as usize + 1);

    for chunk in input.chunks(RESAMPLE_CHUNK) {
        // Pad the tail so no audio is dropped
        let mut frame = chunk.to_vec();
        frame.resize(RESAMPLE_CHUNK, 0.0);
        let result = resampler
            .process(&[frame], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend(result[0].iter().map(|&s| s as f32));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(samples: &[i16], channels: u16, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn decodes_stereo_wav_to_mono() {
        let data = wav_bytes(&[16384, 0, -16384, -16384], 2, 22050);
        let (samples, rate) = decode_audio(&data).unwrap();

        assert_eq!(rate, 22050);
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.25).abs() < 1e-3);
        assert!((samples[1] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn garbage_is_not_audio() {
        let (samples, _) = decode_audio(b"definitely not mp3").unwrap_or_default();
        assert!(samples.is_empty());
    }

    #[test]
    fn resampling_scales_length() {
        let input = vec![0.1_f32; 22050];
        let output = resample(&input, 22050, 24000).unwrap();
        // Padded final chunk adds at most one chunk of output
        assert!(output.len() >= 24000 - 1200, "got {}", output.len());
        assert!(output.len() <= 24000 + 1200, "got {}", output.len());
    }
}
