//! Capture state machine integration tests
//!
//! Runs against scripted helpers on a paused clock; no audio hardware needed.

use std::sync::Arc;
use std::time::Duration;

use parley::Error;
use parley::voice::{CaptureConfig, CaptureHandle, CaptureOutput, CaptureState};
use tokio::sync::mpsc;

mod common;
use common::ScriptedSource;

fn spawn(config: CaptureConfig) -> (Arc<ScriptedSource>, CaptureHandle) {
    let source = Arc::new(ScriptedSource::default());
    let capture = CaptureHandle::spawn(source.clone(), config);
    (source, capture)
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn drain(rx: &mut mpsc::UnboundedReceiver<CaptureOutput>) -> Vec<CaptureOutput> {
    let mut out = Vec::new();
    while let Ok(output) = rx.try_recv() {
        out.push(output);
    }
    out
}

fn transcripts(outputs: &[CaptureOutput]) -> Vec<String> {
    outputs
        .iter()
        .filter_map(|o| match o {
            CaptureOutput::Transcript(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_start_stop_start() {
    let (source, capture) = spawn(CaptureConfig::default());
    let (tx, _rx) = mpsc::unbounded_channel();

    capture.start_capture(tx.clone(), true).await.unwrap();
    assert_eq!(capture.state(), CaptureState::Listening);

    let err = capture.start_capture(tx.clone(), true).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyActive));

    capture.stop_capture().await;
    assert_eq!(capture.state(), CaptureState::Idle);

    capture.start_capture(tx, true).await.unwrap();
    assert_eq!(capture.state(), CaptureState::Listening);
    assert_eq!(source.spawned(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_silence_sends_once() {
    let (source, capture) = spawn(CaptureConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start_capture(tx, true).await.unwrap();

    source.line("INTERIM:what time is it").await;
    advance(1).await;
    assert_eq!(capture.state(), CaptureState::Processing);

    // Silence timeout fires first and clears the force-send deadline
    advance(1_600).await;
    advance(20_000).await;

    let outputs = drain(&mut rx);
    assert_eq!(outputs[0], CaptureOutput::VoiceDetected);
    assert_eq!(transcripts(&outputs), vec!["what time is it"]);
    assert_eq!(capture.state(), CaptureState::Listening);
}

#[tokio::test(start_paused = true)]
async fn test_force_send_caps_utterance() {
    let (source, capture) = spawn(CaptureConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    // Push-to-talk: no silence timer
    capture.start_capture(tx, false).await.unwrap();

    source.line("VOICE:1").await;
    source.line("INTERIM:a very long ramble").await;
    advance(10_000).await;
    assert!(transcripts(&drain(&mut rx)).is_empty());

    advance(6_000).await;
    advance(20_000).await;
    assert_eq!(transcripts(&drain(&mut rx)), vec!["a very long ramble"]);
}

#[tokio::test(start_paused = true)]
async fn test_final_transcript_wins_over_timers() {
    let (source, capture) = spawn(CaptureConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start_capture(tx, true).await.unwrap();

    source.line("LEVEL:60").await;
    advance(1).await;
    assert_eq!(capture.state(), CaptureState::Hearing);

    source.line("INTERIM:turn on").await;
    source.line("TRANSCRIPT:turn on the lights").await;
    advance(1).await;
    assert_eq!(capture.state(), CaptureState::Sending);

    advance(30_000).await;
    assert_eq!(transcripts(&drain(&mut rx)), vec!["turn on the lights"]);
    assert_eq!(capture.state(), CaptureState::Listening);
}

#[tokio::test(start_paused = true)]
async fn test_empty_final_uses_interim() {
    let (source, capture) = spawn(CaptureConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start_capture(tx, false).await.unwrap();

    source.line("INTERIM:good morning").await;
    source.line("TRANSCRIPT:").await;
    advance(1).await;

    assert_eq!(transcripts(&drain(&mut rx)), vec!["good morning"]);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_segment_promotes_interim() {
    let (source, capture) = spawn(CaptureConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start_capture(tx, false).await.unwrap();

    source.line("INTERIM:play some jazz").await;
    source.line("REJECTED").await;
    advance(1).await;

    assert_eq!(transcripts(&drain(&mut rx)), vec!["play some jazz"]);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_segment_dropped_when_promotion_disabled() {
    let config = CaptureConfig {
        promote_rejected: false,
        ..CaptureConfig::default()
    };
    let (source, capture) = spawn(config);
    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start_capture(tx, false).await.unwrap();

    source.line("INTERIM:play some jazz").await;
    source.line("REJECTED").await;
    advance(1).await;
    assert_eq!(capture.state(), CaptureState::Listening);

    advance(30_000).await;
    assert!(transcripts(&drain(&mut rx)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_playback_pause_survives_helper_exit() {
    let (source, capture) = spawn(CaptureConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start_capture(tx, true).await.unwrap();

    capture.notify_playback_state(true).await;
    assert_eq!(capture.state(), CaptureState::Responding);

    source.crash();
    advance(100).await;
    assert_eq!(capture.state(), CaptureState::Responding);
    assert!(!drain(&mut rx).contains(&CaptureOutput::HelperExited));

    capture.notify_playback_state(false).await;
    // Still paused until the settle delay has passed
    assert_eq!(capture.state(), CaptureState::Responding);
    advance(600).await;
    assert_eq!(capture.state(), CaptureState::Listening);
    assert_eq!(source.spawned(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_events_ignored_while_responding() {
    let (source, capture) = spawn(CaptureConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start_capture(tx, true).await.unwrap();

    capture.notify_playback_state(true).await;
    source.line("TRANSCRIPT:echo of our own reply").await;
    advance(10).await;

    assert!(transcripts(&drain(&mut rx)).is_empty());
    assert_eq!(capture.state(), CaptureState::Responding);
}

#[tokio::test(start_paused = true)]
async fn test_helper_exit_resets_to_idle() {
    let (source, capture) = spawn(CaptureConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    capture.start_capture(tx.clone(), true).await.unwrap();

    source.crash();
    advance(10).await;

    assert_eq!(capture.state(), CaptureState::Idle);
    assert_eq!(drain(&mut rx), vec![CaptureOutput::HelperExited]);

    // A fresh start is allowed after the reset
    capture.start_capture(tx, true).await.unwrap();
    assert_eq!(capture.state(), CaptureState::Listening);
}

#[tokio::test(start_paused = true)]
async fn test_idle_ignores_playback_notifications() {
    let (source, capture) = spawn(CaptureConfig::default());

    capture.notify_playback_state(true).await;
    assert_eq!(capture.state(), CaptureState::Idle);
    capture.notify_playback_state(false).await;
    advance(2_000).await;

    assert_eq!(capture.state(), CaptureState::Idle);
    assert_eq!(source.spawned(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_during_playback_waits_for_resume() {
    let (source, capture) = spawn(CaptureConfig::default());
    let (tx, _rx) = mpsc::unbounded_channel();

    capture.notify_playback_state(true).await;
    capture.start_capture(tx, true).await.unwrap();
    assert_eq!(capture.state(), CaptureState::Responding);
    assert_eq!(source.spawned(), 0);

    capture.notify_playback_state(false).await;
    advance(600).await;
    assert_eq!(capture.state(), CaptureState::Listening);
    assert_eq!(source.spawned(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_resume() {
    let (source, capture) = spawn(CaptureConfig::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    capture.start_capture(tx, true).await.unwrap();

    capture.notify_playback_state(true).await;
    capture.notify_playback_state(false).await;
    capture.stop_capture().await;
    advance(2_000).await;

    assert_eq!(capture.state(), CaptureState::Idle);
    assert_eq!(source.spawned(), 1);
}
