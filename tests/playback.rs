//! Playback coordination integration tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley::Error;
use parley::voice::{
    CaptureConfig, CaptureHandle, CaptureState, EngineCapabilities, EngineKind,
    PlaybackCoordinator, PlaybackObserver, PlaybackStatus, SpeechEngine, VoiceSettings,
};
use tokio::sync::mpsc;

mod common;
use common::{FakeEngine, RecordingObserver, ScriptedSource};

fn coordinator(
    engines: &[&Arc<FakeEngine>],
    settings: VoiceSettings,
    observer: Arc<dyn PlaybackObserver>,
) -> Arc<PlaybackCoordinator> {
    let map: HashMap<EngineKind, Arc<dyn SpeechEngine>> = engines
        .iter()
        .map(|e| (e.kind(), Arc::clone(e) as Arc<dyn SpeechEngine>))
        .collect();
    let preferred = engines[0].kind();
    Arc::new(PlaybackCoordinator::new(map, preferred, settings, observer))
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_new_speech_replaces_current() {
    let engine = FakeEngine::new(EngineKind::Local, Duration::from_secs(10));
    let observer = Arc::new(RecordingObserver::default());
    let playback = coordinator(&[&engine], VoiceSettings::default(), observer.clone());

    let first = tokio::spawn({
        let playback = Arc::clone(&playback);
        async move { playback.speak("first reply").await }
    });
    advance(1).await;
    assert!(playback.is_playing().await);
    assert_eq!(observer.events(), vec![true]);

    let second = tokio::spawn({
        let playback = Arc::clone(&playback);
        async move { playback.speak("second reply").await }
    });
    advance(1).await;

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(engine.stops(), 1);
    // The hand-over never reports an end of playback in between
    assert_eq!(observer.events(), vec![true]);

    second.await.unwrap().unwrap();
    assert_eq!(observer.events(), vec![true, false]);

    let last = playback.last_session().unwrap();
    assert_eq!(last.text, "second reply");
    assert_eq!(last.status, PlaybackStatus::Done);
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_playback() {
    let engine = FakeEngine::new(EngineKind::Local, Duration::from_secs(10));
    let observer = Arc::new(RecordingObserver::default());
    let playback = coordinator(&[&engine], VoiceSettings::default(), observer.clone());

    let speaking = tokio::spawn({
        let playback = Arc::clone(&playback);
        async move { playback.speak("a long answer").await }
    });
    advance(1).await;

    playback.stop().await;
    assert!(matches!(speaking.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(observer.events(), vec![true, false]);
    assert!(!playback.is_playing().await);
    assert_eq!(playback.last_session().unwrap().status, PlaybackStatus::Failed);

    // Speaking again after a stop works normally
    playback.speak("short").await.unwrap();
    assert_eq!(observer.events(), vec![true, false, true, false]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_start_notification() {
    let engine = FakeEngine::new(EngineKind::Local, Duration::from_secs(10));
    let observer = Arc::new(RecordingObserver::with_start_delay(Duration::from_millis(50)));
    let playback = coordinator(&[&engine], VoiceSettings::default(), observer.clone());

    let speaking = tokio::spawn({
        let playback = Arc::clone(&playback);
        async move { playback.speak("a long answer").await }
    });
    advance(1).await;
    // The start notification is still being delivered
    assert!(observer.events().is_empty());

    playback.stop().await;
    assert_eq!(observer.events(), vec![true, false]);
    assert!(matches!(speaking.await.unwrap(), Err(Error::Cancelled)));
    assert!(!playback.is_playing().await);
}

#[tokio::test]
async fn test_failure_still_reports_end() {
    let engine = FakeEngine::failing(EngineKind::Neural);
    let observer = Arc::new(RecordingObserver::default());
    let playback = coordinator(&[&engine], VoiceSettings::default(), observer.clone());

    let err = playback.speak("hello").await.unwrap_err();
    assert!(matches!(err, Error::Tts(_)));
    assert_eq!(observer.events(), vec![true, false]);
    assert_eq!(playback.last_session().unwrap().status, PlaybackStatus::Failed);
}

#[tokio::test]
async fn test_unsupported_settings_dropped() {
    let engine = FakeEngine::with_capabilities(
        EngineKind::Local,
        EngineCapabilities {
            rate: true,
            volume: false,
            voice: false,
        },
    );
    let settings = VoiceSettings {
        rate: Some(1.2),
        volume: Some(0.5),
        voice: Some("Samantha".to_string()),
    };
    let playback = coordinator(&[&engine], settings, Arc::new(RecordingObserver::default()));

    playback.speak("hello").await.unwrap();

    let (_, applied) = &engine.spoken()[0];
    assert_eq!(applied.rate, Some(1.2));
    assert_eq!(applied.volume, None);
    assert_eq!(applied.voice, None);
}

#[tokio::test]
async fn test_engine_change_applies_to_next_speak() {
    let local = FakeEngine::new(EngineKind::Local, Duration::ZERO);
    let neural = FakeEngine::new(EngineKind::Neural, Duration::ZERO);
    let playback = coordinator(
        &[&local, &neural],
        VoiceSettings::default(),
        Arc::new(RecordingObserver::default()),
    );

    playback.speak("one").await.unwrap();
    playback.set_engine(EngineKind::Neural);
    playback.speak("two").await.unwrap();

    assert_eq!(local.spoken().len(), 1);
    assert_eq!(neural.spoken()[0].0, "two");
    assert_eq!(playback.last_session().unwrap().engine, EngineKind::Neural);
    assert_eq!(
        playback.available_engines(),
        vec![EngineKind::Local, EngineKind::Neural]
    );
}

#[tokio::test]
async fn test_missing_engine_is_an_error() {
    let local = FakeEngine::new(EngineKind::Local, Duration::ZERO);
    let observer = Arc::new(RecordingObserver::default());
    let playback = coordinator(&[&local], VoiceSettings::default(), observer.clone());

    playback.set_engine(EngineKind::Cloud);
    assert!(matches!(playback.speak("hi").await, Err(Error::Tts(_))));
    assert!(observer.events().is_empty());
    assert!(playback.list_voices(EngineKind::Cloud).await.is_err());
    assert_eq!(
        playback.list_voices(EngineKind::Local).await.unwrap(),
        vec!["local-default"]
    );
}

#[tokio::test]
async fn test_markdown_cleaned_before_speaking() {
    let local = FakeEngine::new(EngineKind::Local, Duration::ZERO);
    let playback = coordinator(
        &[&local],
        VoiceSettings::default(),
        Arc::new(RecordingObserver::default()),
    );

    playback.speak("**Done.** See `notes.md`").await.unwrap();

    let (text, _) = &local.spoken()[0];
    assert!(!text.contains('*'));
    assert!(!text.contains('`'));
    assert!(text.starts_with("Done."));
}

#[tokio::test(start_paused = true)]
async fn test_capture_pauses_while_speaking() {
    let source = Arc::new(ScriptedSource::default());
    let capture = CaptureHandle::spawn(source.clone(), CaptureConfig::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    capture.start_capture(tx, true).await.unwrap();

    let engine = FakeEngine::new(EngineKind::Local, Duration::from_secs(2));
    let playback = coordinator(&[&engine], VoiceSettings::default(), Arc::new(capture.clone()));

    let speaking = tokio::spawn({
        let playback = Arc::clone(&playback);
        async move { playback.speak("here is your answer").await }
    });
    advance(1).await;
    assert_eq!(capture.state(), CaptureState::Responding);

    speaking.await.unwrap().unwrap();
    assert_eq!(capture.state(), CaptureState::Responding);

    advance(600).await;
    assert_eq!(capture.state(), CaptureState::Listening);
    assert_eq!(source.spawned(), 2);
}
