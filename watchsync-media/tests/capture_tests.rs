//! Integration tests for virtual media capture

use std::time::Duration;
use watchsync_media::*;

// ============================================================================
// ACQUISITION TESTS
// ============================================================================

#[tokio::test]
async fn test_acquire_default_constraints() {
    let capture = VirtualCapture::new();
    let media = capture.acquire(&MediaConstraints::default()).await.unwrap();

    assert!(media.video().is_some());
    assert!(media.audio().is_some());
    assert!(media.video().unwrap().is_enabled());
    assert_ne!(media.video().unwrap().id(), media.audio().unwrap().id());
    assert_eq!(capture.acquisition_count(), 1);
    assert_eq!(capture.live_stream_count(), 1);
}

#[tokio::test]
async fn test_audio_only() {
    let capture = VirtualCapture::new();
    let media = capture
        .acquire(&MediaConstraints {
            video: false,
            audio: true,
        })
        .await
        .unwrap();

    assert!(media.video().is_none());
    assert_eq!(media.tracks().len(), 1);
    assert_eq!(media.tracks()[0].kind(), TrackKind::Audio);
}

#[tokio::test]
async fn test_stop_releases_stream() {
    let capture = VirtualCapture::new();
    let media = capture.acquire(&MediaConstraints::default()).await.unwrap();
    media.stop();
    assert_eq!(capture.live_stream_count(), 0);
    assert_eq!(capture.acquisition_count(), 1);
}

// ============================================================================
// FAILURE TESTS
// ============================================================================

#[tokio::test]
async fn test_scripted_failure_applies_once() {
    let capture = VirtualCapture::new();
    capture.fail_next(MediaError::PermissionDenied {
        reason: "NotAllowedError".to_string(),
    });

    let error = capture
        .acquire(&MediaConstraints::default())
        .await
        .unwrap_err();
    assert_eq!(error.error_code(), "PERMISSION_DENIED");
    assert!(error.is_recoverable());
    assert_eq!(capture.acquisition_count(), 0);

    assert!(capture.acquire(&MediaConstraints::default()).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_delayed_acquisition() {
    let capture = VirtualCapture::new().with_delay(Duration::from_millis(200));
    let started = tokio::time::Instant::now();
    capture.acquire(&MediaConstraints::default()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
}
