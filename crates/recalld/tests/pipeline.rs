mod common;

use common::{Harness, Options, OWNER, SLOW_EXTRACTION};
use recalld::{EngineError, Identification};
use std::sync::Arc;
use std::time::Duration;

fn names(outcome: &Identification) -> Vec<String> {
    match outcome {
        Identification::Matches(results) => results.iter().map(|r| r.person_name.clone()).collect(),
        other => panic!("expected matches, got {other:?}"),
    }
}

#[tokio::test]
async fn test_identical_frames_extract_once_within_ttl() {
    let h = Harness::with_options(Options {
        cache_ttl: Duration::from_millis(150),
        ..Default::default()
    })
    .await
    .with_alice_and_bob()
    .await;
    let before = h.extractions();

    let first = h.state.recognition.identify(OWNER, b"0.0".to_vec()).await.unwrap();
    let second = h.state.recognition.identify(OWNER, b"0.0".to_vec()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.extractions() - before, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    h.state.recognition.identify(OWNER, b"0.0".to_vec()).await.unwrap();
    assert_eq!(h.extractions() - before, 2);
}

#[tokio::test]
async fn test_alice_identified_at_85_percent() {
    let h = Harness::new().await.with_alice_and_bob().await;
    let outcome = h.state.recognition.identify(OWNER, b"0.0".to_vec()).await.unwrap();

    let Identification::Matches(results) = outcome else {
        panic!("expected a match");
    };
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].person_name, "Alice");
    assert_eq!(results[0].confidence_label(), "85.00%");
}

#[tokio::test]
async fn test_outcomes_distinguish_no_face_and_empty_registry() {
    let h = Harness::new().await;
    assert_eq!(
        h.state.recognition.identify(OWNER, b"0.0".to_vec()).await.unwrap(),
        Identification::NoRegisteredFaces
    );
    assert_eq!(
        h.state.recognition.identify(OWNER, b"noface".to_vec()).await.unwrap(),
        Identification::NoFaceDetected
    );
}

#[tokio::test]
async fn test_reenrollment_invalidates_cached_results() {
    let h = Harness::new().await.with_alice_and_bob().await;
    let recognition = &h.state.recognition;

    assert_eq!(names(&recognition.identify(OWNER, b"0.0".to_vec()).await.unwrap()), ["Alice"]);

    recognition
        .enroll(OWNER, "Alice", "alice2.jpg", b"0.9".to_vec())
        .await
        .unwrap();
    assert!(names(&recognition.identify(OWNER, b"0.0".to_vec()).await.unwrap()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_result_computed_during_reenrollment_is_not_cached() {
    let h = Harness::new().await.with_alice_and_bob().await;
    let state = Arc::clone(&h.state);

    // Reads the registry with Alice at 0.15, then extracts slowly.
    let in_flight = tokio::spawn(async move {
        state.recognition.identify(OWNER, b"slow:0.0".to_vec()).await
    });
    tokio::time::sleep(SLOW_EXTRACTION / 3).await;
    h.state
        .recognition
        .enroll(OWNER, "Alice", "alice2.jpg", b"0.9".to_vec())
        .await
        .unwrap();

    let stale = in_flight.await.unwrap().unwrap();
    assert_eq!(names(&stale), ["Alice"]);

    let before = h.extractions();
    let fresh = h.state.recognition.identify(OWNER, b"slow:0.0".to_vec()).await.unwrap();
    assert!(names(&fresh).is_empty(), "stale match served from cache: {fresh:?}");
    assert_eq!(h.extractions() - before, 1);
}

#[tokio::test]
async fn test_deletion_during_identification_is_not_cached() {
    let h = Harness::new().await.with_alice_and_bob().await;
    let state = Arc::clone(&h.state);

    let in_flight = tokio::spawn(async move {
        state.recognition.identify(OWNER, b"slow:0.0".to_vec()).await
    });
    tokio::time::sleep(SLOW_EXTRACTION / 3).await;
    assert!(h.state.recognition.delete(OWNER, "Alice").await.unwrap());
    in_flight.await.unwrap().unwrap();

    let fresh = h.state.recognition.identify(OWNER, b"slow:0.0".to_vec()).await.unwrap();
    assert!(names(&fresh).is_empty(), "deleted person still identified: {fresh:?}");
}

#[tokio::test]
async fn test_reenrollment_keeps_one_record_and_one_image() {
    let h = Harness::new().await;
    let recognition = &h.state.recognition;

    let first = recognition.enroll(OWNER, "Alice", "a.jpg", b"0.1".to_vec()).await.unwrap();
    let second = recognition.enroll(OWNER, "Alice", "b.jpg", b"0.2".to_vec()).await.unwrap();
    assert_eq!(first.record.id, second.record.id);

    let records = recognition.list(OWNER).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].embedding.as_ref().unwrap().values, vec![0.2]);
    assert_eq!(h.stored_files(), 1);
}

#[tokio::test]
async fn test_enrollment_without_face_is_kept() {
    let h = Harness::new().await;
    let recognition = &h.state.recognition;

    let enrollment = recognition
        .enroll(OWNER, "Blurry", "blurry.jpg", b"noface".to_vec())
        .await
        .unwrap();
    assert!(!enrollment.face_detected);
    assert!(enrollment.record.image_path.is_some());

    assert_eq!(recognition.list(OWNER).await.unwrap().len(), 1);
    assert!(recognition.store().registry(OWNER).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_extraction_leaves_no_files() {
    let h = Harness::new().await;
    let err = h
        .state
        .recognition
        .enroll(OWNER, "Corrupt", "corrupt.jpg", b"\xff\xd8garbage".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Extraction(_)));
    assert_eq!(h.stored_files(), 0);
    assert!(h.state.recognition.list(OWNER).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_releases_image() {
    let h = Harness::new().await.with_alice_and_bob().await;
    let recognition = &h.state.recognition;
    assert_eq!(h.stored_files(), 2);

    assert!(recognition.delete(OWNER, "Alice").await.unwrap());
    assert!(!recognition.delete(OWNER, "Alice").await.unwrap());
    assert_eq!(h.stored_files(), 1);
    assert_eq!(names(&recognition.identify(OWNER, b"0.55".to_vec()).await.unwrap()), ["Bob"]);
}

#[tokio::test]
async fn test_slow_model_load_times_out() {
    let h = Harness::with_options(Options {
        frame_timeout: Duration::from_millis(50),
        load_delay: Duration::from_millis(300),
        ..Default::default()
    })
    .await;

    let err = h.state.recognition.identify(OWNER, b"0.0".to_vec()).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)));
    assert_eq!(err.user_message(), "Face recognition timed out, please try again");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_frames_share_one_load() {
    let h = Harness::with_options(Options {
        load_delay: Duration::from_millis(100),
        ..Default::default()
    })
    .await;

    let tasks: Vec<_> = (0..12)
        .map(|i| {
            let state = Arc::clone(&h.state);
            tokio::spawn(async move {
                state
                    .recognition
                    .identify(OWNER, format!("0.{i}").into_bytes())
                    .await
            })
        })
        .collect();
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    assert_eq!(h.loads(), 1);
}
