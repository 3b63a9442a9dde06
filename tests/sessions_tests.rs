use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use driftbox::error::AppError;
use driftbox::sessions::{CancelOutcome, ChunkOutcome, SessionRegistry, UploadStatus};

#[test]
fn test_start_or_get_creates_once() {
    let registry = SessionRegistry::new();

    let (session, created) = registry.start_or_get("a", "f.bin", "docs", 3).unwrap();
    assert!(created);
    assert_eq!(session.status, UploadStatus::Pending);

    let (_, created) = registry.start_or_get("a", "f.bin", "docs", 3).unwrap();
    assert!(!created);
    assert_eq!(registry.len(), 1);

    assert!(matches!(
        registry.start_or_get("a", "f.bin", "docs", 4),
        Err(AppError::MetadataMismatch(_))
    ));
    assert!(matches!(
        registry.start_or_get("b", "f.bin", "", 0),
        Err(AppError::InvalidRequest(_))
    ));
}

#[test]
fn test_mark_received_tracks_progress() {
    let registry = SessionRegistry::new();
    registry.start_or_get("a", "f.bin", "", 3).unwrap();

    let outcome = registry.mark_received("a", 2).unwrap();
    assert_eq!(
        outcome,
        ChunkOutcome::Recorded {
            received: 1,
            total: 3,
            complete: false
        }
    );
    assert_eq!(registry.get("a").unwrap().status, UploadStatus::Uploading);

    // a duplicate index doesn't count twice
    registry.mark_received("a", 2).unwrap();
    registry.mark_received("a", 0).unwrap();
    assert!(!registry.is_complete("a").unwrap());
    assert_eq!(registry.get("a").unwrap().missing_chunks(), vec![1]);

    assert!(matches!(
        registry.mark_received("a", 3),
        Err(AppError::InvalidChunkIndex { index: 3, total: 3 })
    ));
    assert!(matches!(
        registry.mark_received("nope", 0),
        Err(AppError::UnknownUpload(_))
    ));

    let outcome = registry.mark_received("a", 1).unwrap();
    assert!(matches!(outcome, ChunkOutcome::Recorded { complete: true, .. }));
    assert!(registry.is_complete("a").unwrap());
}

#[test]
fn test_claim_completion_needs_every_chunk() {
    let registry = SessionRegistry::new();
    registry.start_or_get("a", "f.bin", "", 2).unwrap();
    registry.mark_received("a", 0).unwrap();

    assert!(!registry.claim_completion("a").unwrap());

    registry.mark_received("a", 1).unwrap();
    assert!(registry.claim_completion("a").unwrap());
    assert!(!registry.claim_completion("a").unwrap());

    let session = registry.get("a").unwrap();
    assert_eq!(session.status, UploadStatus::Assembling);
    assert!(session.completion_claimed());

    // late chunks are ignored once assembly owns the session
    assert_eq!(
        registry.mark_received("a", 0).unwrap(),
        ChunkOutcome::AlreadyAssembling
    );
}

#[test]
fn test_concurrent_final_chunks_claim_once() {
    for _ in 0..50 {
        let registry = Arc::new(SessionRegistry::new());
        let total = 8u32;
        registry.start_or_get("race", "f.bin", "", total).unwrap();
        let claims = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..total)
            .map(|index| {
                let registry = registry.clone();
                let claims = claims.clone();
                std::thread::spawn(move || {
                    if let Ok(ChunkOutcome::Recorded { complete: true, .. }) =
                        registry.mark_received("race", index)
                    {
                        if registry.claim_completion("race").unwrap() {
                            claims.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(claims.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get("race").unwrap().status, UploadStatus::Assembling);
    }
}

#[test]
fn test_status_only_moves_forward() {
    let registry = SessionRegistry::new();
    registry.start_or_get("a", "f.bin", "", 1).unwrap();

    // pending can't jump straight to completed
    assert!(matches!(
        registry.set_status("a", UploadStatus::Completed, None),
        Err(AppError::InvalidRequest(_))
    ));

    registry.mark_received("a", 0).unwrap();
    registry.claim_completion("a").unwrap();
    registry
        .set_status("a", UploadStatus::Error, Some("disk full".to_string()))
        .unwrap();

    let session = registry.get("a").unwrap();
    assert_eq!(session.error_message.as_deref(), Some("disk full"));
    assert!(session.completed_at.is_some());

    assert!(matches!(
        registry.set_status("a", UploadStatus::Completed, None),
        Err(AppError::AlreadyTerminal {
            status: UploadStatus::Error,
            ..
        })
    ));
}

#[test]
fn test_cancel() {
    let registry = SessionRegistry::new();
    registry.start_or_get("a", "f.bin", "", 3).unwrap();
    registry.mark_received("a", 0).unwrap();

    assert_eq!(registry.cancel("a").unwrap(), CancelOutcome::Cancelled);
    assert_eq!(registry.get("a").unwrap().status, UploadStatus::Cancelled);

    // chunks after a cancel are rejected
    assert!(matches!(
        registry.mark_received("a", 1),
        Err(AppError::AlreadyTerminal { .. })
    ));
    assert!(matches!(
        registry.cancel("a"),
        Err(AppError::AlreadyTerminal { .. })
    ));
    assert!(matches!(registry.cancel("b"), Err(AppError::UnknownUpload(_))));
}

#[test]
fn test_cancel_while_assembling_only_requests() {
    let registry = SessionRegistry::new();
    registry.start_or_get("a", "f.bin", "", 1).unwrap();
    registry.mark_received("a", 0).unwrap();
    registry.claim_completion("a").unwrap();

    assert_eq!(registry.cancel("a").unwrap(), CancelOutcome::Requested);
    assert!(registry.cancel_requested("a"));
    assert_eq!(registry.get("a").unwrap().status, UploadStatus::Assembling);
}

#[test]
fn test_protect_and_remove_if() {
    let registry = SessionRegistry::new();
    registry.start_or_get("a", "f.bin", "", 1).unwrap();

    registry.protect("a").unwrap();
    registry.protect("a").unwrap();
    assert!(registry.get("a").unwrap().protected);
    assert!(registry.remove_if("a", |s| !s.protected).is_none());

    registry.unprotect("a").unwrap();
    assert!(registry.remove_if("a", |s| !s.protected).is_some());
    assert!(registry.is_empty());
    assert!(matches!(registry.protect("a"), Err(AppError::UnknownUpload(_))));
}

#[test]
fn test_count_by_status() {
    let registry = SessionRegistry::new();
    registry.start_or_get("a", "a.bin", "", 2).unwrap();
    registry.start_or_get("b", "b.bin", "", 2).unwrap();
    registry.mark_received("b", 0).unwrap();

    assert_eq!(registry.count_by_status(UploadStatus::Pending), 1);
    assert_eq!(registry.count_by_status(UploadStatus::Uploading), 1);
    assert!(!registry.any_assembling());
}

#[test]
fn test_protect_does_not_outlive_assembly() {
    let registry = SessionRegistry::new();
    registry.start_or_get("a", "f.bin", "", 1).unwrap();
    registry.mark_received("a", 0).unwrap();
    assert!(registry.claim_completion("a").unwrap());

    // a client protects right as the worker finishes
    assert_eq!(registry.protect("a").unwrap(), UploadStatus::Assembling);
    registry.set_status("a", UploadStatus::Completed, None).unwrap();
    assert!(!registry.get("a").unwrap().protected);

    // protecting a finished upload changes nothing
    assert_eq!(registry.protect("a").unwrap(), UploadStatus::Completed);
    assert!(!registry.get("a").unwrap().protected);
    assert!(registry.remove_if("a", |s| !s.protected).is_some());
}

#[test]
fn test_cancel_clears_protection() {
    let registry = SessionRegistry::new();
    registry.start_or_get("a", "f.bin", "", 2).unwrap();
    registry.mark_received("a", 0).unwrap();
    registry.protect("a").unwrap();

    assert_eq!(registry.cancel("a").unwrap(), CancelOutcome::Cancelled);
    let session = registry.get("a").unwrap();
    assert_eq!(session.status, UploadStatus::Cancelled);
    assert!(!session.protected);
}
