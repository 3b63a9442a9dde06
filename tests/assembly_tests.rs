mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use driftbox::assembly::{self, AssemblyQueue};
use driftbox::error::AppError;
use driftbox::server::build_public_router;
use driftbox::sessions::{CancelOutcome, UploadStatus};

use tower::util::ServiceExt;

use common::{chunk, test_state, wait_terminal};

fn pieces(data: &[u8], size: usize) -> Vec<Vec<u8>> {
    data.chunks(size).map(|c| c.to_vec()).collect()
}

#[tokio::test]
async fn test_three_chunk_upload_assembles() {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = test_state(temp_dir.path());
    assembly::spawn_workers(state.assembler.clone(), &state.queue, 2);

    let receipt = state.receive_chunk(chunk("F", 0, 3, "x.bin", "docs", b"AAAA")).await.unwrap();
    assert!(!receipt.assembly_queued);
    state.receive_chunk(chunk("F", 1, 3, "x.bin", "docs", b"BBBB")).await.unwrap();
    let receipt = state.receive_chunk(chunk("F", 2, 3, "x.bin", "docs", b"CC")).await.unwrap();
    assert!(receipt.assembly_queued);

    let session = wait_terminal(&state, "F").await;
    assert_eq!(session.status, UploadStatus::Completed);

    let assembled = std::fs::read(state.files_dir.join("docs/x.bin")).unwrap();
    assert_eq!(assembled, b"AAAABBBBCC");
    assert_eq!(assembled.len(), 10);

    // fragments are gone, the snapshot saw the new file
    assert!(!state.chunks.dir_for("F").exists());
    assert_eq!(state.detector.current().file_count, 1);
}

#[tokio::test]
async fn test_any_arrival_order_with_duplicates() {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = test_state(temp_dir.path());
    assembly::spawn_workers(state.assembler.clone(), &state.queue, 1);

    let original: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 251) as u8).collect();
    let parts = pieces(&original, 700);
    let total = parts.len() as u32;

    // reversed, with every other chunk sent twice, chunk 0 completes it
    let mut order: Vec<usize> = (1..parts.len()).rev().collect();
    order.extend((2..parts.len()).step_by(2));
    order.push(0);
    for index in order {
        state
            .receive_chunk(chunk("perm", index as i64, total, "data.bin", "", &parts[index]))
            .await
            .unwrap();
    }

    let session = wait_terminal(&state, "perm").await;
    assert_eq!(session.status, UploadStatus::Completed);
    assert_eq!(std::fs::read(state.files_dir.join("data.bin")).unwrap(), original);
    assert_eq!(state.queue.enqueued_total(), 1);
}

#[tokio::test]
async fn test_concurrent_final_chunks_enqueue_once() {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = test_state(temp_dir.path());

    let total = 6u32;
    let tasks: Vec<_> = (0..total)
        .map(|index| {
            let state = state.clone();
            tokio::spawn(async move {
                let data = vec![index as u8; 16];
                state
                    .receive_chunk(chunk("burst", index as i64, total, "b.bin", "", &data))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(state.queue.enqueued_total(), 1);
    assert_eq!(state.sessions.get("burst").unwrap().status, UploadStatus::Assembling);
}

#[tokio::test]
async fn test_invalid_chunks_are_rejected() {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = test_state(temp_dir.path());

    assert!(matches!(
        state.receive_chunk(chunk("a", -1, 3, "f", "", b"x")).await,
        Err(AppError::InvalidChunkIndex { index: -1, total: 3 })
    ));
    assert!(matches!(
        state.receive_chunk(chunk("a", 3, 3, "f", "", b"x")).await,
        Err(AppError::InvalidChunkIndex { index: 3, total: 3 })
    ));
    assert!(matches!(
        state.receive_chunk(chunk("a", 0, 3, "a/b", "", b"x")).await,
        Err(AppError::InvalidRequest(_))
    ));
    assert!(matches!(
        state.receive_chunk(chunk("a", 0, 3, "f", "../up", b"x")).await,
        Err(AppError::DestinationConflict(_))
    ));

    let big = vec![0u8; state.config.max_chunk_size + 1];
    assert!(matches!(
        state.receive_chunk(chunk("a", 0, 3, "f", "", &big)).await,
        Err(AppError::ChunkTooLarge(_))
    ));

    let mut bad_sum = chunk("a", 0, 3, "f", "", b"payload");
    bad_sum.checksum = Some("00".repeat(32));
    assert!(matches!(
        state.receive_chunk(bad_sum).await,
        Err(AppError::InvalidRequest(_))
    ));

    // nothing above created a session
    assert!(state.sessions.is_empty());
}

#[tokio::test]
async fn test_cancel_after_first_chunk() {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = test_state(temp_dir.path());
    assembly::spawn_workers(state.assembler.clone(), &state.queue, 1);

    state.receive_chunk(chunk("c", 0, 3, "c.bin", "", b"one")).await.unwrap();
    assert_eq!(state.cancel_upload("c").unwrap(), CancelOutcome::Cancelled);

    // later chunks are refused and never trigger assembly
    assert!(matches!(
        state.receive_chunk(chunk("c", 1, 3, "c.bin", "", b"two")).await,
        Err(AppError::AlreadyTerminal { .. })
    ));
    assert_eq!(state.sessions.get("c").unwrap().status, UploadStatus::Cancelled);
    assert_eq!(state.queue.enqueued_total(), 0);

    // fragments stay until cleanup
    assert!(state.chunks.dir_for("c").exists());
    state.cleanup_upload("c").await.unwrap();
    assert!(!state.chunks.dir_for("c").exists());
    assert!(state.sessions.get("c").is_none());
    assert!(!state.files_dir.join("c.bin").exists());

    // the download listener has nothing at the assembled path
    let response = build_public_router(&state.files_dir)
        .oneshot(Request::builder().uri("/c.bin").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // cleanup is idempotent
    state.cleanup_upload("c").await.unwrap();
}

#[tokio::test]
async fn test_cleanup_refuses_active_upload() {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = test_state(temp_dir.path());

    state.receive_chunk(chunk("u", 0, 2, "u.bin", "", b"one")).await.unwrap();
    assert!(matches!(state.cleanup_upload("u").await, Err(AppError::Busy(_))));
    assert!(state.chunks.dir_for("u").exists());
}

#[tokio::test]
async fn test_cancel_during_assembly_stops_worker() {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = test_state(temp_dir.path());

    for index in 0..4 {
        state
            .receive_chunk(chunk("slow", index, 4, "slow.bin", "", &[index as u8; 64]))
            .await
            .unwrap();
    }
    // no worker running yet, so the cancel lands before the first chunk is copied
    assert_eq!(state.cancel_upload("slow").unwrap(), CancelOutcome::Requested);
    assembly::spawn_workers(state.assembler.clone(), &state.queue, 1);

    let session = wait_terminal(&state, "slow").await;
    assert_eq!(session.status, UploadStatus::Error);
    assert_eq!(session.error_message.as_deref(), Some("cancelled during assembly"));
    assert!(!session.protected);
    assert!(!state.files_dir.join("slow.bin").exists());

    // no temporary output is left behind
    let leftovers: Vec<_> = std::fs::read_dir(&state.files_dir).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_destination_conflict_marks_error() {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = test_state(temp_dir.path());
    assembly::spawn_workers(state.assembler.clone(), &state.queue, 1);

    state.receive_chunk(chunk("d", 0, 2, "target", "", b"1")).await.unwrap();
    // someone creates a directory where the file should land
    std::fs::create_dir(state.files_dir.join("target")).unwrap();
    state.receive_chunk(chunk("d", 1, 2, "target", "", b"2")).await.unwrap();

    let session = wait_terminal(&state, "d").await;
    assert_eq!(session.status, UploadStatus::Error);
    assert!(session.error_message.unwrap().contains("destination conflict"));
    assert!(state.files_dir.join("target").is_dir());
}

#[tokio::test]
async fn test_same_destination_last_writer_wins() {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = test_state(temp_dir.path());
    assembly::spawn_workers(state.assembler.clone(), &state.queue, 2);

    let first = vec![b'a'; 4096];
    let second = vec![b'b'; 2048];
    state.receive_chunk(chunk("one", 0, 1, "same.bin", "", &first)).await.unwrap();
    state.receive_chunk(chunk("two", 0, 1, "same.bin", "", &second)).await.unwrap();

    assert_eq!(wait_terminal(&state, "one").await.status, UploadStatus::Completed);
    assert_eq!(wait_terminal(&state, "two").await.status, UploadStatus::Completed);

    // whichever rename ran last, the file is one of the two uploads, never a mix
    let content = std::fs::read(state.files_dir.join("same.bin")).unwrap();
    assert!(content == first || content == second);
}

#[tokio::test]
async fn test_recover_requeues_complete_uploads() {
    let temp_dir = tempfile::tempdir().unwrap();
    {
        let state = test_state(temp_dir.path());
        state.receive_chunk(chunk("done", 0, 2, "done.bin", "r", b"he")).await.unwrap();
        state.receive_chunk(chunk("partial", 0, 2, "p.bin", "", b"x")).await.unwrap();
        // simulate a crash right after the last chunk hit the disk
        state
            .chunks
            .put("done", 1, Bytes::from_static(b"llo"))
            .await
            .unwrap();
    }

    let state = test_state(temp_dir.path());
    let (recovered, queued) = state.recover().await.unwrap();
    assert_eq!(recovered, 2);
    assert_eq!(queued, 1);

    let partial = state.sessions.get("partial").unwrap();
    assert_eq!(partial.status, UploadStatus::Uploading);
    assert_eq!(partial.missing_chunks(), vec![1]);

    assembly::spawn_workers(state.assembler.clone(), &state.queue, 1);
    assert_eq!(wait_terminal(&state, "done").await.status, UploadStatus::Completed);
    assert_eq!(std::fs::read(state.files_dir.join("r/done.bin")).unwrap(), b"hello");
}

#[tokio::test]
async fn test_queue_overflow_still_delivers() {
    let queue = Arc::new(AssemblyQueue::new(1));
    queue.enqueue("a").unwrap();
    queue.enqueue("b").unwrap();
    queue.enqueue("c").unwrap();
    assert_eq!(queue.enqueued_total(), 3);

    let rx = queue.receiver();
    let mut seen = Vec::new();
    for _ in 0..3 {
        let job = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            rx.lock().await.recv().await
        })
        .await
        .unwrap()
        .unwrap();
        seen.push(job.upload_id);
    }
    seen.sort();
    assert_eq!(seen, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_assemble_reports_missing_chunks() {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = test_state(temp_dir.path());
    state.receive_chunk(chunk("m", 0, 2, "m.bin", "", b"x")).await.unwrap();

    let session = state.sessions.get("m").unwrap();
    match state.assembler.assemble(&session).await {
        Err(AppError::IncompleteUpload { missing, .. }) => assert_eq!(missing, vec![1]),
        other => panic!("expected IncompleteUpload, got {:?}", other),
    }
}
