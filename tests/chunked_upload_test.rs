//! Chunked Upload Integration Tests
//!
//! Drives `ChunkedTransferClient` against a mock upload service.

use lms_client::config::DispatchMode;
use lms_client::upload::{ChunkedTransferClient, TransferProgress, UploadError, UploadOptions};
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path, path_regex};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

/// Matches a chunk request carrying the given `chunkIndex` form field
struct ChunkIndex(u64);

impl Match for ChunkIndex {
    fn matches(&self, request: &Request) -> bool {
        let body = String::from_utf8_lossy(&request.body);
        body.contains(&format!("name=\"chunkIndex\"\r\n\r\n{}\r\n", self.0))
    }
}

/// Write `size` random bytes to `name` inside a fresh temp dir
fn test_file(name: &str, size: usize) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join(name);
    let mut data = vec![0u8; size];
    rand::rng().fill_bytes(&mut data);
    std::fs::write(&file, &data).unwrap();
    (dir, file)
}

fn options(server: &MockServer) -> UploadOptions {
    UploadOptions::new(server.uri()).with_backoff_base(Duration::from_millis(1))
}

async fn mount_init(server: &MockServer, upload_id: &str) {
    Mock::given(method("POST"))
        .and(path("/upload/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uploadId": upload_id })))
        .mount(server)
        .await;
}

async fn mount_complete(server: &MockServer, upload_id: &str, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path(format!("/upload/complete/{}", upload_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 42,
            "title": "Lecture",
            "originalFile": "lecture.mp4",
            "message": "Upload complete"
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn chunk_ok() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "uploadId": "up-1", "progress": 0 }))
}

fn collect_progress(options: UploadOptions) -> (UploadOptions, Arc<Mutex<Vec<TransferProgress>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let options = options.on_progress(move |progress| sink.lock().push(progress));
    (options, seen)
}

mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_happy_path() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("lecture.mp4", 25);

        Mock::given(method("POST"))
            .and(path("/upload/init"))
            .and(body_partial_json(json!({
                "filename": "lecture.mp4",
                "fileSize": 25,
                "totalChunks": 3,
                "title": "Lecture",
                "description": "Week 1"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uploadId": "up-1" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .respond_with(chunk_ok())
            .expect(3)
            .mount(&server)
            .await;
        mount_complete(&server, "up-1", 1).await;

        let (options, seen) = collect_progress(options(&server).with_chunk_size(10));
        let client = ChunkedTransferClient::new().unwrap();
        let result = client
            .upload(&file, "Lecture", Some("Week 1"), options)
            .await
            .unwrap();

        assert_eq!(result.id, json!(42));
        assert_eq!(result.original_file.as_deref(), Some("lecture.mp4"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        let uploaded: Vec<u64> = seen.iter().map(|p| p.uploaded_chunks).collect();
        assert_eq!(uploaded, vec![1, 2, 3]);
        assert_eq!(seen.last().unwrap().percentage, 100.0);
        assert!(seen.iter().all(|p| p.total_chunks == 3));
    }

    #[tokio::test]
    async fn test_25_mib_file_in_10_mib_chunks() {
        const MIB: usize = 1024 * 1024;
        let server = MockServer::start().await;
        let (_dir, file) = test_file("video.mp4", 25 * MIB);

        mount_init(&server, "big").await;
        for index in 0..3 {
            Mock::given(method("POST"))
                .and(path("/upload/chunk/big"))
                .and(ChunkIndex(index))
                .respond_with(chunk_ok())
                .expect(1)
                .mount(&server)
                .await;
        }
        mount_complete(&server, "big", 1).await;

        let (options, seen) = collect_progress(
            options(&server)
                .with_chunk_size(10 * MIB as u64)
                .with_concurrency(3),
        );
        let client = ChunkedTransferClient::new().unwrap();
        client.upload(&file, "Video", None, options).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last().unwrap().percentage, 100.0);

        let requests = server.received_requests().await.unwrap();
        let chunk_bodies: Vec<usize> = requests
            .iter()
            .filter(|r| r.url.path() == "/upload/chunk/big")
            .map(|r| r.body.len())
            .collect();
        assert_eq!(chunk_bodies.len(), 3);
        assert!(chunk_bodies.iter().filter(|len| **len > 10 * MIB).count() == 2);
        assert!(chunk_bodies.iter().any(|len| *len > 5 * MIB && *len < 6 * MIB));
    }

    #[tokio::test]
    async fn test_chunk_exhausts_retries() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("lecture.mp4", 30);

        mount_init(&server, "up-1").await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .and(ChunkIndex(1))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .respond_with(chunk_ok())
            .mount(&server)
            .await;
        mount_complete(&server, "up-1", 0).await;

        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let options = options(&server)
            .with_chunk_size(10)
            .with_max_retries(3)
            .on_error(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let client = ChunkedTransferClient::new().unwrap();
        let err = client
            .upload(&file, "Lecture", None, options)
            .await
            .unwrap_err();

        match err {
            UploadError::ChunkUploadFailure {
                chunk_index,
                attempts,
                ref reason,
            } => {
                assert_eq!(chunk_index, 1);
                assert_eq!(attempts, 3);
                assert!(reason.contains("500"));
            }
            other => panic!("expected ChunkUploadFailure, got {:?}", other),
        }
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_chunk_failure_recovers() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("lecture.mp4", 20);

        mount_init(&server, "up-1").await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .and(ChunkIndex(0))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .respond_with(chunk_ok())
            .expect(2)
            .mount(&server)
            .await;
        mount_complete(&server, "up-1", 1).await;

        let client = ChunkedTransferClient::new().unwrap();
        let result = client
            .upload(&file, "Lecture", None, options(&server).with_chunk_size(10))
            .await;
        assert!(result.is_ok(), "expected recovery, got {:?}", result);
    }

    #[tokio::test]
    async fn test_init_failure_sends_no_chunks() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("lecture.mp4", 20);

        Mock::given(method("POST"))
            .and(path("/upload/init"))
            .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/upload/chunk/.*"))
            .respond_with(chunk_ok())
            .expect(0)
            .mount(&server)
            .await;

        let client = ChunkedTransferClient::new().unwrap();
        let err = client
            .upload(&file, "Lecture", None, options(&server).with_chunk_size(10))
            .await
            .unwrap_err();

        match err {
            UploadError::InitializationFailure(reason) => assert!(reason.contains("disk full")),
            other => panic!("expected InitializationFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completion_failure_is_not_retried() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("lecture.mp4", 20);

        mount_init(&server, "up-1").await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .respond_with(chunk_ok())
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/complete/up-1"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChunkedTransferClient::new().unwrap();
        let err = client
            .upload(&file, "Lecture", None, options(&server).with_chunk_size(10))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::CompletionFailure(_)));
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("lecture.mp4", 40);

        mount_init(&server, "up-1").await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .respond_with(chunk_ok().set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;
        mount_complete(&server, "up-1", 0).await;

        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let options = options(&server)
            .with_chunk_size(10)
            .on_error(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let client = Arc::new(ChunkedTransferClient::new().unwrap());
        let canceller = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = client
            .upload(&file, "Lecture", None, options.clone())
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        // The client stays cancelled
        let err = client
            .upload(&file, "Lecture", None, options)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_during_init() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("lecture.mp4", 40);

        Mock::given(method("POST"))
            .and(path("/upload/init"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "uploadId": "up-1" }))
                    .set_delay(Duration::from_secs(10)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .respond_with(chunk_ok())
            .expect(0)
            .mount(&server)
            .await;
        mount_complete(&server, "up-1", 0).await;

        let client = Arc::new(ChunkedTransferClient::new().unwrap());
        let canceller = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = client
            .upload(&file, "Lecture", None, options(&server).with_chunk_size(10))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(client.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));

        // Nothing is sent after the cancelled init
        tokio::time::sleep(Duration::from_millis(100)).await;
        let later = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|request| request.url.path() != "/upload/init")
            .count();
        assert_eq!(later, 0);
    }

    #[tokio::test]
    async fn test_cancel_during_complete() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("lecture.mp4", 40);

        mount_init(&server, "up-1").await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .respond_with(chunk_ok())
            .expect(4)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/complete/up-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": 42, "title": "Lecture" }))
                    .set_delay(Duration::from_secs(10)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (options, seen) = collect_progress(options(&server).with_chunk_size(10));
        let client = Arc::new(ChunkedTransferClient::new().unwrap());
        let canceller = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = client
            .upload(&file, "Lecture", None, options)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(client.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(seen.lock().last().map(|p| p.uploaded_chunks), Some(4));

        // One complete request and no further chunks after the cancel
        tokio::time::sleep(Duration::from_millis(100)).await;
        let requests = server.received_requests().await.unwrap();
        let count = |prefix: &str| {
            requests
                .iter()
                .filter(|request| request.url.path().starts_with(prefix))
                .count()
        };
        assert_eq!(count("/upload/chunk/"), 4);
        assert_eq!(count("/upload/complete/"), 1);
    }

    #[tokio::test]
    async fn test_batches_wait_for_slowest_member() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("lecture.mp4", 40);

        mount_init(&server, "up-1").await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .and(ChunkIndex(0))
            .respond_with(chunk_ok().set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .respond_with(chunk_ok())
            .mount(&server)
            .await;
        mount_complete(&server, "up-1", 1).await;

        let (options, seen) = collect_progress(
            options(&server)
                .with_chunk_size(10)
                .with_concurrency(2)
                .with_dispatch(DispatchMode::Batched),
        );
        let client = ChunkedTransferClient::new().unwrap();
        client.upload(&file, "Lecture", None, options).await.unwrap();

        let order: Vec<u64> = seen.lock().iter().filter_map(|p| p.current_chunk).collect();
        assert_eq!(order.len(), 4);
        let position = |index: u64| order.iter().position(|i| *i == index).unwrap();
        assert!(position(0) < position(2));
        assert!(position(0) < position(3));
    }

    #[tokio::test]
    async fn test_pooled_dispatch_uploads_every_chunk() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("lecture.mp4", 45);

        mount_init(&server, "up-1").await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .respond_with(chunk_ok())
            .expect(5)
            .mount(&server)
            .await;
        mount_complete(&server, "up-1", 1).await;

        let (options, seen) = collect_progress(
            options(&server)
                .with_chunk_size(10)
                .with_concurrency(2)
                .with_dispatch(DispatchMode::Pooled),
        );
        let client = ChunkedTransferClient::new().unwrap();
        client.upload(&file, "Lecture", None, options).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0].uploaded_chunks <= w[1].uploaded_chunks));
        assert_eq!(seen.last().unwrap().percentage, 100.0);
    }

    #[tokio::test]
    async fn test_server_chunk_size_is_authoritative() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("lecture.mp4", 25);

        Mock::given(method("POST"))
            .and(path("/upload/init"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "uploadId": "up-1", "chunkSize": 5 })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/up-1"))
            .respond_with(chunk_ok())
            .expect(5)
            .mount(&server)
            .await;
        mount_complete(&server, "up-1", 1).await;

        let client = ChunkedTransferClient::new().unwrap();
        client
            .upload(&file, "Lecture", None, options(&server).with_chunk_size(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_id_is_path_escaped() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("lecture.mp4", 5);

        mount_init(&server, "a b").await;
        Mock::given(method("POST"))
            .and(path("/upload/chunk/a%20b"))
            .respond_with(chunk_ok())
            .expect(1)
            .mount(&server)
            .await;
        mount_complete(&server, "a%20b", 1).await;

        let client = ChunkedTransferClient::new().unwrap();
        client
            .upload(&file, "Lecture", None, options(&server).with_chunk_size(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_file_skips_to_complete() {
        let server = MockServer::start().await;
        let (_dir, file) = test_file("empty.txt", 0);

        Mock::given(method("POST"))
            .and(path("/upload/init"))
            .and(body_partial_json(json!({ "fileSize": 0, "totalChunks": 0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uploadId": "up-0" })))
            .expect(1)
            .mount(&server)
            .await;
        mount_complete(&server, "up-0", 1).await;

        let (options, seen) = collect_progress(options(&server));
        let client = ChunkedTransferClient::new().unwrap();
        client.upload(&file, "Empty", None, options).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].percentage, 100.0);
    }

    #[tokio::test]
    async fn test_status_and_abort_remote() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/upload/status/up-9"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "uploaded": 2, "total": 5 })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/upload/cancel/up-9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChunkedTransferClient::new().unwrap();
        let status = client.status(&server.uri(), "up-9").await.unwrap();
        assert_eq!(status["uploaded"], 2);

        // Abort still works after the client was cancelled
        client.cancel();
        client.abort_remote(&server.uri(), "up-9").await.unwrap();
    }
}
