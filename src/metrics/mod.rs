//! Metrics module
//!
//! Prometheus counters for uploads and session refreshes.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "lms_uploads_total",
        "Chunked uploads by outcome",
        &["status"]
    ).unwrap();

    pub static ref CHUNK_ATTEMPTS_TOTAL: CounterVec = register_counter_vec!(
        "lms_chunk_attempts_total",
        "Chunk upload attempts by outcome",
        &["status"]
    ).unwrap();

    pub static ref CHUNK_BYTES_TOTAL: Counter = register_counter!(
        "lms_chunk_bytes_total",
        "Bytes acknowledged by the upload endpoint"
    ).unwrap();

    pub static ref UPLOAD_CHUNKS: Histogram = register_histogram!(
        "lms_upload_chunks",
        "Number of chunks per completed upload",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    ).unwrap();

    // Auth metrics
    pub static ref REFRESH_ATTEMPTS: CounterVec = register_counter_vec!(
        "lms_refresh_attempts_total",
        "Session token refresh attempts",
        &["status"]
    ).unwrap();

    pub static ref SIGN_OUTS_TOTAL: Counter = register_counter!(
        "lms_forced_sign_outs_total",
        "Sign-outs forced by repeated refresh failure"
    ).unwrap();
}

/// Record a finished upload
pub fn record_upload_success(chunks: u64) {
    UPLOADS_TOTAL.with_label_values(&["success"]).inc();
    UPLOAD_CHUNKS.observe(chunks as f64);
}

/// Record an upload that ended with an error (`kind` is the error label)
pub fn record_upload_failure(kind: &str) {
    UPLOADS_TOTAL.with_label_values(&[kind]).inc();
}

/// Record one chunk attempt
pub fn record_chunk_attempt(success: bool, bytes: u64) {
    let status = if success { "success" } else { "failure" };
    CHUNK_ATTEMPTS_TOTAL.with_label_values(&[status]).inc();
    if success {
        CHUNK_BYTES_TOTAL.inc_by(bytes as f64);
    }
}

/// Record a refresh attempt
pub fn record_refresh_attempt(success: bool) {
    let status = if success { "success" } else { "failure" };
    REFRESH_ATTEMPTS.with_label_values(&[status]).inc();
}

/// Record a forced sign-out
pub fn record_sign_out() {
    SIGN_OUTS_TOTAL.inc();
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
