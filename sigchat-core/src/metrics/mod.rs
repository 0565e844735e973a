//! Metric names and descriptions
//!
//! Counters are emitted through the `metrics` facade; nothing is recorded
//! until the binary installs a recorder.

use ::metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

pub const FRAMES_TOTAL: &str = "sigchat_frames_total";
pub const MESSAGES_QUEUED_TOTAL: &str = "sigchat_messages_queued_total";
pub const VERIFICATIONS_TOTAL: &str = "sigchat_verifications_total";
pub const VERIFICATION_DURATION_MS: &str = "sigchat_verification_duration_ms";

/// Register descriptions for every sigchat metric
pub fn init_metrics() {
    describe_counter!(FRAMES_TOTAL, "Client frames processed by the delivery server, by type");
    describe_counter!(MESSAGES_QUEUED_TOTAL, "Signed messages persisted by the delivery server");
    describe_counter!(VERIFICATIONS_TOTAL, "Signature verifications, by result");
    describe_histogram!(
        VERIFICATION_DURATION_MS,
        "Key resolution plus signature check, in milliseconds"
    );
}

pub fn record_frame(kind: &'static str) {
    counter!(FRAMES_TOTAL, "type" => kind).increment(1);
}

pub fn record_queued() {
    counter!(MESSAGES_QUEUED_TOTAL).increment(1);
}

pub fn record_verification(verified: bool) {
    let result = if verified { "verified" } else { "failed" };
    counter!(VERIFICATIONS_TOTAL, "result" => result).increment(1);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self { name, start: Instant::now() }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}
