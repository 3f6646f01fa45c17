//! Metrics module
//!
//! Prometheus collectors for queues and pipelines, registered in the default
//! registry and exposed by the binary on `/metrics`. A collector that fails
//! to register is skipped rather than aborting the node.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

static QUEUE_SIZE: Lazy<Option<IntGaugeVec>> = Lazy::new(|| {
    register_int_gauge_vec!("gfsp_task_queue_size", "Number of tasks in a queue", &["queue"]).ok()
});

static QUEUE_CAP: Lazy<Option<IntGaugeVec>> = Lazy::new(|| {
    register_int_gauge_vec!("gfsp_task_queue_cap", "Capacity of a queue", &["queue"]).ok()
});

static TASK_IN_QUEUE_SECONDS: Lazy<Option<HistogramVec>> = Lazy::new(|| {
    register_histogram_vec!(
        "gfsp_task_in_queue_seconds",
        "Seconds between task creation and leaving a queue",
        &["queue"]
    )
    .ok()
});

static APPROVALS: Lazy<Option<IntCounterVec>> = Lazy::new(|| {
    register_int_counter_vec!(
        "gfsp_approval_total",
        "Approval requests by kind and outcome",
        &["kind", "outcome"]
    )
    .ok()
});

static RECEIVES: Lazy<Option<IntCounterVec>> = Lazy::new(|| {
    register_int_counter_vec!(
        "gfsp_receive_piece_total",
        "Receive requests by stage and outcome",
        &["stage", "outcome"]
    )
    .ok()
});

static QUOTA_CHECKS: Lazy<Option<IntCounterVec>> = Lazy::new(|| {
    register_int_counter_vec!(
        "gfsp_quota_check_total",
        "Read quota checks by outcome",
        &["outcome"]
    )
    .ok()
});

pub fn set_queue_size(queue: &str, len: usize) {
    if let Some(g) = QUEUE_SIZE.as_ref() {
        g.with_label_values(&[queue]).set(len as i64);
    }
}

pub fn set_queue_cap(queue: &str, cap: usize) {
    if let Some(g) = QUEUE_CAP.as_ref() {
        g.with_label_values(&[queue]).set(cap as i64);
    }
}

pub fn observe_task_in_queue(queue: &str, seconds: i64) {
    if let Some(h) = TASK_IN_QUEUE_SECONDS.as_ref() {
        h.with_label_values(&[queue]).observe(seconds.max(0) as f64);
    }
}

pub fn inc_approval(kind: &str, outcome: &str) {
    if let Some(c) = APPROVALS.as_ref() {
        c.with_label_values(&[kind, outcome]).inc();
    }
}

pub fn inc_receive(stage: &str, outcome: &str) {
    if let Some(c) = RECEIVES.as_ref() {
        c.with_label_values(&[stage, outcome]).inc();
    }
}

pub fn inc_quota_check(outcome: &str) {
    if let Some(c) = QUOTA_CHECKS.as_ref() {
        c.with_label_values(&[outcome]).inc();
    }
}

/// Text exposition of every registered collector.
pub fn gather_text() -> crate::Result<String> {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| crate::Error::Internal(format!("failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| crate::Error::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauges_show_up_in_exposition() {
        set_queue_cap("metrics-test", 7);
        set_queue_size("metrics-test", 3);
        inc_approval("bucket", "ok");
        let text = gather_text().unwrap();
        assert!(text.contains("gfsp_task_queue_cap"));
        assert!(text.contains("metrics-test"));
    }
}
