//! Prometheus metrics for the engine.
//!
//! Counters cover the upload pipeline, dedup decisions and the delete path.
//! No per-owner or per-hash labels are used.

use prometheus::{self, Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload pipeline
pub static UPLOADS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vault_uploads_completed_total",
        "Total number of uploads that produced a reference",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vault_upload_bytes_total",
        "Total bytes received by completed uploads, duplicates included",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "vault_upload_duration_seconds",
            "Time from first byte read to reference creation",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .expect("metric creation failed")
});

pub static MEDIA_TYPE_REJECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vault_media_type_rejections_total",
        "Total uploads rejected because the declared media type did not match the content",
    )
    .expect("metric creation failed")
});

// Dedup
pub static DEDUP_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vault_dedup_hits_total",
        "Total uploads resolved to an already stored payload",
    )
    .expect("metric creation failed")
});

pub static PAYLOADS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vault_payloads_created_total",
        "Total number of unique payloads created",
    )
    .expect("metric creation failed")
});

pub static CREATE_CONFLICTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vault_payload_create_conflicts_total",
        "Total payload creations that lost a race on the content hash",
    )
    .expect("metric creation failed")
});

// Delete path
pub static PAYLOADS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vault_payloads_deleted_total",
        "Total number of unique payloads deleted with their last reference",
    )
    .expect("metric creation failed")
});

pub static BLOB_REMOVAL_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vault_blob_removal_failures_total",
        "Total blob removals that failed after the payload record was deleted",
    )
    .expect("metric creation failed")
});

pub static BLOB_RECOMMITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vault_blob_recommits_total",
        "Total blobs committed again after a concurrent deletion removed them",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// This function is idempotent - subsequent calls after the first are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: [Box<dyn prometheus::core::Collector>; 10] = [
            Box::new(UPLOADS_COMPLETED.clone()),
            Box::new(UPLOAD_BYTES.clone()),
            Box::new(UPLOAD_DURATION.clone()),
            Box::new(MEDIA_TYPE_REJECTIONS.clone()),
            Box::new(DEDUP_HITS.clone()),
            Box::new(PAYLOADS_CREATED.clone()),
            Box::new(CREATE_CONFLICTS.clone()),
            Box::new(PAYLOADS_DELETED.clone()),
            Box::new(BLOB_REMOVAL_FAILURES.clone()),
            Box::new(BLOB_RECOMMITS.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// Render all registered metrics in the Prometheus text exposition format.
pub fn encode_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
