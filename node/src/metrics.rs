//! # Prometheus Metrics
//!
//! Operational metrics for the settlement node, scraped at `/metrics` on the
//! configured metrics port.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] prefixed
//! `cloak_`, so they never collide with the default global registry.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use cloak_protocol::settlement::ReconcileReport;
use prometheus::core::Collector;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Identifiers handed out by `generate-identifier`.
    pub identifiers_generated_total: IntCounter,
    /// Claim notifications accepted from recipients.
    pub claim_notifications_total: IntCounter,
    /// Ledger events that changed an index record.
    pub reconcile_events_applied_total: IntCounter,
    /// Index records overwritten from ledger truth.
    pub reconcile_corrections_total: IntCounter,
    /// Claims executed by someone other than the indexed recipient.
    pub claimer_mismatches_total: IntCounter,
    /// Last persisted reconciliation cursor.
    pub reconcile_cursor: IntGauge,
    /// Transfers pending in the index, refreshed after each pass.
    pub pending_transfers: IntGauge,
    /// API handler latency in seconds.
    pub api_request_latency_seconds: Histogram,
}

fn register<T: Collector + Clone + 'static>(registry: &Registry, metric: T) -> prometheus::Result<T> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("cloak".into()), None)?;

        let identifiers_generated_total = register(
            &registry,
            IntCounter::new(
                "identifiers_generated_total",
                "Transfer identifiers generated and recorded as pending",
            )?,
        )?;
        let claim_notifications_total = register(
            &registry,
            IntCounter::new(
                "claim_notifications_total",
                "Claim notifications accepted from recipients",
            )?,
        )?;
        let reconcile_events_applied_total = register(
            &registry,
            IntCounter::new(
                "reconcile_events_applied_total",
                "Ledger events that changed an index record",
            )?,
        )?;
        let reconcile_corrections_total = register(
            &registry,
            IntCounter::new(
                "reconcile_corrections_total",
                "Index records overwritten from the ledger event stream",
            )?,
        )?;
        let claimer_mismatches_total = register(
            &registry,
            IntCounter::new(
                "claimer_mismatches_total",
                "Ledger claims executed by an address other than the indexed recipient",
            )?,
        )?;
        let reconcile_cursor = register(
            &registry,
            IntGauge::new("reconcile_cursor", "Last ledger event sequence applied to the index")?,
        )?;
        let pending_transfers = register(
            &registry,
            IntGauge::new("pending_transfers", "Transfers pending in the index")?,
        )?;
        let api_request_latency_seconds = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "api_request_latency_seconds",
                    "API request handling latency in seconds",
                )
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ]),
            )?,
        )?;

        Ok(Self {
            registry,
            identifiers_generated_total,
            claim_notifications_total,
            reconcile_events_applied_total,
            reconcile_corrections_total,
            claimer_mismatches_total,
            reconcile_cursor,
            pending_transfers,
            api_request_latency_seconds,
        })
    }

    /// Folds one reconciliation pass into the counters.
    pub fn observe_reconcile(&self, report: &ReconcileReport) {
        self.reconcile_events_applied_total.inc_by(report.applied);
        self.reconcile_corrections_total.inc_by(report.corrections);
        self.claimer_mismatches_total.inc_by(report.mismatches);
        self.reconcile_cursor
            .set(i64::try_from(report.cursor).unwrap_or(i64::MAX));
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
