//! Operational counters, pushed periodically to an external collector.
//!
//! Grounded on the reference `Metrics` class: one flat table of named
//! fields, a change log of updates since the last successful push, and a
//! background loop that POSTs the log and clears it only on success. We
//! replace the Python thread with a tokio task and `reqwest`, and the
//! `Dict[MetricField, int]` table with atomics so increments never need a
//! lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

/// Named counters pushed to the metrics controller. Mirrors the reference
/// implementation's `MetricField` enum one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricField {
    FragmentsReceived,
    FragmentsSent,
    TotalMsgSent,
    TotalMsgReceived,
    TotalBytesSent,
    TotalBytesReceived,
    Forwarded,
    SurbReplied,
    SurbReceived,
    Errors,
    Resent,
    ActivePeers,
    CoversSent,
    UnackedMsg,
    DuplicatesDropped,
    OutboxDepth,
    OutInterval,
    LastRtt,
    AvgRtt,
    DeletedCacheForInactive,
}

impl MetricField {
    fn name(self) -> &'static str {
        match self {
            MetricField::FragmentsReceived => "fragments_received",
            MetricField::FragmentsSent => "fragments_sent",
            MetricField::TotalMsgSent => "total_sent",
            MetricField::TotalMsgReceived => "total_received",
            MetricField::TotalBytesSent => "total_bytes_sent",
            MetricField::TotalBytesReceived => "total_bytes_received",
            MetricField::Forwarded => "forwarded",
            MetricField::SurbReplied => "surb_replied",
            MetricField::SurbReceived => "surb_received",
            MetricField::Errors => "errors",
            MetricField::Resent => "resent",
            MetricField::ActivePeers => "active_peers",
            MetricField::CoversSent => "covers_sent",
            MetricField::UnackedMsg => "unacked_msg",
            MetricField::DuplicatesDropped => "duplicates_dropped",
            MetricField::OutboxDepth => "outbox_depth",
            MetricField::OutInterval => "out_interval_ms",
            MetricField::LastRtt => "last_rtt_ms",
            MetricField::AvgRtt => "avg_rtt_ms",
            MetricField::DeletedCacheForInactive => "deleted_cache_for_inactive",
        }
    }

    const ALL: [MetricField; 20] = [
        MetricField::FragmentsReceived,
        MetricField::FragmentsSent,
        MetricField::TotalMsgSent,
        MetricField::TotalMsgReceived,
        MetricField::TotalBytesSent,
        MetricField::TotalBytesReceived,
        MetricField::Forwarded,
        MetricField::SurbReplied,
        MetricField::SurbReceived,
        MetricField::Errors,
        MetricField::Resent,
        MetricField::ActivePeers,
        MetricField::CoversSent,
        MetricField::UnackedMsg,
        MetricField::DuplicatesDropped,
        MetricField::OutboxDepth,
        MetricField::OutInterval,
        MetricField::LastRtt,
        MetricField::AvgRtt,
        MetricField::DeletedCacheForInactive,
    ];
}

#[derive(Serialize)]
struct MetricUpdate {
    timestamp: String,
    field: &'static str,
    value: i64,
    node: String,
}

struct Inner {
    data: HashMap<&'static str, AtomicI64>,
    changed: Mutex<std::collections::HashSet<&'static str>>,
    node_label: String,
    controller_url: Option<String>,
}

/// Cheap to clone: every clone shares the same atomics, matching the
/// reference implementation's single process-wide `metrics()` singleton
/// without needing one (each component just holds its own `Metrics` handle).
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

impl Metrics {
    pub fn new(node_label: String, controller_url: Option<String>) -> Self {
        let data = MetricField::ALL.iter().map(|f| (f.name(), AtomicI64::new(0))).collect();
        Self {
            inner: Arc::new(Inner {
                data,
                changed: Mutex::new(std::collections::HashSet::new()),
                node_label,
                controller_url,
            }),
        }
    }

    pub fn new_disabled() -> Self {
        Self::new("disabled".to_string(), None)
    }

    pub fn increment(&self, field: MetricField) {
        self.increment_by(field, 1);
    }

    pub fn increment_by(&self, field: MetricField, amount: i64) {
        if let Some(counter) = self.inner.data.get(field.name()) {
            counter.fetch_add(amount, Ordering::Relaxed);
        }
        self.mark_changed(field.name());
    }

    pub fn set(&self, field: MetricField, value: i64) {
        if let Some(counter) = self.inner.data.get(field.name()) {
            counter.store(value, Ordering::Relaxed);
        }
        self.mark_changed(field.name());
    }

    pub fn get(&self, field: MetricField) -> i64 {
        self.inner.data.get(field.name()).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    fn mark_changed(&self, name: &'static str) {
        if let Ok(mut changed) = self.inner.changed.try_lock() {
            changed.insert(name);
        }
    }

    pub fn increment_unacked(&self) {
        self.increment(MetricField::UnackedMsg);
    }

    pub fn decrement_unacked(&self) {
        self.increment_by(MetricField::UnackedMsg, -1);
    }

    pub fn set_last_rtt(&self, rtt: Duration) {
        self.set(MetricField::LastRtt, rtt.as_millis() as i64);
    }

    pub fn set_avg_rtt(&self, rtt: Duration) {
        self.set(MetricField::AvgRtt, rtt.as_millis() as i64);
    }

    pub fn set_out_interval(&self, interval: Duration) {
        self.set(MetricField::OutInterval, interval.as_millis() as i64);
    }

    pub fn record_duplicate(&self) {
        self.increment(MetricField::DuplicatesDropped);
    }

    pub fn snapshot(&self) -> HashMap<&'static str, i64> {
        MetricField::ALL.iter().map(|f| (f.name(), self.get(*f))).collect()
    }

    /// One push cycle: collects everything that changed since the last
    /// successful push and POSTs it. On any failure (network error or
    /// non-2xx), the changed-set is left intact so the next cycle retries
    /// with the same (and any newer) fields, same as `_push_metrics`.
    pub async fn push_once(&self, client: &reqwest::Client) {
        let Some(url) = self.inner.controller_url.as_ref() else { return };

        let changed: Vec<&'static str> = {
            let changed = self.inner.changed.lock().await;
            changed.iter().copied().collect()
        };
        if changed.is_empty() {
            return;
        }

        let timestamp = chrono::Utc::now().to_rfc3339();
        let updates: Vec<MetricUpdate> = changed
            .iter()
            .map(|name| MetricUpdate {
                timestamp: timestamp.clone(),
                field: name,
                value: self.inner.data.get(name).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0),
                node: self.inner.node_label.clone(),
            })
            .collect();

        match client.post(format!("{url}/metrics/push")).json(&updates).send().await {
            Ok(response) if response.status().is_success() => {
                let mut guard = self.inner.changed.lock().await;
                for name in &changed {
                    guard.remove(name);
                }
            }
            Ok(response) => warn!(status = %response.status(), "metrics push rejected"),
            Err(error) => warn!(%error, "metrics push failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_and_decrement_track_unacked() {
        let metrics = Metrics::new_disabled();
        metrics.increment_unacked();
        metrics.increment_unacked();
        metrics.decrement_unacked();
        assert_eq!(metrics.get(MetricField::UnackedMsg), 1);
    }

    #[tokio::test]
    async fn push_is_a_no_op_without_a_controller_url() {
        let metrics = Metrics::new_disabled();
        metrics.increment(MetricField::FragmentsSent);
        let client = reqwest::Client::new();
        metrics.push_once(&client).await;
    }
}
