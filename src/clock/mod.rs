//! Background scheduling: resend sweeps, cover-stash top-up, and metrics
//! flushes, each running as its own independently-failing tokio task.
//!
//! Grounded on the reference `resend_loop` (a `while True` sleeping
//! `ConfigStore.resend_time` between sweeps) and on `@log_exceptions`, which
//! wraps every such loop so one bad iteration logs and continues rather than
//! killing the task. Rust has no decorator equivalent, so each loop body
//! below is itself a `loop { ... }` with the fallible step wrapped in a
//! function call whose errors are already caught and logged internally by
//! the callee (`Transport`'s methods never return `Err` to their caller);
//! this module only owns the timing, not the error handling.

use std::sync::Arc;
use std::time::Duration;

use crate::metrics::Metrics;
use crate::transport::Transport;

/// How often the cover stash is topped back up. Independent of
/// `resend_period`: cover traffic needs to stay available on every mixer
/// tick, not just once per resend window.
const COVER_TOPUP_INTERVAL: Duration = Duration::from_secs(2);

/// Spawns the resend sweep, cover top-up, and metrics flush loops, each as
/// its own task. Returns their `JoinHandle`s so a caller can await them at
/// shutdown, though none of them return under normal operation.
pub fn spawn_background_loops(
    transport: Arc<Transport>,
    metrics: Metrics,
    metrics_client: reqwest::Client,
    resend_period: Duration,
    metrics_push_interval: Duration,
) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(resend_loop(transport.clone(), resend_period)),
        tokio::spawn(cover_topup_loop(transport.clone())),
        tokio::spawn(purge_loop(transport, resend_period)),
        tokio::spawn(metrics_flush_loop(metrics, metrics_client, metrics_push_interval)),
    ]
}

/// Resends fragments older than `resend_period` on a fixed interval. Mirrors
/// `resend_loop`'s "sweep, then sleep for the same duration" shape.
async fn resend_loop(transport: Arc<Transport>, resend_period: Duration) {
    loop {
        transport.resend_stale(resend_period).await;
        tokio::time::sleep(resend_period).await;
    }
}

/// Drops fragments addressed to peers that have gone inactive since the last
/// pass, so the resend loop stops chasing a peer that will never ack.
async fn purge_loop(transport: Arc<Transport>, resend_period: Duration) {
    loop {
        transport.purge_inactive_peers().await;
        tokio::time::sleep(resend_period).await;
    }
}

/// Keeps the cover stash topped up independently of the mixer's own
/// just-in-time refill, so a burst of outbox drains never leaves the mixer
/// waiting on crypto mid-tick.
async fn cover_topup_loop(transport: Arc<Transport>) {
    loop {
        transport.topup_cover_stash().await;
        tokio::time::sleep(COVER_TOPUP_INTERVAL).await;
    }
}

/// Pushes accumulated metric changes to the controller on a fixed interval.
/// A no-op per tick when no controller URL is configured, same as
/// `Metrics::push_once`.
async fn metrics_flush_loop(metrics: Metrics, client: reqwest::Client, interval: Duration) {
    loop {
        metrics.push_once(&client).await;
        tokio::time::sleep(interval).await;
    }
}
