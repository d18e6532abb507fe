//! Poisson-ish outbox scheduler that decouples "a packet is ready to send"
//! from "a packet left the wire".
//!
//! Grounded on the reference `Mixer`: when mixing is enabled, items queue up
//! and are drained from a shuffled, fixed-size outbox one at a time, with a
//! truncated-normal delay between sends and the outbox topped up with cover
//! items whenever the real queue runs dry. When mixing is disabled, items
//! are sent the instant they're enqueued.
//!
//! [`OutboxItem`] is a plain tagged enum rather than a boxed closure: the
//! mixer never needs to know anything about Sphinx, SURBs, or fragments, it
//! only needs a peer id, a packet's bytes, and which metric to bump once the
//! send completes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand_core::{OsRng, RngCore};
use rand_distr::{Distribution, Normal};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::metrics::{MetricField, Metrics};
use crate::session_switch::SessionSwitch;
use crate::PeerId;

/// Supplies cover [`OutboxItem`]s on demand. Kept as a trait rather than a
/// concrete type so the mixer never needs to know how a cover packet is
/// built (Sphinx framing, target selection): it only needs "give me one".
/// The real implementation (see `transport::CoverStash`) pre-builds a stash
/// of full onion packets so this call never blocks on crypto.
#[async_trait]
pub trait CoverGenerator: Send + Sync {
    async fn next_cover(&self) -> Option<OutboxItem>;
}

#[derive(Debug, Clone)]
pub enum OutboxItem {
    Forward { peer: PeerId, packet: Vec<u8> },
    Relay { peer: PeerId, packet: Vec<u8> },
    SurbReply { peer: PeerId, packet: Vec<u8> },
    Resend { peer: PeerId, packet: Vec<u8> },
    Cover { peer: PeerId, packet: Vec<u8> },
}

impl OutboxItem {
    fn peer(&self) -> PeerId {
        match self {
            OutboxItem::Forward { peer, .. }
            | OutboxItem::Relay { peer, .. }
            | OutboxItem::SurbReply { peer, .. }
            | OutboxItem::Resend { peer, .. }
            | OutboxItem::Cover { peer, .. } => *peer,
        }
    }

    fn packet(&self) -> &[u8] {
        match self {
            OutboxItem::Forward { packet, .. }
            | OutboxItem::Relay { packet, .. }
            | OutboxItem::SurbReply { packet, .. }
            | OutboxItem::Resend { packet, .. }
            | OutboxItem::Cover { packet, .. } => packet,
        }
    }

    fn is_cover(&self) -> bool {
        matches!(self, OutboxItem::Cover { .. })
    }
}

#[derive(Debug, Clone)]
pub struct MixerConfig {
    pub enabled: bool,
    pub mu: f64,
    pub std: f64,
    pub outbox_size: usize,
    pub shuffle: bool,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self { enabled: true, mu: 0.005, std: 0.002, outbox_size: 8, shuffle: true }
    }
}

pub struct Mixer {
    config: MixerConfig,
    queue: Mutex<VecDeque<OutboxItem>>,
    outbox: Mutex<Vec<OutboxItem>>,
    session_switch: Arc<SessionSwitch>,
    metrics: Metrics,
    cover_generator: Mutex<Option<Arc<dyn CoverGenerator>>>,
}

impl Mixer {
    pub fn new(config: MixerConfig, session_switch: Arc<SessionSwitch>, metrics: Metrics) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            outbox: Mutex::new(Vec::new()),
            session_switch,
            metrics,
            cover_generator: Mutex::new(None),
        })
    }

    /// Installs the cover-traffic source. Mirrors the reference
    /// `Mixer.set_cover_generator`, called once during wiring before the
    /// outbox loop starts.
    pub async fn set_cover_generator(&self, generator: Arc<dyn CoverGenerator>) {
        *self.cover_generator.lock().await = Some(generator);
    }

    /// Hands a packet to the scheduler. If mixing is disabled the packet is
    /// sent immediately; otherwise it joins the queue and leaves whenever
    /// the outbox loop next drains it.
    pub async fn enqueue(&self, item: OutboxItem) {
        if self.config.enabled {
            self.queue.lock().await.push_back(item);
        } else {
            self.execute(item).await;
        }
    }

    /// Runs the outbox loop until the process exits. Call via
    /// `tokio::spawn(mixer.clone().run())`.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.config.enabled {
                self.update_outbox().await;
                self.metrics.set(MetricField::OutboxDepth, self.outbox.lock().await.len() as i64);

                let interval = sample_truncated_normal(self.config.mu, self.config.std, 0.0, 0.1);
                self.metrics.set_out_interval(interval);
                let start = Instant::now();

                let item = self.outbox.lock().await.pop();
                if let Some(item) = item {
                    self.execute(item).await;
                }

                let elapsed = start.elapsed();
                let sleep_for = interval.saturating_sub(elapsed);
                tokio::time::sleep(sleep_for).await;
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    async fn execute(&self, item: OutboxItem) {
        let peer = item.peer();
        let packet = item.packet().to_vec();
        let sent = self.session_switch.send_to(peer, &packet).await;
        if !sent {
            trace!(peer, "mixer send failed, peer link inactive");
        }
        match &item {
            OutboxItem::Forward { .. } => self.metrics.increment(MetricField::TotalMsgSent),
            OutboxItem::Relay { .. } => self.metrics.increment(MetricField::Forwarded),
            OutboxItem::SurbReply { .. } => self.metrics.increment(MetricField::SurbReplied),
            OutboxItem::Resend { .. } => self.metrics.increment(MetricField::Resent),
            OutboxItem::Cover { .. } => self.metrics.increment(MetricField::CoversSent),
        }
        if !item.is_cover() {
            self.metrics.increment_by(MetricField::TotalBytesSent, packet.len() as i64);
        }
    }

    async fn update_outbox(&self) {
        let mut outbox = self.outbox.lock().await;
        if !outbox.is_empty() {
            return;
        }
        for _ in 0..self.config.outbox_size {
            let popped = {
                let mut queue = self.queue.lock().await;
                queue.pop_front()
            };
            match popped {
                Some(item) => outbox.push(item),
                None => {
                    if let Some(item) = self.cover_item().await {
                        outbox.push(item);
                    }
                }
            }
        }
        if self.config.shuffle {
            fisher_yates_shuffle(&mut outbox);
        }
    }

    async fn cover_item(&self) -> Option<OutboxItem> {
        let generator = self.cover_generator.lock().await.clone();
        match generator {
            Some(generator) => generator.next_cover().await,
            None => {
                warn!("outbox ran dry with no cover generator installed, leaving a gap");
                None
            }
        }
    }
}

/// Fisher-Yates shuffle using a CSPRNG, matching the reference
/// implementation's use of `secrets.randbelow` rather than a PRNG whose
/// state an observer could infer from timing.
fn fisher_yates_shuffle<T>(items: &mut [T]) {
    let n = items.len();
    for i in 0..n {
        let j = i + (OsRng.next_u32() as usize) % (n - i);
        items.swap(i, j);
    }
}

/// Samples from a normal distribution truncated to `[a, b]` via rejection
/// sampling. The reference implementation calls into `scipy.stats.truncnorm`
/// for an exact inverse-CDF sample; rejection sampling gives the same
/// distribution without needing a special-function CDF inverse, at the cost
/// of a bounded number of retries when `[a, b]` is narrow relative to `std`.
fn sample_truncated_normal(mu: f64, std: f64, a: f64, b: f64) -> Duration {
    let normal = Normal::new(mu, std.max(1e-9)).expect("std must be finite and positive");
    let mut rng = rand::rngs::OsRng;
    for _ in 0..1000 {
        let sample = normal.sample(&mut rng);
        if sample >= a && sample <= b {
            return Duration::from_secs_f64(sample);
        }
    }
    Duration::from_secs_f64(mu.clamp(a, b))
}
