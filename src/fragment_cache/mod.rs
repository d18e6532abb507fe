//! Tracks fragments awaiting a SURB acknowledgement.
//!
//! Every non-cover fragment we emit is kept here until its SURB comes back.
//! `sweep_stale` hands the resend loop every fragment older than the resend
//! window and, in the same pass, marks each one acked. That means a
//! fragment gets at most one resend attempt per original emission: if the
//! resend itself is lost, nothing notices, because by the time the next
//! sweep runs the fragment has already been marked acked and dropped. This
//! matches `get_older_than` in the reference cache, which does the same
//! thing for the same reason (a naive "resend until acked" loop would
//! otherwise flood the mix with the same fragment every sweep interval).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::metrics::Metrics;
use crate::sphinx::SurbMaterial;
use crate::PeerId;

pub type SurbId = Vec<u8>;

#[derive(Debug, Clone)]
pub struct Fragment {
    pub surb_id: SurbId,
    pub surb_material: SurbMaterial,
    pub target_peer: PeerId,
    pub payload: Vec<u8>,
    pub created_at: Instant,
    pub acked: bool,
    pub cover: bool,
}

pub struct FragmentCache {
    cache: Mutex<HashMap<SurbId, Fragment>>,
    rtts: Mutex<Vec<Duration>>,
    metrics: Metrics,
    resend_period: Duration,
}

impl FragmentCache {
    pub fn new(metrics: Metrics, resend_period: Duration) -> Self {
        Self { cache: Mutex::new(HashMap::new()), rtts: Mutex::new(Vec::new()), metrics, resend_period }
    }

    pub async fn insert(
        &self,
        surb_id: SurbId,
        surb_material: SurbMaterial,
        target_peer: PeerId,
        payload: Vec<u8>,
        cover: bool,
    ) {
        let fragment = Fragment {
            surb_id: surb_id.clone(),
            surb_material,
            target_peer,
            payload,
            created_at: Instant::now(),
            acked: false,
            cover,
        };
        let mut cache = self.cache.lock().await;
        cache.insert(surb_id, fragment);
        if !cover {
            self.metrics.increment_unacked();
        }
    }

    /// Records a SURB arrival: marks the fragment acked and returns its
    /// target peer, for use by callers that just need to know who replied.
    pub async fn ack(&self, surb_id: &[u8]) -> Option<PeerId> {
        let mut cache = self.cache.lock().await;
        let Some(fragment) = cache.get(surb_id) else { return None };
        let target = fragment.target_peer;
        let created_at = fragment.created_at;
        drop(cache);

        self.set_acked(surb_id).await;

        let rtt = created_at.elapsed();
        if rtt < self.resend_period {
            let mut rtts = self.rtts.lock().await;
            rtts.push(rtt);
            self.metrics.set_last_rtt(rtt);
            let avg = rtts.iter().sum::<Duration>() / rtts.len() as u32;
            self.metrics.set_avg_rtt(avg);
        }
        Some(target)
    }

    async fn set_acked(&self, surb_id: &[u8]) {
        let mut cache = self.cache.lock().await;
        if let Some(fragment) = cache.get_mut(surb_id) {
            if !fragment.acked && !fragment.cover {
                self.metrics.decrement_unacked();
            }
            fragment.acked = true;
        }
    }

    /// Drops every outstanding fragment addressed to `peer`, as if it had
    /// acked them all. Used when a peer disconnects and further resends
    /// would be pointless.
    pub async fn drop_for_peer(&self, peer: PeerId) -> usize {
        let mut cache = self.cache.lock().await;
        let stale: Vec<SurbId> = cache
            .iter()
            .filter(|(_, f)| f.target_peer == peer)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(fragment) = cache.get(id) {
                if !fragment.acked && !fragment.cover {
                    self.metrics.decrement_unacked();
                }
            }
            cache.remove(id);
        }
        stale.len()
    }

    async fn clear_acked(&self) -> usize {
        let mut cache = self.cache.lock().await;
        let before = cache.len();
        cache.retain(|_, f| !f.acked);
        let removed = before - cache.len();
        debug!(removed, "cleared acked fragments from cache");
        removed
    }

    /// Returns every unacked, non-cover fragment older than `max_age`, and
    /// marks each one acked so it will not be returned again.
    pub async fn sweep_stale(&self, max_age: Duration) -> Vec<Fragment> {
        self.clear_acked().await;

        let cutoff = Instant::now().checked_sub(max_age).unwrap_or_else(Instant::now);
        let stale: Vec<Fragment> = {
            let cache = self.cache.lock().await;
            cache
                .values()
                .filter(|f| f.created_at < cutoff && !f.acked && !f.cover)
                .cloned()
                .collect()
        };
        for fragment in &stale {
            self.set_acked(&fragment.surb_id).await;
        }
        stale
    }

    pub async fn all_acked(&self) -> bool {
        let cache = self.cache.lock().await;
        cache.values().all(|f| f.acked || f.cover)
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }
}
