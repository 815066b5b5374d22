//! Remote reachability with a short-lived cache.
//!
//! The probe result and the time it was taken share one `AtomicU64` so
//! readers never see a reachable flag paired with someone else's timestamp.
//! Bit 63 is the reachable flag, the low bits are milliseconds since the
//! monitor was created plus one (zero means "never probed").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::remote::RemoteStore;

const REACHABLE_BIT: u64 = 1 << 63;
const STAMP_MASK: u64 = REACHABLE_BIT - 1;

pub struct ConnectivityMonitor {
    remote: Arc<dyn RemoteStore>,
    probe_timeout: Duration,
    cache_ttl: Duration,
    epoch: Instant,
    last: AtomicU64,
}

impl ConnectivityMonitor {
    pub fn new(remote: Arc<dyn RemoteStore>, probe_timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            remote,
            probe_timeout,
            cache_ttl,
            epoch: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    /// Whether the remote answered a probe recently enough to be trusted,
    /// probing when the cached answer has expired. A timed-out or failed
    /// probe counts as unreachable.
    pub async fn is_reachable(&self) -> bool {
        if let Some(reachable) = self.cached() {
            return reachable;
        }

        let reachable = match tokio::time::timeout(self.probe_timeout, self.remote.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Reachability probe failed: {e}");
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.probe_timeout.as_millis() as u64, "Reachability probe timed out");
                false
            }
        };

        let previous = self.last.swap(self.pack(reachable), Ordering::AcqRel);
        if previous != 0 && (previous & REACHABLE_BIT != 0) != reachable {
            info!(reachable, "Remote reachability changed");
        }
        reachable
    }

    /// Cached answer if it is still fresh.
    pub fn cached(&self) -> Option<bool> {
        let packed = self.last.load(Ordering::Acquire);
        let stamp = packed & STAMP_MASK;
        if stamp == 0 {
            return None;
        }
        let taken_at = Duration::from_millis(stamp - 1);
        let age = self.epoch.elapsed().saturating_sub(taken_at);
        (age < self.cache_ttl).then_some(packed & REACHABLE_BIT != 0)
    }

    /// Forget the cached answer, e.g. after a push hit a transport error.
    pub fn invalidate(&self) {
        self.last.store(0, Ordering::Release);
    }

    fn pack(&self, reachable: bool) -> u64 {
        let millis = (self.epoch.elapsed().as_millis() as u64).min(STAMP_MASK - 1) + 1;
        if reachable {
            millis | REACHABLE_BIT
        } else {
            millis
        }
    }
}
