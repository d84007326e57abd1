use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};

use crate::inbound::InboundOutcome;
use crate::outbound::OutboundOutcome;

/// Tunables for both engines. Injected, never ambient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Dispatch attempts before a queue item turns terminally failed.
    pub max_attempts: i64,
    pub backoff_base_ms: i64,
    pub backoff_cap_ms: i64,
    /// Full pulls closer together than this are skipped.
    pub min_full_sync_interval_ms: i64,
    /// How long the ownership guard waits for a prompt answer.
    pub prompt_timeout_ms: u64,
    /// Kick an outbound drain in the background after each enqueue.
    pub auto_flush: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 300_000,
            min_full_sync_interval_ms: 60_000,
            prompt_timeout_ms: 15_000,
            auto_flush: true,
        }
    }
}

impl SyncConfig {
    /// Capped exponential backoff for the next retry after `attempts`
    /// dispatches have been burned.
    pub fn backoff_delay_ms(&self, attempts: i64) -> i64 {
        let exp = attempts.clamp(0, 30) as u32;
        let factor = 1_i64.checked_shl(exp).unwrap_or(i64::MAX);
        self.backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms)
    }
}

type SharedOutcome<T> = Shared<BoxFuture<'static, T>>;

/// One logical execution at a time; concurrent callers join the in-flight
/// future and observe the same outcome. The winning execution clears the
/// slot on completion so the next call starts fresh.
pub struct SingleFlight<T: Clone> {
    slot: Arc<Mutex<Option<SharedOutcome<T>>>>,
}

impl<T: Clone> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn in_flight(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Join the in-flight execution, or become it.
    pub fn run<F, Fut>(&self, make: F) -> SharedOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        let slot_handle = self.slot.clone();
        let inner = make();
        let wrapped = async move {
            let outcome = inner.await;
            slot_handle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            outcome
        }
        .boxed()
        .shared();
        *slot = Some(wrapped.clone());
        wrapped
    }
}

/// Process-wide sync state, owned by the service and shared by both
/// engines. Nothing here persists across restarts.
#[derive(Clone, Default)]
pub struct SyncSession {
    pub outbound: SingleFlight<OutboundOutcome>,
    pub inbound: SingleFlight<InboundOutcome>,
    last_full_sync_at: Arc<Mutex<Option<i64>>>,
}

impl SyncSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_full_sync_at(&self) -> Option<i64> {
        *self
            .last_full_sync_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_full_sync(&self, at_ms: i64) {
        *self
            .last_full_sync_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(at_ms);
    }

    pub fn is_syncing(&self) -> bool {
        self.outbound.in_flight() || self.inbound.in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn backoff_grows_and_caps() {
        let config = SyncConfig::default();
        let mut last = 0;
        for attempts in 1..=8 {
            let delay = config.backoff_delay_ms(attempts);
            assert!(delay >= last, "backoff must be monotone");
            assert!(delay <= config.backoff_cap_ms);
            last = delay;
        }
        assert_eq!(config.backoff_delay_ms(1), 4_000);
        assert_eq!(config.backoff_delay_ms(2), 8_000);
        assert_eq!(config.backoff_delay_ms(30), config.backoff_cap_ms);
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_callers() {
        let flights: SingleFlight<u32> = SingleFlight::default();
        let runs = Arc::new(AtomicU32::new(0));

        let make = |runs: Arc<AtomicU32>| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            7_u32
        };

        let first = flights.run(|| make(runs.clone()));
        let second = flights.run(|| make(runs.clone()));
        let (a, b) = tokio::join!(first, second);

        assert_eq!(a, 7);
        assert_eq!(b, 7);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slot_clears_after_completion() {
        let flights: SingleFlight<u32> = SingleFlight::default();
        let out = flights.run(|| async { 1_u32 }).await;
        assert_eq!(out, 1);
        assert!(!flights.in_flight());

        // A later call runs fresh rather than replaying the old outcome.
        let out = flights.run(|| async { 2_u32 }).await;
        assert_eq!(out, 2);
    }
}
