//! Global send rate gate.
//!
//! Telegram throttles per bot identity, not per chat, so one gate is shared
//! by every pusher in the process. A 429's retry-after sets a pause deadline;
//! every sender waits it out before touching the API again.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

/// Process-wide pause shared across all pushers.
#[derive(Debug, Default)]
pub struct RateGate {
    /// Unix timestamp (ms) until which sends are paused. 0 = no pause.
    paused_until_ms: AtomicI64,
}

impl RateGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the pause deadline has passed or `cancel` fires.
    ///
    /// Returns `false` when cancelled.
    pub async fn wait(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        loop {
            let until = self.paused_until_ms.load(Ordering::Acquire);
            if until == 0 {
                return true;
            }
            let now = now_ms();
            if now >= until {
                return true;
            }
            let delay = Duration::from_millis((until - now) as u64);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = cancel.changed() => return false,
            }
        }
    }

    /// Record a throttling signal. `retry_after_s` is clamped to `[1, 30]`
    /// and jittered by a uniform factor in `[0.8, 1.2]` so concurrent pushers
    /// don't stampede when the pause lifts.
    pub fn backoff(&self, retry_after_s: u64) {
        let secs = retry_after_s.clamp(1, 30) as f64;
        let jitter: f64 = rand::rng().random_range(0.8..=1.2);
        let until = now_ms() + (secs * jitter * 1000.0) as i64;
        self.paused_until_ms.store(until, Ordering::Release);
    }

    /// Deadline in unix ms; 0 when no pause is active.
    #[must_use]
    pub fn paused_until_ms(&self) -> i64 {
        self.paused_until_ms.load(Ordering::Acquire)
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sets_jittered_deadline() {
        let gate = RateGate::new();
        let before = now_ms();
        gate.backoff(5);
        let until = gate.paused_until_ms();
        // 5s jittered by ±20%.
        assert!(until >= before + 4_000, "deadline too early: {until}");
        assert!(until <= now_ms() + 6_100, "deadline too late: {until}");
    }

    #[test]
    fn backoff_clamps_retry_after() {
        let gate = RateGate::new();
        gate.backoff(0);
        let low = gate.paused_until_ms() - now_ms();
        assert!(low <= 1_300, "zero should clamp to ~1s, got {low}ms");

        gate.backoff(600);
        let high = gate.paused_until_ms() - now_ms();
        assert!(high <= 36_100, "600 should clamp to ~30s, got {high}ms");
    }

    #[tokio::test]
    async fn wait_passes_through_when_unpaused() {
        let gate = RateGate::new();
        let (_tx, mut rx) = watch::channel(false);
        assert!(gate.wait(&mut rx).await);
    }

    #[tokio::test]
    async fn wait_blocks_until_deadline() {
        let gate = RateGate::new();
        gate.paused_until_ms.store(now_ms() + 50, Ordering::Release);
        let (_tx, mut rx) = watch::channel(false);
        let start = std::time::Instant::now();
        assert!(gate.wait(&mut rx).await);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn wait_honors_cancellation() {
        let gate = RateGate::new();
        gate.paused_until_ms
            .store(now_ms() + 60_000, Ordering::Release);
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(!gate.wait(&mut rx).await);
    }
}
