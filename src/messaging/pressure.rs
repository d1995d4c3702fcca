// Backpressure guards.
//
// Outbound: a high/low watermark over in-flight requests; at the high mark
// the configured policy either blocks the sender until the queue drains
// below the low mark or fails the send. Inbound: a queue counter whose
// crossings drive pause/resume of the transport reader.

use crate::config::{BackpressureConfig, OverflowPolicy};
use crate::error::{ClusterError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Outbound in-flight bound.
pub struct SendPressureGuard {
    high: usize,
    low: usize,
    policy: OverflowPolicy,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl SendPressureGuard {
    pub fn new(config: &BackpressureConfig) -> Self {
        Self {
            high: config.out_high_watermark.max(1),
            low: config.out_low_watermark,
            policy: config.out_overflow,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Takes one in-flight slot, blocking or failing per policy at the high
    /// watermark.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            let current = self.in_flight.load(Ordering::Acquire);
            if current < self.high {
                if self
                    .in_flight
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }

            match self.policy {
                OverflowPolicy::Fail => {
                    return Err(ClusterError::Messaging(format!(
                        "send queue overflow ({} in flight)",
                        current
                    )));
                }
                OverflowPolicy::Block => {
                    let notified = self.drained.notified();
                    if self.in_flight.load(Ordering::Acquire) >= self.high {
                        notified.await;
                    }
                }
            }
        }
    }

    /// Releases one slot; wakes blocked senders once below the low mark.
    pub fn release(&self) {
        let previous = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
        if previous.saturating_sub(1) <= self.low {
            self.drained.notify_waiters();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Inbound queue counter; the boolean results signal watermark crossings.
pub struct ReceivePressureGuard {
    high: usize,
    low: usize,
    queued: AtomicUsize,
}

impl ReceivePressureGuard {
    pub fn new(config: &BackpressureConfig) -> Self {
        Self {
            high: config.in_high_watermark.max(1),
            low: config.in_low_watermark,
            queued: AtomicUsize::new(0),
        }
    }

    /// Returns true when this enqueue crossed the high watermark and the
    /// reader must be paused.
    pub fn on_enqueue(&self) -> bool {
        let now = self.queued.fetch_add(1, Ordering::AcqRel) + 1;
        now == self.high
    }

    /// Returns true when this dequeue reached the low watermark and a paused
    /// reader must resume.
    pub fn on_dequeue(&self) -> bool {
        let now = self.queued.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        now == self.low
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(high: usize, low: usize, policy: OverflowPolicy) -> BackpressureConfig {
        BackpressureConfig {
            out_high_watermark: high,
            out_low_watermark: low,
            out_overflow: policy,
            in_high_watermark: high,
            in_low_watermark: low,
        }
    }

    #[tokio::test]
    async fn test_fail_policy_rejects_at_high_watermark() {
        let guard = SendPressureGuard::new(&config(2, 1, OverflowPolicy::Fail));
        guard.acquire().await.unwrap();
        guard.acquire().await.unwrap();
        let err = guard.acquire().await.unwrap_err();
        assert!(matches!(err, ClusterError::Messaging(_)));

        guard.release();
        guard.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_drain() {
        let guard = Arc::new(SendPressureGuard::new(&config(1, 0, OverflowPolicy::Block)));
        guard.acquire().await.unwrap();

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard.acquire().await.unwrap();
            })
        };

        // The waiter must be parked, not failed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        guard.release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(guard.in_flight(), 1);
    }

    #[test]
    fn test_receive_guard_crossings() {
        let guard = ReceivePressureGuard::new(&config(3, 1, OverflowPolicy::Block));

        assert!(!guard.on_enqueue()); // 1
        assert!(!guard.on_enqueue()); // 2
        assert!(guard.on_enqueue()); // 3: crossed high
        assert!(!guard.on_enqueue()); // 4

        assert!(!guard.on_dequeue()); // 3
        assert!(!guard.on_dequeue()); // 2
        assert!(guard.on_dequeue()); // 1: reached low
        assert!(!guard.on_dequeue()); // 0
    }
}
