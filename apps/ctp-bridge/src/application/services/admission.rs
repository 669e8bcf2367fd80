//! Tier Admission Control
//!
//! Each service tier owns one `TierAdmission`:
//!
//! - a FIFO gate, so callers are admitted strictly in arrival order
//! - a concurrency semaphore bounding calls in flight
//! - a token bucket bounding admissions per second
//! - a backlog bound on callers waiting at the gate
//!
//! A caller that finds the backlog full is rejected immediately. A caller
//! that gets in holds an [`AdmissionPermit`] until its call completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::domain::tier::ServiceTier;
use crate::infrastructure::metrics;

/// Admission limits for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    /// Maximum calls in flight.
    pub max_concurrent: usize,
    /// Admissions per second (also the bucket burst size).
    pub rate_per_sec: u32,
    /// Waiting callers allowed per unit of rate.
    pub backlog_multiplier: u32,
}

impl TierLimits {
    /// Maximum number of callers allowed to wait.
    ///
    /// A zero multiplier or rate counts as one, so a tier can always hold
    /// at least the caller it is about to serve.
    #[must_use]
    pub const fn max_backlog(&self) -> usize {
        let multiplier = if self.backlog_multiplier == 0 {
            1
        } else {
            self.backlog_multiplier
        };
        let rate = if self.rate_per_sec == 0 {
            1
        } else {
            self.rate_per_sec
        };
        (multiplier as usize).saturating_mul(rate as usize)
    }
}

/// Admission failures.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Backlog full.
    #[error("{tier} tier overloaded: {waiting} callers already waiting (limit {limit})")]
    Overflow {
        /// Tier that rejected the call.
        tier: ServiceTier,
        /// Callers waiting at the time.
        waiting: usize,
        /// Configured backlog bound.
        limit: usize,
    },

    /// The concurrency semaphore was closed.
    #[error("{tier} tier is shut down")]
    Closed {
        /// Tier that rejected the call.
        tier: ServiceTier,
    },
}

// =============================================================================
// Token Bucket
// =============================================================================

/// Token bucket refilled continuously at `rate` tokens per second.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Full bucket holding `rate` tokens.
    #[must_use]
    pub fn new(rate_per_sec: u32) -> Self {
        let rate = f64::from(rate_per_sec.max(1));
        Self {
            capacity: rate,
            tokens: rate,
            rate,
            last_refill: Instant::now(),
        }
    }

    /// Take one token, or return how long until one is available.
    ///
    /// # Errors
    ///
    /// Returns the wait duration when the bucket is empty.
    pub fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed.mul_add(self.rate, self.tokens).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.rate))
        }
    }
}

// =============================================================================
// Tier Admission
// =============================================================================

/// Point-in-time admission statistics for one tier.
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    /// Tier.
    pub tier: ServiceTier,
    /// Calls holding a concurrency slot.
    pub in_flight: usize,
    /// Callers waiting for admission.
    pub waiting: usize,
    /// Concurrency bound.
    pub max_concurrent: usize,
    /// Backlog bound.
    pub max_backlog: usize,
    /// Admissions per second.
    pub rate_per_sec: u32,
    /// Calls admitted so far.
    pub admitted_total: u64,
    /// Calls rejected for backlog overflow.
    pub rejected_total: u64,
}

/// Admission controller for one service tier.
#[derive(Debug)]
pub struct TierAdmission {
    tier: ServiceTier,
    limits: TierLimits,
    gate: tokio::sync::Mutex<()>,
    slots: Arc<Semaphore>,
    bucket: parking_lot::Mutex<TokenBucket>,
    waiting: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl TierAdmission {
    /// Controller with the given limits.
    #[must_use]
    pub fn new(tier: ServiceTier, limits: TierLimits) -> Self {
        Self {
            tier,
            limits,
            gate: tokio::sync::Mutex::new(()),
            slots: Arc::new(Semaphore::new(limits.max_concurrent.max(1))),
            bucket: parking_lot::Mutex::new(TokenBucket::new(limits.rate_per_sec)),
            waiting: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Tier this controller governs.
    #[must_use]
    pub const fn tier(&self) -> ServiceTier {
        self.tier
    }

    /// Configured limits.
    #[must_use]
    pub const fn limits(&self) -> TierLimits {
        self.limits
    }

    /// Wait for admission.
    ///
    /// Callers are served in arrival order: the gate is a FIFO mutex, and the
    /// holder of the gate is the only caller waiting for a slot or a token.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::Overflow` immediately if the backlog is full.
    pub async fn admit(&self) -> Result<AdmissionPermit, AdmissionError> {
        let limit = self.limits.max_backlog();
        let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        if waiting >= limit {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            metrics::record_admission_rejection(self.tier);
            tracing::warn!(tier = %self.tier, waiting, limit, "Tier backlog full, rejecting call");
            return Err(AdmissionError::Overflow {
                tier: self.tier,
                waiting,
                limit,
            });
        }
        let waiting_guard = WaitingGuard {
            tier: self.tier,
            waiting: &self.waiting,
        };
        metrics::set_tier_backlog(self.tier, waiting + 1);

        let gate = self.gate.lock().await;
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed { tier: self.tier })?;
        self.take_token().await;
        drop(gate);
        drop(waiting_guard);

        self.admitted.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_tier_in_flight(self.tier, in_flight);

        Ok(AdmissionPermit {
            tier: self.tier,
            _slot: slot,
            in_flight: Arc::clone(&self.in_flight),
            admitted_at: Instant::now(),
        })
    }

    async fn take_token(&self) {
        loop {
            let wait = match self.bucket.lock().try_take(Instant::now()) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> TierStats {
        TierStats {
            tier: self.tier,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            waiting: self.waiting.load(Ordering::SeqCst),
            max_concurrent: self.limits.max_concurrent.max(1),
            max_backlog: self.limits.max_backlog(),
            rate_per_sec: self.limits.rate_per_sec,
            admitted_total: self.admitted.load(Ordering::Relaxed),
            rejected_total: self.rejected.load(Ordering::Relaxed),
        }
    }
}

struct WaitingGuard<'a> {
    tier: ServiceTier,
    waiting: &'a AtomicUsize,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        let left = self.waiting.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_tier_backlog(self.tier, left);
    }
}

/// Proof of admission; releases the concurrency slot on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    tier: ServiceTier,
    _slot: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
    admitted_at: Instant,
}

impl AdmissionPermit {
    /// Tier that admitted the call.
    #[must_use]
    pub const fn tier(&self) -> ServiceTier {
        self.tier
    }

    /// Time since admission.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.admitted_at.elapsed()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let left = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_tier_in_flight(self.tier, left);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_concurrent: usize, rate_per_sec: u32, backlog_multiplier: u32) -> TierLimits {
        TierLimits {
            max_concurrent,
            rate_per_sec,
            backlog_multiplier,
        }
    }

    #[test]
    fn backlog_is_multiplier_times_rate() {
        assert_eq!(limits(1, 100, 60).max_backlog(), 6000);
        assert_eq!(limits(1, 1, 60).max_backlog(), 60);
        assert_eq!(limits(1, 10, 0).max_backlog(), 10);
        assert_eq!(limits(1, 0, 0).max_backlog(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_multiplier_still_admits_idle_tier() {
        let admission = TierAdmission::new(ServiceTier::Query, limits(1, 10, 0));

        let permit = admission.admit().await.unwrap();
        assert_eq!(admission.stats().admitted_total, 1);
        assert_eq!(admission.stats().rejected_total, 0);
        drop(permit);

        admission.admit().await.unwrap();
        assert_eq!(admission.stats().admitted_total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_at_rate() {
        let mut bucket = TokenBucket::new(2);
        let now = Instant::now();
        assert!(bucket.try_take(now).is_ok());
        assert!(bucket.try_take(now).is_ok());
        let wait = bucket.try_take(now).unwrap_err();
        assert_eq!(wait, Duration::from_millis(500));

        assert!(bucket.try_take(now + Duration::from_millis(500)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn admissions_are_rate_limited() {
        let admission = TierAdmission::new(ServiceTier::Query, limits(4, 1, 60));
        let start = Instant::now();

        let first = admission.admit().await.unwrap();
        drop(first);
        let second = admission.admit().await.unwrap();
        drop(second);

        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(admission.stats().admitted_total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_slot_held_until_permit_drops() {
        let admission = Arc::new(TierAdmission::new(ServiceTier::OrderAction, limits(1, 100, 60)));
        let held = admission.admit().await.unwrap();
        assert_eq!(admission.stats().in_flight, 1);

        let waiter = {
            let admission = Arc::clone(&admission);
            tokio::spawn(async move { admission.admit().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(admission.stats().waiting, 1);

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(admission.stats().in_flight, 0);
        assert_eq!(admission.stats().waiting, 0);
    }

    #[tokio::test]
    async fn released_slot_wakes_the_waiter() {
        let admission = TierAdmission::new(ServiceTier::OrderAction, limits(1, 100, 60));
        let held = admission.admit().await.unwrap();

        let mut waiter = tokio_test::task::spawn(admission.admit());
        tokio_test::assert_pending!(waiter.poll());

        drop(held);
        assert!(waiter.is_woken());
        let permit = tokio_test::assert_ready_ok!(waiter.poll());
        assert_eq!(permit.tier(), ServiceTier::OrderAction);
    }

    #[tokio::test(start_paused = true)]
    async fn full_backlog_rejects_immediately() {
        // backlog = 1 x 1
        let admission = Arc::new(TierAdmission::new(ServiceTier::Query, limits(1, 1, 1)));
        let held = admission.admit().await.unwrap();

        let waiter = {
            let admission = Arc::clone(&admission);
            tokio::spawn(async move { admission.admit().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert_eq!(admission.stats().waiting, 1);

        let rejected = admission.admit().await.unwrap_err();
        assert!(matches!(rejected, AdmissionError::Overflow { limit: 1, .. }));
        assert_eq!(admission.stats().rejected_total, 1);

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_leaves_backlog() {
        let admission = Arc::new(TierAdmission::new(ServiceTier::Query, limits(1, 1, 60)));
        let held = admission.admit().await.unwrap();

        let waiter = {
            let admission = Arc::clone(&admission);
            tokio::spawn(async move { admission.admit().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert_eq!(admission.stats().waiting, 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(admission.stats().waiting, 0);
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn admission_order_is_fifo() {
        let admission = Arc::new(TierAdmission::new(ServiceTier::OrderAction, limits(1, 100, 60)));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let held = admission.admit().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let admission = Arc::clone(&admission);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let permit = admission.admit().await.unwrap();
                order.lock().push(i);
                tokio::time::sleep(Duration::from_millis(1)).await;
                drop(permit);
            }));
            tokio::task::yield_now().await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }
}
