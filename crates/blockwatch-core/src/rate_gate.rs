//! Sliding-window rate gates protecting the remote API.
//!
//! A [`RateGate`] admits at most `occurrences` acquisitions within any rolling
//! `window`. It is a counting semaphore plus an ordered queue of slot-expiry
//! instants: every admission consumes a permit and enqueues `now + window`; a
//! single background timer pops expired entries, returns one permit per entry
//! and re-arms itself for the next pending expiry (or a full window if the queue
//! is empty).
//!
//! ```text
//!   acquire ──► semaphore ──► push(now + window)
//!                  ▲                   │
//!                  └── add_permits ◄── exit timer (pops expired)
//! ```

use crate::error::{BlockwatchError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Occurrences allowed per rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Admissions allowed per window.
    pub occurrences: u32,
    /// Length of the rolling window.
    pub window: Duration,
}

impl RateLimit {
    /// Creates a limit of `occurrences` per `window`.
    pub fn new(occurrences: u32, window: Duration) -> Self {
        Self {
            occurrences,
            window,
        }
    }

    /// At most one admission per `window`.
    pub fn once_per(window: Duration) -> Self {
        Self::new(1, window)
    }

    /// Rejects zero occurrences and empty windows.
    pub fn validate(&self) -> Result<()> {
        if self.occurrences == 0 {
            return Err(BlockwatchError::invalid_config(
                "number of occurrences must be a positive integer",
            ));
        }
        if self.window.is_zero() {
            return Err(BlockwatchError::invalid_config(
                "time window must be a positive span of time",
            ));
        }
        Ok(())
    }
}

struct GateState {
    semaphore: Semaphore,
    expiries: Mutex<VecDeque<Instant>>,
    window: Duration,
}

impl GateState {
    fn record_admission(&self) {
        let mut expiries = self.expiries.lock();
        // Stamped under the lock so the queue stays ordered.
        expiries.push_back(Instant::now() + self.window);
    }

    /// Returns one permit per expired slot and the instant of the next check.
    fn release_expired(&self, now: Instant) -> Instant {
        let mut expiries = self.expiries.lock();
        let mut released = 0;
        while let Some(expiry) = expiries.front() {
            if *expiry > now {
                break;
            }
            expiries.pop_front();
            released += 1;
        }
        if released > 0 {
            self.semaphore.add_permits(released);
            trace!(released, "rate gate slots expired");
        }
        expiries.front().copied().unwrap_or(now + self.window)
    }
}

async fn run_exit_timer(state: Arc<GateState>, stop: CancellationToken) {
    let mut next_check = Instant::now() + state.window;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep_until(next_check) => {}
        }
        next_check = state.release_expired(Instant::now());
    }
}

/// Admits at most `occurrences` callers per rolling `window`.
///
/// Must be created inside a tokio runtime: the exit timer runs as a task that
/// lives until the gate is closed or dropped.
pub struct RateGate {
    state: Arc<GateState>,
    limit: RateLimit,
    closed: AtomicBool,
    stop: CancellationToken,
}

impl RateGate {
    /// Creates a gate, validating `limit`.
    pub fn new(limit: RateLimit) -> Result<Self> {
        limit.validate()?;
        Ok(Self::start(limit))
    }

    fn start(limit: RateLimit) -> Self {
        let state = Arc::new(GateState {
            semaphore: Semaphore::new(limit.occurrences as usize),
            expiries: Mutex::new(VecDeque::with_capacity(limit.occurrences as usize)),
            window: limit.window,
        });
        let stop = CancellationToken::new();
        tokio::spawn(run_exit_timer(state.clone(), stop.clone()));

        Self {
            state,
            limit,
            closed: AtomicBool::new(false),
            stop,
        }
    }

    /// Suspends until a slot is free or `cancel` fires.
    ///
    /// A cancelled acquisition never holds a slot.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BlockwatchError::Closed { what: "rate gate" });
        }
        if cancel.is_cancelled() {
            return Err(BlockwatchError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BlockwatchError::Cancelled),
            permit = self.state.semaphore.acquire() => {
                let permit = permit.map_err(|_| BlockwatchError::Closed { what: "rate gate" })?;
                permit.forget();
                self.state.record_admission();
                Ok(())
            }
        }
    }

    /// The configured limit.
    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Slots that can be taken right now without waiting.
    pub fn available(&self) -> usize {
        self.state.semaphore.available_permits()
    }

    /// Stops the exit timer and fails pending and future acquisitions.
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.cancel();
        self.state.semaphore.close();
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for RateGate {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RateGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGate")
            .field("limit", &self.limit)
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Independent [`RateGate`]s per key, created lazily with the same limit.
pub struct KeyedRateGate {
    limit: RateLimit,
    gates: DashMap<String, Arc<RateGate>>,
    closed: AtomicBool,
}

impl KeyedRateGate {
    /// Creates an empty keyed gate, validating `limit`.
    pub fn new(limit: RateLimit) -> Result<Self> {
        limit.validate()?;
        Ok(Self {
            limit,
            gates: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Suspends until `key`'s gate admits the caller or `cancel` fires.
    pub async fn acquire(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BlockwatchError::Closed { what: "keyed rate gate" });
        }
        // Cloned out so no map shard stays locked across the await.
        let gate = self.gate(key);
        gate.acquire(cancel).await
    }

    fn gate(&self, key: &str) -> Arc<RateGate> {
        if let Some(gate) = self.gates.get(key) {
            return gate.value().clone();
        }
        let entry = self.gates.entry(key.to_string()).or_insert_with(|| {
            debug!(key, "created rate gate");
            Arc::new(RateGate::start(self.limit))
        });
        entry.value().clone()
    }

    /// The limit applied to every key.
    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Number of keys with a gate.
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// Whether no key has a gate yet.
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Drops every gate that nobody is waiting on and whose window has fully
    /// drained. A dropped gate would be recreated with the same budget, so the
    /// limit still holds. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let full = self.limit.occurrences as usize;
        let before = self.gates.len();
        // Callers clone the gate out of the map, so a count of one means no acquire is in flight.
        self.gates.retain(|key, gate| {
            let idle = Arc::strong_count(gate) == 1 && gate.available() == full;
            if idle {
                trace!(key = %key, "evicting idle rate gate");
                gate.close();
            }
            !idle
        });
        before.saturating_sub(self.gates.len())
    }

    /// Closes every gate. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for gate in self.gates.iter() {
            gate.value().close();
        }
        self.gates.clear();
    }
}

impl Drop for KeyedRateGate {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_per_second() -> RateLimit {
        RateLimit::new(2, Duration::from_secs(1))
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(RateLimit::new(0, Duration::from_secs(1)).validate().is_err());
        assert!(RateLimit::new(1, Duration::ZERO).validate().is_err());
        assert!(two_per_second().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_acquire_waits_for_window() {
        let gate = RateGate::new(two_per_second()).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        gate.acquire(&cancel).await.unwrap();
        gate.acquire(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(gate.available(), 0);

        gate.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_never_exceeded() {
        let gate = Arc::new(RateGate::new(two_per_second()).unwrap());
        let cancel = CancellationToken::new();
        let admissions = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..7 {
            let gate = gate.clone();
            let cancel = cancel.clone();
            let admissions = admissions.clone();
            handles.push(tokio::spawn(async move {
                gate.acquire(&cancel).await.unwrap();
                admissions.lock().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut admissions = admissions.lock().clone();
        admissions.sort();
        assert_eq!(admissions.len(), 7);
        for pair in admissions.windows(3) {
            assert!(pair[2] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_does_not_leak_slot() {
        let gate = RateGate::new(RateLimit::once_per(Duration::from_secs(10))).unwrap();
        let cancel = CancellationToken::new();
        gate.acquire(&cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let trigger = waiter_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = gate.acquire(&waiter_cancel).await.unwrap_err();
        assert!(err.is_cancelled());

        // After expiry exactly one slot comes back.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let gate = RateGate::new(two_per_second()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(gate.acquire(&cancel).await.unwrap_err().is_cancelled());
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_acquire() {
        let gate = RateGate::new(two_per_second()).unwrap();
        gate.close();
        gate.close();
        assert!(gate.is_closed());
        let err = gate.acquire(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BlockwatchError::Closed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_pending_acquire() {
        let gate = Arc::new(RateGate::new(RateLimit::once_per(Duration::from_secs(60))).unwrap());
        let cancel = CancellationToken::new();
        gate.acquire(&cancel).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        gate.close();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(BlockwatchError::Closed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_gates_are_independent() {
        let keyed = KeyedRateGate::new(RateLimit::once_per(Duration::from_secs(60))).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        keyed.acquire("alice", &cancel).await.unwrap();
        keyed.acquire("bob", &cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(keyed.len(), 2);

        keyed.acquire("alice", &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_evicts_only_drained_gates() {
        let keyed = KeyedRateGate::new(RateLimit::once_per(Duration::from_secs(60))).unwrap();
        let cancel = CancellationToken::new();
        keyed.acquire("alice", &cancel).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        keyed.acquire("bob", &cancel).await.unwrap();

        // Both windows still hold an admission.
        assert_eq!(keyed.evict_idle(), 0);
        assert_eq!(keyed.len(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(keyed.evict_idle(), 1);
        assert_eq!(keyed.len(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(keyed.evict_idle(), 1);
        assert!(keyed.is_empty());

        // A recreated gate starts with a full budget.
        let start = Instant::now();
        keyed.acquire("alice", &cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_keeps_gate_with_waiter() {
        let keyed = Arc::new(KeyedRateGate::new(RateLimit::once_per(Duration::from_secs(60))).unwrap());
        let cancel = CancellationToken::new();
        keyed.acquire("alice", &cancel).await.unwrap();

        let waiter = {
            let keyed = keyed.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { keyed.acquire("alice", &cancel).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(keyed.evict_idle(), 0);
        waiter.await.unwrap().unwrap();
        assert_eq!(keyed.len(), 1);
    }

    #[tokio::test]
    async fn test_keyed_close_is_idempotent() {
        let keyed = KeyedRateGate::new(two_per_second()).unwrap();
        let cancel = CancellationToken::new();
        keyed.acquire("alice", &cancel).await.unwrap();

        keyed.close();
        keyed.close();
        assert!(keyed.acquire("alice", &cancel).await.is_err());
    }
}
