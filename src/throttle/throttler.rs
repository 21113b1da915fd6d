//! Cooperative throttler: call spacing plus a FIFO concurrency gate.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::rules::ThrottleConfig;
use crate::error::{Result, ThrottleError};

/// Introspection view of one throttle key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleStatus {
    /// When the most recent call finished
    pub last_call_at: Option<Instant>,
    /// Calls currently running
    pub concurrent: usize,
    /// Callers waiting for a concurrency slot or for the spacing interval
    pub queued: usize,
}

#[derive(Debug, Default)]
struct Timing {
    last_call_at: Option<Instant>,
    last_start: Option<Instant>,
}

/// Runtime state for one throttle key.
#[derive(Debug)]
struct ThrottleSlot {
    key: String,
    config: ThrottleConfig,
    /// Fair semaphore: waiters are woken in arrival order
    gate: Option<Arc<Semaphore>>,
    timing: Mutex<Timing>,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
}

impl ThrottleSlot {
    fn new(key: &str, config: ThrottleConfig) -> Self {
        let gate = config.max_concurrent.map(|max| Arc::new(Semaphore::new(max)));
        Self {
            key: key.to_string(),
            config,
            gate,
            timing: Mutex::new(Timing::default()),
            in_flight: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    fn status(&self) -> ThrottleStatus {
        ThrottleStatus {
            last_call_at: self.timing.lock().last_call_at,
            concurrent: self.in_flight.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }

    /// Take a concurrency slot, queueing behind earlier waiters if needed.
    async fn acquire<E>(&self) -> std::result::Result<Option<OwnedSemaphorePermit>, ThrottleError<E>> {
        let Some(gate) = &self.gate else {
            return Ok(None);
        };

        if let Ok(permit) = Arc::clone(gate).try_acquire_owned() {
            return Ok(Some(permit));
        }

        let _queued = Queued::enter(self);
        Arc::clone(gate)
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|_| ThrottleError::Closed {
                key: self.key.clone(),
            })
    }

    /// Sleep until `min_interval` has passed since both the last completed
    /// call and the last admitted start.
    ///
    /// A start is only recorded once the caller is admitted, so a caller
    /// dropped mid-wait leaves the schedule untouched.
    async fn wait_for_spacing(&self) {
        let interval = self.config.min_interval();
        if interval.is_zero() {
            return;
        }

        let mut queued = None;
        loop {
            let start_at = {
                let mut timing = self.timing.lock();
                let now = Instant::now();
                let anchor = match (timing.last_call_at, timing.last_start) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
                match anchor.map(|anchor| anchor + interval) {
                    Some(start_at) if start_at > now => start_at,
                    _ => {
                        timing.last_start = Some(now);
                        return;
                    }
                }
            };

            debug!(
                key = %self.key,
                wait_ms = (start_at - Instant::now()).as_millis() as u64,
                "Waiting out minimum call interval"
            );
            queued.get_or_insert_with(|| Queued::enter(self));
            tokio::time::sleep_until(start_at).await;
        }
    }
}

/// Counts a caller as queued for as long as it lives.
struct Queued<'a> {
    slot: &'a ThrottleSlot,
}

impl<'a> Queued<'a> {
    fn enter(slot: &'a ThrottleSlot) -> Self {
        let depth = slot.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(cap) = slot.config.queue_size {
            if depth > cap {
                warn!(key = %slot.key, depth = depth, queue_size = cap, "Throttle queue over capacity");
            }
        }
        Self { slot }
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.slot.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An admitted call. Dropping it, on any exit path, releases the slot.
struct InFlight {
    slot: Arc<ThrottleSlot>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl InFlight {
    fn enter(slot: Arc<ThrottleSlot>, permit: Option<OwnedSemaphorePermit>) -> Self {
        slot.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            slot,
            _permit: permit,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.slot.timing.lock().last_call_at = Some(Instant::now());
        self.slot.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Paces and concurrency-limits asynchronous operations per key.
///
/// Keys with no registered config run their operations immediately.
#[derive(Default)]
pub struct Throttler {
    slots: DashMap<String, Arc<ThrottleSlot>>,
}

impl Throttler {
    /// Create a throttler with no keys configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the pacing rules for `key`.
    ///
    /// Calls already admitted or queued under the previous rules finish under
    /// them; new calls use the new rules.
    pub fn set_config(&self, key: &str, config: ThrottleConfig) -> Result<()> {
        config.validate()?;

        info!(
            key = %key,
            min_interval_ms = config.min_interval_ms,
            max_concurrent = ?config.max_concurrent,
            "Registering throttle"
        );

        self.slots
            .insert(key.to_string(), Arc::new(ThrottleSlot::new(key, config)));
        Ok(())
    }

    /// Get the rules registered for `key`.
    pub fn get_config(&self, key: &str) -> Option<ThrottleConfig> {
        self.slots.get(key).map(|slot| slot.config.clone())
    }

    /// Deregister `key`. Callers still queued for a slot fail with
    /// [`ThrottleError::Closed`]; running calls are unaffected.
    pub fn remove_config(&self, key: &str) -> Option<ThrottleConfig> {
        let (_, slot) = self.slots.remove(key)?;
        if let Some(gate) = &slot.gate {
            gate.close();
        }
        info!(key = %key, "Removed throttle");
        Some(slot.config.clone())
    }

    /// Current state of `key`, or `None` if it is not configured.
    pub fn get_status(&self, key: &str) -> Option<ThrottleStatus> {
        self.slots.get(key).map(|slot| slot.status())
    }

    /// Run `operation` once `key`'s spacing and concurrency rules allow it.
    ///
    /// Uses the key's configured `timeout_ms` as the admission deadline, if
    /// any. The operation's own error is returned as [`ThrottleError::Inner`].
    pub async fn throttle<T, E, Fut, Op>(
        &self,
        key: &str,
        operation: Op,
    ) -> std::result::Result<T, ThrottleError<E>>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        match self.slot(key) {
            Some(slot) => {
                let deadline = slot.config.timeout();
                Self::run(slot, deadline, operation).await
            }
            None => operation().await.map_err(ThrottleError::Inner),
        }
    }

    /// Like [`throttle`](Self::throttle) with an explicit admission deadline.
    pub async fn throttle_with_timeout<T, E, Fut, Op>(
        &self,
        key: &str,
        timeout: Duration,
        operation: Op,
    ) -> std::result::Result<T, ThrottleError<E>>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        match self.slot(key) {
            Some(slot) => Self::run(slot, Some(timeout), operation).await,
            None => operation().await.map_err(ThrottleError::Inner),
        }
    }

    fn slot(&self, key: &str) -> Option<Arc<ThrottleSlot>> {
        self.slots.get(key).map(|slot| Arc::clone(slot.value()))
    }

    async fn run<T, E, Fut, Op>(
        slot: Arc<ThrottleSlot>,
        deadline: Option<Duration>,
        operation: Op,
    ) -> std::result::Result<T, ThrottleError<E>>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let started = Instant::now();
        let admission = async {
            let permit = slot.acquire::<E>().await?;
            slot.wait_for_spacing().await;
            Ok::<_, ThrottleError<E>>(permit)
        };

        let permit = match deadline {
            Some(limit) => match tokio::time::timeout(limit, admission).await {
                Ok(admitted) => admitted?,
                Err(_) => {
                    debug!(key = %slot.key, timeout_ms = limit.as_millis() as u64, "Throttle wait timed out");
                    return Err(ThrottleError::Timeout {
                        key: slot.key.clone(),
                        waited: started.elapsed(),
                    });
                }
            },
            None => admission.await?,
        };

        let _in_flight = InFlight::enter(Arc::clone(&slot), permit);
        operation().await.map_err(ThrottleError::Inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    fn throttler_with(key: &str, config: ThrottleConfig) -> Arc<Throttler> {
        let throttler = Arc::new(Throttler::new());
        throttler.set_config(key, config).unwrap();
        throttler
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_between_consecutive_calls() {
        let throttler = throttler_with("api", ThrottleConfig::new(Duration::from_millis(200)));
        let origin = Instant::now();

        let first = throttler
            .throttle("api", || async { Ok::<_, Infallible>(Instant::now()) })
            .await
            .unwrap();
        let second = throttler
            .throttle("api", || async { Ok::<_, Infallible>(Instant::now()) })
            .await
            .unwrap();

        assert_eq!(first, origin);
        assert!(second - first >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_after_interval_elapsed() {
        let throttler = throttler_with("api", ThrottleConfig::new(Duration::from_millis(100)));

        throttler
            .throttle("api", || async { Ok::<_, Infallible>(()) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let before = Instant::now();
        let started = throttler
            .throttle("api", || async { Ok::<_, Infallible>(Instant::now()) })
            .await
            .unwrap();
        assert_eq!(started, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_applies_to_concurrent_callers() {
        let throttler = throttler_with("api", ThrottleConfig::new(Duration::from_millis(200)));

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let throttler = Arc::clone(&throttler);
                tokio::spawn(async move {
                    throttler
                        .throttle("api", || async { Ok::<_, Infallible>(Instant::now()) })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut starts = Vec::new();
        for call in calls {
            starts.push(call.await.unwrap());
        }
        starts.sort();
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_under_load() {
        let throttler = throttler_with(
            "upstream",
            ThrottleConfig::default().with_max_concurrent(2),
        );
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let throttler = Arc::clone(&throttler);
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    throttler
                        .throttle("upstream", || async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, Infallible>(i)
                        })
                        .await
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        assert!(results.iter().all(|r| matches!(r, Ok(Ok(_)))));
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        let status = throttler.get_status("upstream").unwrap();
        assert_eq!(status.concurrent, 0);
        assert_eq!(status.queued, 0);
        assert!(status.last_call_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_admitted_in_fifo_order() {
        let throttler = throttler_with("fifo", ThrottleConfig::default().with_max_concurrent(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let throttler = Arc::clone(&throttler);
            tokio::spawn(async move {
                throttler
                    .throttle("fifo", || async move {
                        let _ = release_rx.await;
                        Ok::<_, Infallible>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let mut waiters = Vec::new();
        for i in 0..3 {
            let throttler = Arc::clone(&throttler);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                throttler
                    .throttle("fifo", || async move {
                        order.lock().push(i);
                        Ok::<_, Infallible>(())
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }

        let status = throttler.get_status("fifo").unwrap();
        assert_eq!(status.concurrent, 1);
        assert_eq!(status.queued, 3);

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let throttler = throttler_with(
            "slow",
            ThrottleConfig::default()
                .with_max_concurrent(1)
                .with_timeout(Duration::from_millis(100)),
        );

        let holder = {
            let throttler = Arc::clone(&throttler);
            tokio::spawn(async move {
                throttler
                    .throttle("slow", || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok::<_, Infallible>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let result = throttler
            .throttle("slow", || async { Ok::<_, Infallible>(()) })
            .await;
        match result {
            Err(ThrottleError::Timeout { key, waited }) => {
                assert_eq!(key, "slow");
                assert!(waited >= Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(throttler.get_status("slow").unwrap().queued, 0);

        holder.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_timeout_covers_spacing_wait() {
        let throttler = throttler_with("paced", ThrottleConfig::new(Duration::from_secs(5)));
        throttler
            .throttle("paced", || async { Ok::<_, Infallible>(()) })
            .await
            .unwrap();

        let result = throttler
            .throttle_with_timeout("paced", Duration::from_millis(50), || async {
                Ok::<_, Infallible>(())
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_waiters_do_not_push_back_schedule() {
        let throttler = throttler_with("paced", ThrottleConfig::new(Duration::from_secs(1)));
        let origin = Instant::now();
        throttler
            .throttle("paced", || async { Ok::<_, Infallible>(()) })
            .await
            .unwrap();

        for _ in 0..3 {
            let result = throttler
                .throttle_with_timeout("paced", Duration::from_millis(10), || async {
                    Ok::<_, Infallible>(())
                })
                .await;
            assert!(result.unwrap_err().is_timeout());
        }

        let started = throttler
            .throttle("paced", || async { Ok::<_, Infallible>(Instant::now()) })
            .await
            .unwrap();
        assert!(started - origin >= Duration::from_secs(1));
        assert!(started - origin < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_wait_counts_as_queued() {
        let throttler = throttler_with("paced", ThrottleConfig::new(Duration::from_millis(500)));
        throttler
            .throttle("paced", || async { Ok::<_, Infallible>(()) })
            .await
            .unwrap();

        let waiter = {
            let throttler = Arc::clone(&throttler);
            tokio::spawn(async move {
                throttler
                    .throttle("paced", || async { Ok::<_, Infallible>(()) })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let status = throttler.get_status("paced").unwrap();
        assert_eq!(status.queued, 1);
        assert_eq!(status.concurrent, 0);

        waiter.await.unwrap().unwrap();
        assert_eq!(throttler.get_status("paced").unwrap().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_error_propagates_and_releases_slot() {
        let throttler = throttler_with("flaky", ThrottleConfig::default().with_max_concurrent(1));

        let result = throttler
            .throttle("flaky", || async { Err::<(), _>("boom".to_string()) })
            .await;
        assert_eq!(result.unwrap_err().into_inner(), Some("boom".to_string()));
        assert_eq!(throttler.get_status("flaky").unwrap().concurrent, 0);

        let value = throttler
            .throttle("flaky", || async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_operation_releases_slot() {
        let throttler = throttler_with("panicky", ThrottleConfig::default().with_max_concurrent(1));

        let task = {
            let throttler = Arc::clone(&throttler);
            tokio::spawn(async move {
                throttler
                    .throttle("panicky", || async {
                        if true {
                            panic!("operation panicked");
                        }
                        Ok::<_, Infallible>(())
                    })
                    .await
            })
        };
        assert!(task.await.is_err());

        let status = throttler.get_status("panicky").unwrap();
        assert_eq!(status.concurrent, 0);
        throttler
            .throttle("panicky", || async { Ok::<_, Infallible>(()) })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_config_fails_queued_waiters() {
        let throttler = throttler_with("gone", ThrottleConfig::default().with_max_concurrent(1));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let throttler = Arc::clone(&throttler);
            tokio::spawn(async move {
                throttler
                    .throttle("gone", || async move {
                        let _ = release_rx.await;
                        Ok::<_, Infallible>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let waiter = {
            let throttler = Arc::clone(&throttler);
            tokio::spawn(async move {
                throttler
                    .throttle("gone", || async { Ok::<_, Infallible>(()) })
                    .await
            })
        };
        tokio::task::yield_now().await;

        assert!(throttler.remove_config("gone").is_some());
        assert!(matches!(
            waiter.await.unwrap(),
            Err(ThrottleError::Closed { .. })
        ));

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert!(throttler.get_status("gone").is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_key_passes_through() {
        let throttler = Throttler::new();
        let value = throttler
            .throttle("unknown", || async { Ok::<_, Infallible>("ran") })
            .await
            .unwrap();
        assert_eq!(value, "ran");
        assert!(throttler.get_status("unknown").is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let throttler = Throttler::new();
        let result = throttler.set_config("bad", ThrottleConfig::default().with_max_concurrent(0));
        assert!(result.is_err());
        assert!(throttler.get_config("bad").is_none());
    }
}
