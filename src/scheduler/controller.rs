//! Per-run concurrency controller.
//!
//! Every provider call of a run goes through [`ConcurrencyController::call`],
//! which applies, in order: the pause gate, the `max_concurrent` ceiling,
//! launch pacing, the shared rate limiter and the retry policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ConcurrencyPolicy;
use crate::error::{FailureKind, StageError};
use crate::llm::{InvokeOutput, InvokeRequest, ProviderAdapter};
use crate::metrics::MetricsCollector;

use super::rate_limiter::RateLimiter;
use super::retry::{sleep_or_cancel, RetryPolicy};

/// Notified before every provider attempt.
#[async_trait]
pub trait AttemptObserver: Send + Sync {
    async fn on_attempt(&self, attempt: u32);
}

/// Observer that ignores attempts.
pub struct NoopObserver;

#[async_trait]
impl AttemptObserver for NoopObserver {
    async fn on_attempt(&self, _attempt: u32) {}
}

pub struct ConcurrencyController {
    semaphore: Semaphore,
    max_concurrent: usize,
    launch_delay: Duration,
    last_launch: Mutex<Option<Instant>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    metrics: MetricsCollector,
}

/// Slot held by one in-flight execution.
pub struct DispatchPermit<'a> {
    _permit: SemaphorePermit<'a>,
    running: &'a AtomicUsize,
}

impl Drop for DispatchPermit<'_> {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyController {
    /// Creates a controller for one run. `rate_limiter` is only consulted when
    /// the policy enables rate limiting.
    pub fn new(
        policy: &ConcurrencyPolicy,
        rate_limiter: Option<Arc<RateLimiter>>,
        cancel: CancellationToken,
    ) -> Self {
        let max_concurrent = policy.max_concurrent.max(1);
        let (paused, _) = watch::channel(false);
        Self {
            semaphore: Semaphore::new(max_concurrent),
            max_concurrent,
            launch_delay: policy.launch_delay,
            last_launch: Mutex::new(None),
            rate_limiter: if policy.rate_limiting { rate_limiter } else { None },
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            paused,
            cancel,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Executions currently holding a slot.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous executions seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Waits until the run is not paused.
    ///
    /// # Errors
    ///
    /// `StageError::Cancelled` if the run is cancelled while waiting.
    pub async fn wait_unpaused(&self) -> Result<(), StageError> {
        let mut rx = self.paused.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StageError::Cancelled),
            result = rx.wait_for(|paused| !*paused) => {
                result.map(|_| ()).map_err(|_| StageError::Cancelled)
            }
        }
    }

    /// Takes an execution slot once the run is unpaused, a slot is free and
    /// the launch delay since the previous dispatch has passed.
    ///
    /// # Errors
    ///
    /// `StageError::Cancelled` once the run's token fires.
    pub async fn dispatch(&self) -> Result<DispatchPermit<'_>, StageError> {
        let permit = loop {
            self.wait_unpaused().await?;
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => return Err(StageError::Cancelled),
                permit = self.semaphore.acquire() => permit.map_err(|_| StageError::Cancelled)?,
            };
            // A pause that landed while we queued for a slot still applies.
            if self.is_paused() {
                drop(permit);
                continue;
            }
            break permit;
        };

        if !self.launch_delay.is_zero() {
            let mut last = self.last_launch.lock().await;
            if let Some(previous) = *last {
                let next = previous + self.launch_delay;
                let now = Instant::now();
                if next > now && !sleep_or_cancel(next - now, &self.cancel).await {
                    return Err(StageError::Cancelled);
                }
            }
            *last = Some(Instant::now());
        }

        if self.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        Ok(DispatchPermit {
            _permit: permit,
            running: &self.running,
        })
    }

    /// Dispatches one call and retries it according to `policy`.
    ///
    /// The slot is held across retries. Each attempt waits for the rate
    /// limiter (when enabled) and notifies `observer` first. A result that
    /// arrives after cancellation is discarded.
    ///
    /// # Errors
    ///
    /// The last provider error once retries are exhausted or the error is
    /// not retryable, or `StageError::Cancelled`.
    pub async fn call(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &InvokeRequest,
        policy: &RetryPolicy,
        observer: &dyn AttemptObserver,
    ) -> Result<InvokeOutput, StageError> {
        let slot = self.dispatch().await?;
        self.call_with_permit(&slot, adapter, request, policy, observer)
            .await
    }

    /// Like [`call`](Self::call), but runs inside a slot the caller already
    /// holds from [`dispatch`](Self::dispatch). Used when one execution spans
    /// several calls and must not give up its slot between them.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn call_with_permit(
        &self,
        _slot: &DispatchPermit<'_>,
        adapter: &dyn ProviderAdapter,
        request: &InvokeRequest,
        policy: &RetryPolicy,
        observer: &dyn AttemptObserver,
    ) -> Result<InvokeOutput, StageError> {
        let provider = request.provider().to_string();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if let Some(limiter) = &self.rate_limiter {
                let waited = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(StageError::Cancelled),
                    waited = limiter.acquire(&provider) => waited,
                };
                if !waited.is_zero() {
                    self.metrics.record_rate_limit_wait(&provider, waited);
                }
            }

            observer.on_attempt(attempt).await;

            self.metrics.call_started();
            let started = Instant::now();
            let result = adapter.invoke(request, &self.cancel).await;
            let latency = started.elapsed();
            self.metrics.call_finished();

            if self.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }

            match result {
                Ok(output) => {
                    self.metrics
                        .record_provider_call(&provider, "success", latency, output.usage);
                    return Ok(output);
                }
                Err(err) => {
                    let kind = FailureKind::from(err.kind).to_string();
                    self.metrics
                        .record_provider_call(&provider, &kind, latency, None);

                    if !policy.should_retry(&err, attempt) {
                        tracing::debug!(
                            model = %request.model,
                            attempt = attempt,
                            error = %err,
                            "Provider call failed, not retrying"
                        );
                        return Err(err.into());
                    }

                    let delay = policy.delay_for(attempt);
                    self.metrics.record_retry(&kind);
                    tracing::warn!(
                        model = %request.model,
                        attempt = attempt,
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable provider error, will retry"
                    );
                    if !sleep_or_cancel(delay, &self.cancel).await {
                        return Err(StageError::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ProviderError};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    struct Scripted {
        results: StdMutex<Vec<Result<String, ProviderError>>>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Scripted {
        fn new(mut results: Vec<Result<String, ProviderError>>, delay: Duration) -> Self {
            results.reverse();
            Self {
                results: StdMutex::new(results),
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for Scripted {
        async fn invoke(
            &self,
            _request: &InvokeRequest,
            _cancel: &CancellationToken,
        ) -> Result<InvokeOutput, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let next = self.results.lock().unwrap().pop();
            next.unwrap_or_else(|| Ok("default".to_string()))
                .map(InvokeOutput::text)
        }
    }

    struct Counter(AtomicU32);

    #[async_trait]
    impl AttemptObserver for Counter {
        async fn on_attempt(&self, _attempt: u32) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn policy(max_concurrent: usize) -> ConcurrencyPolicy {
        ConcurrencyPolicy {
            max_concurrent,
            rate_limiting: false,
            retry_delay: Duration::from_millis(50),
            ..ConcurrencyPolicy::default()
        }
    }

    fn request() -> InvokeRequest {
        InvokeRequest::new("mock:m", "hi", Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let controller = ConcurrencyController::new(&policy(2), None, CancellationToken::new());
        let adapter = Scripted::new(
            vec![
                Err(ProviderError::transient("503")),
                Err(ProviderError::timeout("slow")),
                Ok("done".to_string()),
            ],
            Duration::ZERO,
        );
        let attempts = Counter(AtomicU32::new(0));
        let retry = RetryPolicy::from_concurrency(&policy(2));

        let out = controller
            .call(&adapter, &request(), &retry, &attempts)
            .await
            .unwrap();
        assert_eq!(out.output, "done");
        assert_eq!(attempts.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_fails_immediately() {
        let controller = ConcurrencyController::new(&policy(2), None, CancellationToken::new());
        let adapter = Scripted::new(vec![Err(ProviderError::permanent("401"))], Duration::ZERO);
        let attempts = Counter(AtomicU32::new(0));
        let retry = RetryPolicy::from_concurrency(&policy(2));

        let err = controller
            .call(&adapter, &request(), &retry, &attempts)
            .await
            .unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Permanent);
        assert_eq!(attempts.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_bounded_by_max_retries() {
        let controller = ConcurrencyController::new(&policy(1), None, CancellationToken::new());
        let adapter = Scripted::new(
            (0..10).map(|_| Err(ProviderError::transient("429"))).collect(),
            Duration::ZERO,
        );
        let attempts = Counter(AtomicU32::new(0));
        let retry = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::from_concurrency(&policy(1))
        };

        let err = controller
            .call(&adapter, &request(), &retry, &attempts)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Provider(ref e) if e.kind == ErrorKind::Transient));
        assert_eq!(attempts.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling() {
        let controller = Arc::new(ConcurrencyController::new(
            &policy(3),
            None,
            CancellationToken::new(),
        ));
        let adapter = Arc::new(Scripted::new(vec![], Duration::from_millis(100)));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let controller = controller.clone();
                let adapter = adapter.clone();
                tokio::spawn(async move {
                    controller
                        .call(adapter.as_ref(), &request(), &RetryPolicy::none(), &NoopObserver)
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(controller.peak(), 3);
        assert_eq!(adapter.max_in_flight.load(Ordering::SeqCst), 3);
        assert_eq!(controller.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_permit_spans_several_calls() {
        let controller = Arc::new(ConcurrencyController::new(
            &policy(1),
            None,
            CancellationToken::new(),
        ));
        let adapter = Arc::new(Scripted::new(vec![], Duration::from_millis(100)));

        let slot = controller.dispatch().await.unwrap();
        let waiter = {
            let controller = controller.clone();
            let adapter = adapter.clone();
            tokio::spawn(async move {
                controller
                    .call(adapter.as_ref(), &request(), &RetryPolicy::none(), &NoopObserver)
                    .await
            })
        };
        for _ in 0..3 {
            controller
                .call_with_permit(
                    &slot,
                    adapter.as_ref(),
                    &request(),
                    &RetryPolicy::none(),
                    &NoopObserver,
                )
                .await
                .unwrap();
            assert_eq!(controller.running(), 1);
        }
        assert!(!waiter.is_finished());
        drop(slot);

        waiter.await.unwrap().unwrap();
        assert_eq!(controller.peak(), 1);
        assert_eq!(adapter.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_delay_spaces_dispatches() {
        let mut p = policy(4);
        p.launch_delay = Duration::from_millis(200);
        let controller = ConcurrencyController::new(&p, None, CancellationToken::new());
        let start = Instant::now();

        for _ in 0..3 {
            let _slot = controller.dispatch().await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_blocks_dispatch_until_resume() {
        let controller = Arc::new(ConcurrencyController::new(
            &policy(2),
            None,
            CancellationToken::new(),
        ));
        controller.pause();

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move {
                let _slot = controller.dispatch().await.unwrap();
                Instant::now()
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());
        let resumed_at = Instant::now();
        controller.resume();
        let dispatched_at = waiter.await.unwrap();
        assert!(dispatched_at >= resumed_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_in_flight_result() {
        let cancel = CancellationToken::new();
        let controller = Arc::new(ConcurrencyController::new(&policy(1), None, cancel.clone()));
        let adapter = Arc::new(Scripted::new(vec![], Duration::from_secs(10)));

        let call = {
            let controller = controller.clone();
            let adapter = adapter.clone();
            tokio::spawn(async move {
                controller
                    .call(adapter.as_ref(), &request(), &RetryPolicy::none(), &NoopObserver)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, StageError::Cancelled));
        assert!(matches!(controller.dispatch().await, Err(StageError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_is_consulted_per_attempt() {
        let mut p = policy(4);
        p.rate_limiting = true;
        let limiter = Arc::new(RateLimiter::new(1, 1.0));
        let controller = ConcurrencyController::new(&p, Some(limiter), CancellationToken::new());
        let adapter = Scripted::new(vec![], Duration::ZERO);
        let start = Instant::now();

        for _ in 0..3 {
            controller
                .call(&adapter, &request(), &RetryPolicy::none(), &NoopObserver)
                .await
                .unwrap();
        }
        // One token up front, then one per second.
        assert!(start.elapsed() >= Duration::from_millis(1999));
    }
}
