//! Concurrency control for provider calls.
//!
//! - **ConcurrencyController**: per-run ceiling on in-flight executions,
//!   launch pacing, pause gate and cancellation
//! - **RateLimiter**: process-wide token bucket per provider, shared by every
//!   run through an `Arc`
//! - **RetryPolicy**: which failures are retried and how long to wait
//!
//! ```text
//!   stage unit ──► pause gate ──► semaphore ──► launch delay
//!                                                   │
//!                        ┌──────────────────────────┘
//!                        ▼
//!                  rate limiter ──► adapter.invoke ──► retry?
//!                        ▲                               │
//!                        └───────────── yes ─────────────┘
//! ```

pub mod controller;
pub mod rate_limiter;
pub mod retry;

pub use controller::{AttemptObserver, ConcurrencyController, DispatchPermit, NoopObserver};
pub use rate_limiter::RateLimiter;
pub use retry::{sleep_or_cancel, RetryPolicy};
