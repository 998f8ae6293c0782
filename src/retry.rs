//! Classified retry-with-backoff executor.
//!
//! [`RetryOrchestrator::execute`] invokes an operation until it succeeds, the classifier
//! declares the failure fatal, or the attempt budget runs out. Delays grow as
//! `min(initial * multiplier^(attempt - 1), max)` and, when jitter is enabled, gain a uniform
//! `[0%, 30%]` surcharge so processes that failed together do not retry together.

// crates.io
use rand::Rng;
// self
use crate::{_prelude::*, config::RetryConfig, error::TransportError};

/// Fraction of the computed delay used as the upper jitter bound.
pub const MAX_JITTER_RATIO: f64 = 0.3;

/// HTTP statuses treated as retryable transport failures.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Decides whether a failed attempt should be retried.
pub trait RetryClassifier
where
	Self: Send + Sync,
{
	/// Returns `true` when `error` (raised by attempt number `attempt`, starting at 1) is
	/// worth another attempt.
	fn should_retry(&self, error: &Error, attempt: u32) -> bool;
}
impl<F> RetryClassifier for F
where
	F: Fn(&Error, u32) -> bool + Send + Sync,
{
	fn should_retry(&self, error: &Error, attempt: u32) -> bool {
		self(error, attempt)
	}
}

/// Default classifier: upstream throttling, authentication expiry, transient issuer
/// responses, and network failures are retryable; everything else is fatal immediately.
///
/// The local [`Error::RateLimited`] and [`Error::PoolExhausted`] signals are never retried.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultClassifier;
impl RetryClassifier for DefaultClassifier {
	fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
		match error {
			Error::Authentication { .. } | Error::Transient(_) => true,
			Error::Transport(TransportError::Status { status, .. }) =>
				RETRYABLE_STATUSES.contains(status),
			Error::Transport(TransportError::Network { .. } | TransportError::Io(_)) => true,
			_ => false,
		}
	}
}

/// Retry executor configured once from [`RetryConfig`].
#[derive(Clone, Debug)]
pub struct RetryOrchestrator {
	config: RetryConfig,
}
impl RetryOrchestrator {
	/// Creates an orchestrator for the provided policy.
	pub fn new(config: RetryConfig) -> Self {
		Self { config }
	}

	/// Policy backing this orchestrator.
	pub fn config(&self) -> &RetryConfig {
		&self.config
	}

	/// Runs `operation` until it succeeds or the failure is final.
	///
	/// `operation` receives the 1-based attempt number. Non-retryable failures are returned
	/// as-is so callers can branch on their type; retryable failures that outlast the budget
	/// are wrapped in [`Error::RetriesExhausted`] carrying the last cause.
	pub async fn execute<T, F, Fut>(
		&self,
		mut operation: F,
		classifier: &dyn RetryClassifier,
		context: &str,
	) -> Result<T>
	where
		F: FnMut(u32) -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let max_attempts = self.config.max_attempts.max(1);
		let mut attempt = 1;

		loop {
			let err = match operation(attempt).await {
				Ok(value) => return Ok(value),
				Err(err) => err,
			};

			if !classifier.should_retry(&err, attempt) {
				tracing::debug!(context, attempt, error = %err, "failure is not retryable");

				return Err(err);
			}
			if attempt >= max_attempts {
				tracing::warn!(context, attempts = attempt, error = %err, "retries exhausted");

				return Err(Error::RetriesExhausted {
					context: context.to_owned(),
					attempts: attempt,
					source: Box::new(err),
				});
			}

			let delay = self.delay_with_hint(attempt, err.retry_after());

			tracing::info!(
				context,
				attempt,
				delay_ms = delay.as_millis() as u64,
				error = %err,
				"retrying after failure"
			);
			tokio::time::sleep(delay).await;

			attempt += 1;
		}
	}

	/// Backoff delay after the given failed attempt, without jitter.
	pub fn base_delay(&self, attempt: u32) -> StdDuration {
		let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
		let raw = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
		let capped = raw.min(self.config.max_delay_ms as f64).max(0.);

		StdDuration::from_millis(capped as u64)
	}

	/// Backoff delay after the given failed attempt, including jitter when enabled.
	pub fn delay(&self, attempt: u32) -> StdDuration {
		let base = self.base_delay(attempt);

		if !self.config.jitter || base.is_zero() {
			return base;
		}

		let ratio = rand::rng().random_range(0.0..=MAX_JITTER_RATIO);

		base + base.mul_f64(ratio)
	}

	/// Longest total backoff a single [`execute`](Self::execute) call can sleep, jitter
	/// included. Retry-After hints stay within `max_delay_ms` per attempt and are not counted.
	pub fn backoff_budget(&self) -> StdDuration {
		let jitter = if self.config.jitter { 1. + MAX_JITTER_RATIO } else { 1. };

		(1..self.config.max_attempts.max(1))
			.map(|attempt| self.base_delay(attempt).mul_f64(jitter))
			.sum()
	}

	fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> StdDuration {
		let delay = self.delay(attempt);
		let Some(hint) = hint.and_then(|hint| StdDuration::try_from(hint).ok()) else {
			return delay;
		};
		let ceiling = StdDuration::from_millis(self.config.max_delay_ms);

		delay.max(hint.min(ceiling))
	}
}
