//! Hierarchical fixed-window rate limiter backed by the shared store.
//!
//! Keys are dotted `category.operation` paths resolved against the configured table
//! (exact entry, then category default, then global default). Each window is a counter keyed
//! by `floor(unix_seconds / window)` and bumped with the store's atomic `increment`.
//!
//! Rejected attempts are still charged: the counter is never decremented. Because windows
//! are calendar-aligned, a caller can burst up to twice the limit across a window seam.

// crates.io
use time::{format_description::BorrowedFormatItem, macros::format_description};
// self
use crate::{
	_prelude::*,
	config::{RateLimitConfig, RateLimitRule, RetryAfterFormat},
	obs::{self, OpKind},
	store::{SharedStore, StoreError},
};

/// `X-RateLimit-Limit` header name.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// `X-RateLimit-Remaining` header name.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// `X-RateLimit-Reset` header name.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// `Retry-After` header name.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
	"[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Quota snapshot for a key in its current window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitInfo {
	/// Attempts allowed per window.
	pub limit: u32,
	/// Attempts left in the current window.
	pub remaining: u32,
	/// Instant the current window ends.
	pub reset_at: OffsetDateTime,
}
impl RateLimitInfo {
	/// Renders the `X-RateLimit-*` headers.
	pub fn headers(&self) -> Vec<(&'static str, String)> {
		vec![
			(HEADER_LIMIT, self.limit.to_string()),
			(HEADER_REMAINING, self.remaining.to_string()),
			(HEADER_RESET, self.reset_at.unix_timestamp().to_string()),
		]
	}
}

/// `Retry-After` value in one of the two HTTP conventions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryAfter {
	/// Delay in whole seconds.
	Seconds(u64),
	/// Absolute instant.
	HttpDate(OffsetDateTime),
}
impl RetryAfter {
	fn new(format: RetryAfterFormat, now: OffsetDateTime, reset_at: OffsetDateTime) -> Self {
		match format {
			RetryAfterFormat::Seconds => {
				let delta = (reset_at - now).whole_seconds().max(0);

				Self::Seconds(u64::try_from(delta).unwrap_or_default())
			},
			RetryAfterFormat::HttpDate => Self::HttpDate(reset_at),
		}
	}

	/// Header value (`"12"` or `"Sun, 06 Nov 1994 08:49:37 GMT"`).
	pub fn header_value(&self) -> String {
		match self {
			Self::Seconds(secs) => secs.to_string(),
			Self::HttpDate(instant) => instant
				.to_offset(time::UtcOffset::UTC)
				.format(HTTP_DATE)
				.unwrap_or_else(|_| instant.unix_timestamp().to_string()),
		}
	}
}
impl Display for RetryAfter {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.header_value())
	}
}

/// Raised when an attempt pushes a window's counter past its limit.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("Rate limit exceeded for `{key}`: {limit} attempts per window; retry after {retry_after}.")]
pub struct RateLimitExceeded {
	/// Rate-limited key.
	pub key: String,
	/// Attempts allowed per window.
	pub limit: u32,
	/// Always zero.
	pub remaining: u32,
	/// Instant the current window ends.
	pub reset_at: OffsetDateTime,
	/// Retry hint in the configured header convention.
	pub retry_after: RetryAfter,
	/// Instant the rejection was observed.
	pub observed_at: OffsetDateTime,
}
impl RateLimitExceeded {
	/// Snapshot suitable for response headers.
	pub fn info(&self) -> RateLimitInfo {
		RateLimitInfo { limit: self.limit, remaining: self.remaining, reset_at: self.reset_at }
	}

	/// Time left until the window resets, measured from the rejection.
	pub fn retry_after_duration(&self) -> Duration {
		let delta = self.reset_at - self.observed_at;

		if delta.is_negative() { Duration::ZERO } else { delta }
	}

	/// Renders the `X-RateLimit-*` headers plus `Retry-After`.
	pub fn headers(&self) -> Vec<(&'static str, String)> {
		let mut headers = self.info().headers();

		headers.push((HEADER_RETRY_AFTER, self.retry_after.header_value()));

		headers
	}
}

/// Fixed-window quota tracker shared by every process using the same store.
#[derive(Clone)]
pub struct RateLimiter {
	store: Arc<dyn SharedStore>,
	config: RateLimitConfig,
	namespace: String,
}
impl RateLimiter {
	/// Creates a limiter over `store`; `namespace` prefixes every counter key.
	pub fn new(
		store: Arc<dyn SharedStore>,
		config: RateLimitConfig,
		namespace: impl Into<String>,
	) -> Self {
		Self { store, config, namespace: namespace.into() }
	}

	/// Rule that applies to `key`.
	pub fn rule(&self, key: &str) -> RateLimitRule {
		*self.config.resolve(key)
	}

	/// Charges one attempt against `key` in the current window.
	pub async fn attempt(&self, key: &str) -> Result<RateLimitInfo> {
		self.attempt_at(key, OffsetDateTime::now_utc()).await
	}

	/// Charges one attempt against `key` in the window containing `now`.
	///
	/// Returns the post-attempt snapshot, or [`Error::RateLimited`] when the attempt crossed
	/// the limit. The rejected attempt stays charged.
	pub async fn attempt_at(&self, key: &str, now: OffsetDateTime) -> Result<RateLimitInfo> {
		obs::observe(OpKind::RateLimit, "attempt", async move {
			let rule = self.rule(key);
			let window = Window::containing(now, &rule);
			let counter_key = self.counter_key(key, &window);
			let count = self.store.increment(&counter_key, Some(window.ttl(now))).await?;
			let limit = i64::from(rule.limit);

			if count > limit {
				let exceeded = RateLimitExceeded {
					key: key.to_owned(),
					limit: rule.limit,
					remaining: 0,
					reset_at: window.end,
					retry_after: RetryAfter::new(self.config.retry_after, now, window.end),
					observed_at: now,
				};

				tracing::info!(key, count, limit, reset_at = %window.end, "rate limit exceeded");

				return Err(exceeded.into());
			}

			Ok(RateLimitInfo {
				limit: rule.limit,
				remaining: u32::try_from(limit - count).unwrap_or_default(),
				reset_at: window.end,
			})
		})
		.await
	}

	/// Attempts left for `key` in the current window.
	pub async fn remaining(&self, key: &str) -> Result<u32> {
		Ok(self.info_at(key, OffsetDateTime::now_utc()).await?.remaining)
	}

	/// Quota snapshot for `key` in the current window, without charging an attempt.
	pub async fn rate_limit_info(&self, key: &str) -> Result<RateLimitInfo> {
		self.info_at(key, OffsetDateTime::now_utc()).await
	}

	/// Quota snapshot for `key` in the window containing `now`.
	pub async fn info_at(&self, key: &str, now: OffsetDateTime) -> Result<RateLimitInfo> {
		let rule = self.rule(key);
		let window = Window::containing(now, &rule);
		let counter_key = self.counter_key(key, &window);
		let count = match self.store.get(&counter_key).await? {
			Some(raw) => raw.parse::<i64>().map_err(|e| StoreError::Serialization {
				message: format!("Counter `{counter_key}` is not an integer: {e}"),
			})?,
			None => 0,
		};
		let remaining = (i64::from(rule.limit) - count).max(0);

		Ok(RateLimitInfo {
			limit: rule.limit,
			remaining: u32::try_from(remaining).unwrap_or_default(),
			reset_at: window.end,
		})
	}

	/// Clears the current window's counter for `key`.
	pub async fn reset(&self, key: &str) -> Result<()> {
		self.reset_at(key, OffsetDateTime::now_utc()).await
	}

	/// Clears the counter of the window containing `now` for `key`.
	pub async fn reset_at(&self, key: &str, now: OffsetDateTime) -> Result<()> {
		let window = Window::containing(now, &self.rule(key));

		self.store.delete(&self.counter_key(key, &window)).await?;

		Ok(())
	}

	fn counter_key(&self, key: &str, window: &Window) -> String {
		format!("{}:rate:{key}:{}", self.namespace, window.index)
	}
}
impl Debug for RateLimiter {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RateLimiter")
			.field("namespace", &self.namespace)
			.field("config", &self.config)
			.finish()
	}
}

#[derive(Clone, Copy, Debug)]
struct Window {
	index: i64,
	end: OffsetDateTime,
}
impl Window {
	fn containing(now: OffsetDateTime, rule: &RateLimitRule) -> Self {
		let length = i64::try_from(rule.window_seconds).unwrap_or(i64::MAX).max(1);
		let index = now.unix_timestamp().div_euclid(length);
		let end = OffsetDateTime::from_unix_timestamp(index.saturating_add(1).saturating_mul(length))
			.unwrap_or(now);

		Self { index, end }
	}

	fn ttl(&self, now: OffsetDateTime) -> Duration {
		// Keep the counter a little past the seam so late readers still see it.
		(self.end - now).max(Duration::ZERO) + Duration::seconds(1)
	}
}
