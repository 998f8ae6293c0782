//! Explicit broker configuration, constructed once and passed into each component.
//!
//! All sections implement [`Default`] and deserialize with per-field defaults, so a JSON
//! document only needs to spell out what it overrides. [`BrokerConfig::from_json_str`]
//! reports the JSON path of any offending field and validates the result.

// self
use crate::{_prelude::*, auth::AuthMode, error::ConfigError, retry::RetryOrchestrator};

/// Top-level configuration shared by every broker component.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
	/// Per-mode token lifetimes and refresh thresholds.
	pub modes: ModeTable,
	/// Session pool sizing and lifetimes.
	pub session_pool: SessionPoolConfig,
	/// Retry/backoff policy for remote issuance.
	pub retry: RetryConfig,
	/// Distributed lock policy for token refreshes.
	pub lock: LockConfig,
	/// Hierarchical rate-limit table.
	pub rate_limits: RateLimitConfig,
}
impl BrokerConfig {
	/// Parses a JSON document and validates it.
	pub fn from_json_str(raw: &str) -> Result<Self> {
		let de = &mut serde_json::Deserializer::from_str(raw);
		let config: Self =
			serde_path_to_error::deserialize(de).map_err(|source| ConfigError::Parse { source })?;

		config.validate()?;

		Ok(config)
	}

	/// Checks cross-field invariants.
	pub fn validate(&self) -> Result<(), ConfigError> {
		for mode in AuthMode::ALL {
			let mode_config = self.modes.get(mode);

			if mode_config.token_lifetime_seconds == 0 {
				return Err(ConfigError::NonPositiveLifetime { mode });
			}
			if mode_config.refresh_threshold_seconds >= mode_config.token_lifetime_seconds {
				return Err(ConfigError::RefreshThresholdTooLarge { mode });
			}
		}

		self.session_pool.validate()?;
		self.retry.validate()?;
		self.lock.validate()?;

		let backoff = RetryOrchestrator::new(self.retry.clone()).backoff_budget();

		if StdDuration::from_secs(self.lock.timeout_seconds) < backoff {
			return Err(ConfigError::InvalidLockPolicy {
				reason: "timeout is shorter than the retry backoff budget",
			});
		}

		self.rate_limits.validate()
	}
}

/// Lifetime settings for each authentication mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeTable {
	/// Stateless REST bearer tokens.
	pub rest: ModeConfig,
	/// Stateless SOAP binary security tokens.
	pub soap_stateless: ModeConfig,
	/// Stateful SOAP sessions.
	pub soap_session: ModeConfig,
}
impl ModeTable {
	/// Returns the settings for `mode`.
	pub fn get(&self, mode: AuthMode) -> &ModeConfig {
		match mode {
			AuthMode::Rest => &self.rest,
			AuthMode::SoapStateless => &self.soap_stateless,
			AuthMode::SoapSession => &self.soap_session,
		}
	}
}
impl Default for ModeTable {
	fn default() -> Self {
		Self {
			rest: ModeConfig { token_lifetime_seconds: 604_800, refresh_threshold_seconds: 3_600 },
			soap_stateless: ModeConfig {
				token_lifetime_seconds: 604_800,
				refresh_threshold_seconds: 3_600,
			},
			soap_session: ModeConfig {
				token_lifetime_seconds: 900,
				refresh_threshold_seconds: 120,
			},
		}
	}
}

/// Token lifetime and proactive refresh window for one mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeConfig {
	/// Lifetime assumed when the issuer does not report one.
	pub token_lifetime_seconds: u64,
	/// Tokens closer than this to expiry are refreshed before being served.
	pub refresh_threshold_seconds: u64,
}
impl ModeConfig {
	/// Token lifetime as a [`Duration`].
	pub fn token_lifetime(&self) -> Duration {
		seconds(self.token_lifetime_seconds)
	}

	/// Refresh threshold as a [`Duration`].
	pub fn refresh_threshold(&self) -> Duration {
		seconds(self.refresh_threshold_seconds)
	}
}

/// Session pool settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPoolConfig {
	/// Maximum number of concurrent session leases per credential.
	pub size: usize,
	/// TTL of the pool-wide lock guarding the lease table.
	pub lock_timeout_seconds: u64,
	/// How long checkout polls a contended pool lock before failing.
	pub checkout_wait_ms: u64,
	/// Age after which a slot reserved for a session still being created is reclaimed.
	pub reservation_timeout_seconds: u64,
	/// Age after which a session is considered dead upstream.
	pub session_lifetime_seconds: u64,
	/// Free sessions closer than this to their lifetime are re-issued during sweeps.
	pub refresh_margin_seconds: u64,
	/// Interval of the optional background sweep task.
	pub sweep_interval_seconds: u64,
}
impl SessionPoolConfig {
	/// Pool lock timeout as a [`Duration`].
	pub fn lock_timeout(&self) -> Duration {
		seconds(self.lock_timeout_seconds)
	}

	/// Checkout wait budget as a [`StdDuration`].
	pub fn checkout_wait(&self) -> StdDuration {
		StdDuration::from_millis(self.checkout_wait_ms)
	}

	/// Reservation timeout as a [`Duration`].
	pub fn reservation_timeout(&self) -> Duration {
		seconds(self.reservation_timeout_seconds)
	}

	/// Session lifetime as a [`Duration`].
	pub fn session_lifetime(&self) -> Duration {
		seconds(self.session_lifetime_seconds)
	}

	/// Refresh margin as a [`Duration`].
	pub fn refresh_margin(&self) -> Duration {
		seconds(self.refresh_margin_seconds)
	}

	/// Sweep interval as a [`StdDuration`].
	pub fn sweep_interval(&self) -> StdDuration {
		StdDuration::from_secs(self.sweep_interval_seconds.max(1))
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.size == 0 {
			return Err(ConfigError::EmptySessionPool);
		}
		if self.refresh_margin_seconds >= self.session_lifetime_seconds {
			return Err(ConfigError::SessionMarginTooLarge);
		}
		if self.lock_timeout_seconds == 0 {
			return Err(ConfigError::InvalidLockPolicy { reason: "pool lock timeout is zero" });
		}
		if self.reservation_timeout_seconds == 0 {
			return Err(ConfigError::InvalidLockPolicy { reason: "reservation timeout is zero" });
		}

		Ok(())
	}
}
impl Default for SessionPoolConfig {
	fn default() -> Self {
		Self {
			size: 5,
			lock_timeout_seconds: 10,
			checkout_wait_ms: 250,
			reservation_timeout_seconds: 60,
			session_lifetime_seconds: 900,
			refresh_margin_seconds: 120,
			sweep_interval_seconds: 60,
		}
	}
}

/// Exponential backoff policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
	/// Total attempts including the first one.
	pub max_attempts: u32,
	/// Delay before the second attempt.
	pub initial_delay_ms: u64,
	/// Growth factor applied per attempt.
	pub multiplier: f64,
	/// Upper bound for any single delay.
	pub max_delay_ms: u64,
	/// Adds up to 30% uniform jitter on top of each computed delay.
	pub jitter: bool,
}
impl RetryConfig {
	fn validate(&self) -> Result<(), ConfigError> {
		if self.max_attempts == 0 {
			return Err(ConfigError::InvalidRetryPolicy { reason: "max_attempts must be >= 1" });
		}
		if !self.multiplier.is_finite() || self.multiplier < 1.0 {
			return Err(ConfigError::InvalidRetryPolicy { reason: "multiplier must be >= 1" });
		}
		if self.max_delay_ms < self.initial_delay_ms {
			return Err(ConfigError::InvalidRetryPolicy {
				reason: "max_delay_ms is below initial_delay_ms",
			});
		}

		Ok(())
	}
}
impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			initial_delay_ms: 1_000,
			multiplier: 2.0,
			max_delay_ms: 30_000,
			jitter: true,
		}
	}
}

/// Distributed lock policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
	/// Lock TTL and total wait budget; holders renew the TTL while they run.
	pub timeout_seconds: u64,
	/// Maximum acquisition attempts.
	pub max_retries: u32,
	/// Fixed sleep between attempts.
	pub retry_interval_ms: u64,
}
impl LockConfig {
	/// Lock timeout as a [`Duration`].
	pub fn timeout(&self) -> Duration {
		seconds(self.timeout_seconds)
	}

	/// Sleep between attempts as a [`StdDuration`].
	pub fn retry_interval(&self) -> StdDuration {
		StdDuration::from_millis(self.retry_interval_ms)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.timeout_seconds == 0 {
			return Err(ConfigError::InvalidLockPolicy { reason: "timeout is zero" });
		}
		if self.max_retries == 0 {
			return Err(ConfigError::InvalidLockPolicy { reason: "max_retries is zero" });
		}

		Ok(())
	}
}
impl Default for LockConfig {
	fn default() -> Self {
		Self { timeout_seconds: 30, max_retries: 120, retry_interval_ms: 250 }
	}
}

/// Rate-limit table resolved as `category.operation` → `category` → `default`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
	/// Global fallback rule.
	pub default: RateLimitRule,
	/// Rules keyed by `category` or `category.operation`.
	pub rules: BTreeMap<String, RateLimitRule>,
	/// Header convention used for `Retry-After` values.
	pub retry_after: RetryAfterFormat,
}
impl RateLimitConfig {
	/// Adds or replaces a rule, returning the updated table.
	pub fn with_rule(mut self, key: impl Into<String>, limit: u32, window_seconds: u64) -> Self {
		self.rules.insert(key.into(), RateLimitRule { limit, window_seconds });

		self
	}

	/// Resolves the most specific rule for a dotted `category.operation` key.
	pub fn resolve(&self, key: &str) -> &RateLimitRule {
		if let Some(rule) = self.rules.get(key) {
			return rule;
		}

		key.split_once('.')
			.and_then(|(category, _)| self.rules.get(category))
			.unwrap_or(&self.default)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		std::iter::once(("default", &self.default))
			.chain(self.rules.iter().map(|(key, rule)| (key.as_str(), rule)))
			.find(|(_, rule)| rule.limit == 0 || rule.window_seconds == 0)
			.map_or(Ok(()), |(key, _)| Err(ConfigError::InvalidRateLimitRule { key: key.into() }))
	}
}
impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			default: RateLimitRule { limit: 100, window_seconds: 60 },
			rules: BTreeMap::new(),
			retry_after: RetryAfterFormat::default(),
		}
	}
}

/// Quota of `limit` attempts per fixed window of `window_seconds`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
	/// Attempts allowed per window.
	pub limit: u32,
	/// Window length in seconds.
	pub window_seconds: u64,
}

/// How `Retry-After` values are rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAfterFormat {
	/// Delay in whole seconds.
	#[default]
	Seconds,
	/// Absolute IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
	HttpDate,
}

fn seconds(value: u64) -> Duration {
	Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn defaults_are_valid() {
		BrokerConfig::default().validate().expect("Default configuration should validate.");
	}

	#[test]
	fn partial_json_overrides_keep_defaults() {
		let config = BrokerConfig::from_json_str(
			r#"{
				"session_pool": { "size": 2 },
				"retry": { "max_attempts": 5, "jitter": false },
				"rate_limits": { "rules": { "air.shop": { "limit": 5, "window_seconds": 60 } } }
			}"#,
		)
		.expect("Partial configuration should parse.");

		assert_eq!(config.session_pool.size, 2);
		assert_eq!(config.session_pool.session_lifetime_seconds, 900);
		assert_eq!(config.retry.max_attempts, 5);
		assert_eq!(config.retry.initial_delay_ms, 1_000);
		assert_eq!(config.rate_limits.resolve("air.shop").limit, 5);
	}

	#[test]
	fn parse_errors_report_the_offending_path() {
		let err = BrokerConfig::from_json_str(r#"{ "retry": { "max_attempts": "three" } }"#)
			.expect_err("A string attempt count should be rejected.");

		match err {
			Error::Config(ConfigError::Parse { source }) =>
				assert_eq!(source.path().to_string(), "retry.max_attempts"),
			other => panic!("Unexpected error: {other:?}"),
		}
	}

	#[test]
	fn validation_rejects_threshold_beyond_lifetime() {
		let mut config = BrokerConfig::default();

		config.modes.rest.refresh_threshold_seconds = config.modes.rest.token_lifetime_seconds;

		assert!(matches!(
			config.validate(),
			Err(ConfigError::RefreshThresholdTooLarge { mode: AuthMode::Rest })
		));
	}

	#[test]
	fn validation_rejects_zero_rate_limits_and_pool() {
		let config = BrokerConfig {
			rate_limits: RateLimitConfig::default().with_rule("air", 0, 60),
			..Default::default()
		};

		assert!(matches!(
			config.validate(),
			Err(ConfigError::InvalidRateLimitRule { key }) if key == "air"
		));

		let mut config = BrokerConfig::default();

		config.session_pool.size = 0;

		assert!(matches!(config.validate(), Err(ConfigError::EmptySessionPool)));
	}

	#[test]
	fn validation_rejects_lock_timeouts_below_the_retry_budget() {
		let mut config = BrokerConfig::default();

		// 1s + 2s + 4s of backoff, plus 30% jitter, is 9.1s.
		config.retry.max_attempts = 4;
		config.lock.timeout_seconds = 9;

		assert!(matches!(config.validate(), Err(ConfigError::InvalidLockPolicy { .. })));

		config.lock.timeout_seconds = 10;

		config.validate().expect("A lock outlasting the backoff budget should validate.");
	}

	#[test]
	fn resolution_is_hierarchical() {
		let table = RateLimitConfig::default()
			.with_rule("air", 10, 60)
			.with_rule("air.shop", 5, 30);

		assert_eq!(table.resolve("air.shop").limit, 5);
		assert_eq!(table.resolve("air.book").limit, 10);
		assert_eq!(table.resolve("hotel.search").limit, 100);
		assert_eq!(table.resolve("air").limit, 10);
	}
}
