//! Token acquisition, caching, proactive refresh, and exposure for every auth mode.
//!
//! Tokens for the stateless modes are cached in the shared store and renewed inside a
//! per-mode distributed lock, so only one process calls the issuer at a time. Tasks of the
//! same process first coalesce on an in-process guard. A refresh that finds a newer fresh
//! generation after waiting for the lock reuses it instead of calling the issuer again.
//!
//! The session mode delegates to [`SessionPool`]: [`TokenManager::get_token`] checks a lease
//! out and [`TokenManager::release_session`] returns it.

mod metrics;

pub use metrics::RefreshMetrics;

// self
use crate::{
	_prelude::*,
	auth::{AuthMode, Credential, Token},
	config::BrokerConfig,
	error::ConfigError,
	issuer::CredentialIssuer,
	lock::DistributedLock,
	obs::{self, OpKind},
	rate_limit::RateLimiter,
	retry::{DefaultClassifier, RetryOrchestrator},
	rotation::TokenRotator,
	session::SessionPool,
	store::{self, SharedStore, StoreError},
};
#[cfg(feature = "reqwest")]
use crate::issuer::{HttpIssuer, IssuerEndpoints};

/// Entry point for callers that need credentials.
///
/// Clones share the in-process guards and metrics.
#[derive(Clone)]
pub struct TokenManager {
	store: Arc<dyn SharedStore>,
	issuer: Arc<dyn CredentialIssuer>,
	credential: Arc<Credential>,
	config: Arc<BrokerConfig>,
	namespace: String,
	lock: DistributedLock,
	retry: RetryOrchestrator,
	rotator: TokenRotator,
	sessions: Arc<SessionPool>,
	rate_limiter: RateLimiter,
	refresh_metrics: Arc<RefreshMetrics>,
	flow_guards: Arc<Mutex<HashMap<AuthMode, Arc<AsyncMutex<()>>>>>,
}
impl TokenManager {
	/// Validates `config` and wires every component over `store`.
	pub fn new(
		store: Arc<dyn SharedStore>,
		issuer: Arc<dyn CredentialIssuer>,
		credential: Credential,
		config: BrokerConfig,
	) -> Result<Self> {
		config.validate()?;

		let credential = Arc::new(credential);
		let namespace = credential.namespace();
		let lock = DistributedLock::new(store.clone(), config.lock.clone());
		let retry = RetryOrchestrator::new(config.retry.clone());
		let sessions = Arc::new(SessionPool::new(
			store.clone(),
			issuer.clone(),
			credential.clone(),
			config.session_pool.clone(),
			lock.clone(),
			retry.clone(),
		));

		Ok(Self {
			rotator: TokenRotator::new(store.clone(), namespace.clone()),
			rate_limiter: RateLimiter::new(
				store.clone(),
				config.rate_limits.clone(),
				namespace.clone(),
			),
			store,
			issuer,
			credential,
			config: Arc::new(config),
			namespace,
			lock,
			retry,
			sessions,
			refresh_metrics: Default::default(),
			flow_guards: Default::default(),
		})
	}

	/// Builds a manager backed by the HTTP issuer.
	#[cfg(feature = "reqwest")]
	pub fn with_http(
		store: Arc<dyn SharedStore>,
		endpoints: IssuerEndpoints,
		credential: Credential,
		config: BrokerConfig,
	) -> Result<Self> {
		let issuer = Arc::new(HttpIssuer::new(endpoints, &credential)?);

		Self::new(store, issuer, credential, config)
	}

	/// Store-key prefix derived from the credential.
	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	/// Validated configuration.
	pub fn config(&self) -> &BrokerConfig {
		&self.config
	}

	/// Refresh counters for this manager and its clones.
	pub fn refresh_metrics(&self) -> &RefreshMetrics {
		&self.refresh_metrics
	}

	/// Session pool used by [`AuthMode::SoapSession`].
	pub fn sessions(&self) -> &Arc<SessionPool> {
		&self.sessions
	}

	/// Rate limiter sharing this manager's store and namespace.
	pub fn rate_limiter(&self) -> &RateLimiter {
		&self.rate_limiter
	}

	/// Rotation tracker for issued generations.
	pub fn rotator(&self) -> &TokenRotator {
		&self.rotator
	}

	/// Returns a usable token for `mode`, refreshing when the cached one is missing or due.
	///
	/// For [`AuthMode::SoapSession`] the token is a checked-out session lease; hand it back with
	/// [`release_session`](Self::release_session).
	pub async fn get_token(&self, mode: AuthMode) -> Result<Token> {
		obs::observe(OpKind::Token, "get_token", async move {
			if !mode.is_cached() {
				return self.checkout_session().await;
			}

			let now = OffsetDateTime::now_utc();

			if let Some(cached) = self.cached(mode).await?
				&& cached.is_fresh_at(now, self.config.modes.get(mode).refresh_threshold())
			{
				return Ok(cached);
			}

			self.refresh(mode, false).await
		})
		.await
	}

	/// Forces renewal of the `mode` credential.
	///
	/// For [`AuthMode::SoapSession`] this sweeps the pool, re-issuing sessions near expiry.
	pub async fn refresh_token(&self, mode: AuthMode) -> Result<()> {
		obs::observe(OpKind::Token, "refresh_token", async move {
			if mode.is_cached() {
				self.refresh(mode, true).await?;
			} else {
				self.sessions.sweep().await?;
			}

			Ok(())
		})
		.await
	}

	/// Returns `true` when no unexpired credential is available for `mode`.
	pub async fn is_expired(&self, mode: AuthMode) -> Result<bool> {
		let now = OffsetDateTime::now_utc();

		if !mode.is_cached() {
			let lifetime = self.config.session_pool.session_lifetime();

			return Ok(self
				.sessions
				.leases()
				.await?
				.iter()
				.all(|lease| lease.is_expired_at(now, lifetime)));
		}

		Ok(self.cached(mode).await?.is_none_or(|token| token.is_expired_at(now)))
	}

	/// Authorization material for `mode`.
	///
	/// REST yields `Bearer <token>`; stateless SOAP yields the binary security token placed in
	/// the `wsse:BinarySecurityToken` header. Session mode is rejected because the header would
	/// outlive its lease.
	pub async fn authorization_header(&self, mode: AuthMode) -> Result<String> {
		if mode == AuthMode::SoapSession {
			return Err(ConfigError::SessionModeRequiresLease.into());
		}

		let token = self.get_token(mode).await?;

		match mode {
			AuthMode::Rest => Ok(format!("Bearer {}", token.value.expose())),
			_ => Ok(token.value.expose().to_owned()),
		}
	}

	/// Returns a session token obtained from [`get_token`](Self::get_token) to the pool.
	pub async fn release_session(&self, token: &Token) -> Result<()> {
		if token.mode != AuthMode::SoapSession {
			tracing::debug!(mode = %token.mode, "release ignored for a stateless token");

			return Ok(());
		}

		self.sessions.release(&token.value).await
	}

	/// Returns `true` if `value` is the current or previous generation for `mode`.
	pub async fn is_valid_token(&self, mode: AuthMode, value: &str) -> Result<bool> {
		self.rotator.is_valid_token(mode, value).await
	}

	/// Drops the cached token and every retained generation for `mode`.
	pub async fn logout(&self, mode: AuthMode) -> Result<()> {
		self.store.delete(&self.cache_key(mode)).await?;
		self.rotator.cleanup(mode).await?;

		tracing::info!(%mode, "credential state cleared");

		Ok(())
	}

	/// Starts the periodic session sweep using the configured interval.
	pub fn spawn_session_sweeper(&self) -> tokio::task::JoinHandle<()> {
		crate::session::spawn_sweep_task(
			self.sessions.clone(),
			self.config.session_pool.sweep_interval(),
		)
	}

	async fn checkout_session(&self) -> Result<Token> {
		let lease = self.sessions.checkout().await?;
		let lifetime = self.config.session_pool.session_lifetime();

		Ok(Token {
			value: lease.session_token.clone(),
			mode: AuthMode::SoapSession,
			issued_at: lease.acquired_at,
			expires_at: lease.expires_at(lifetime),
			generation: 0,
		})
	}

	async fn refresh(&self, mode: AuthMode, force: bool) -> Result<Token> {
		self.refresh_metrics.record_attempt();

		let result = self.refresh_coalesced(mode, force).await;

		match &result {
			Ok((_, true)) => self.refresh_metrics.record_issued(),
			Ok((_, false)) => self.refresh_metrics.record_reused(),
			Err(err) => {
				self.refresh_metrics.record_failure();

				tracing::warn!(%mode, error = %err, "token refresh failed");
			},
		}

		result.map(|(token, _)| token)
	}

	/// Returns the token and whether it was newly issued.
	///
	/// `observed` is captured before queueing on the in-process guard, so a caller that waited
	/// behind another refresh recognizes the generation that refresh published.
	async fn refresh_coalesced(&self, mode: AuthMode, force: bool) -> Result<(Token, bool)> {
		let observed = self.cached(mode).await?;
		let guard = self.flow_guard(mode);
		let _singleflight = guard.lock().await;

		if let Some(token) = self.reusable(mode, force, observed.as_ref()).await? {
			return Ok((token, false));
		}

		let lock_key = format!("{}:lock:refresh_token_{mode}", self.namespace);

		self.lock
			.with_default_lock(&lock_key, || self.refresh_locked(mode, force, observed.as_ref()))
			.await
	}

	/// Cached token that satisfies this refresh without calling the issuer.
	///
	/// Any fresh token does for a regular refresh. A forced refresh only accepts a generation
	/// newer than `observed`.
	async fn reusable(
		&self,
		mode: AuthMode,
		force: bool,
		observed: Option<&Token>,
	) -> Result<Option<Token>> {
		let threshold = self.config.modes.get(mode).refresh_threshold();
		let now = OffsetDateTime::now_utc();

		Ok(self.cached(mode).await?.filter(|current| {
			let newer = observed.is_none_or(|seen| current.generation > seen.generation);

			current.is_fresh_at(now, threshold) && (!force || newer)
		}))
	}

	/// Runs under the distributed lock; returns the token and whether it was newly issued.
	async fn refresh_locked(
		&self,
		mode: AuthMode,
		force: bool,
		observed: Option<&Token>,
	) -> Result<(Token, bool)> {
		let cache_key = self.cache_key(mode);
		let (current_raw, current) =
			match store::get_json_fenced::<Token>(self.store.as_ref(), &cache_key).await? {
				Some((raw, token)) => (Some(raw), Some(token)),
				None => (None, None),
			};
		let threshold = self.config.modes.get(mode).refresh_threshold();

		if let Some(current) = &current {
			let newer = observed.is_none_or(|seen| current.generation > seen.generation);

			if current.is_fresh_at(OffsetDateTime::now_utc(), threshold) && (!force || newer) {
				tracing::debug!(%mode, generation = current.generation, "reusing published token");

				return Ok((current.clone(), false));
			}
		}

		let context = format!("refresh_token:{mode}");
		let issued = self
			.retry
			.execute(|_| self.issuer.issue(mode, &self.credential), &DefaultClassifier, &context)
			.await?;
		let generation = self.store.increment(&self.generation_key(mode), None).await?;
		let lifetime =
			issued.expires_in.unwrap_or_else(|| self.config.modes.get(mode).token_lifetime());
		let token = Token::new(
			mode,
			issued.value,
			OffsetDateTime::now_utc(),
			lifetime,
			u64::try_from(generation).unwrap_or_default(),
		);

		self.rotator.rotate_token(mode, current.as_ref(), &token).await?;

		let published = store::swap_json(
			self.store.as_ref(),
			&cache_key,
			current_raw.as_deref(),
			&token,
			Some(lifetime),
		)
		.await?;

		if !published {
			tracing::warn!(%mode, "token cache changed during the refresh; keeping the winner");

			return match self.cached(mode).await? {
				Some(winner) if winner.is_fresh_at(OffsetDateTime::now_utc(), threshold) =>
					Ok((winner, false)),
				_ => Err(StoreError::Conflict { key: cache_key }.into()),
			};
		}

		tracing::info!(%mode, generation = token.generation, "token refreshed");

		Ok((token, true))
	}

	async fn cached(&self, mode: AuthMode) -> Result<Option<Token>> {
		store::get_json(self.store.as_ref(), &self.cache_key(mode)).await
	}

	fn flow_guard(&self, mode: AuthMode) -> Arc<AsyncMutex<()>> {
		let mut guards = self.flow_guards.lock();

		guards.entry(mode).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
	}

	fn cache_key(&self, mode: AuthMode) -> String {
		format!("{}:token:{mode}", self.namespace)
	}

	fn generation_key(&self, mode: AuthMode) -> String {
		format!("{}:generation:{mode}", self.namespace)
	}
}
impl Debug for TokenManager {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenManager")
			.field("namespace", &self.namespace)
			.field("credential", &self.credential)
			.field("config", &self.config)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		_preludet::{ScriptedIssuer, build_test_manager, fast_config, test_credential},
		auth::Secret,
		error::TransportError,
		issuer::{IssuedToken, IssuerFuture},
		store::MemoryStore,
	};

	/// Issuer whose issuance lands after another writer already published `winner`.
	struct InterleavedIssuer {
		store: Arc<MemoryStore>,
		cache_key: String,
		winner: Token,
	}
	impl CredentialIssuer for InterleavedIssuer {
		fn issue<'a>(
			&'a self,
			_mode: AuthMode,
			_credential: &'a Credential,
		) -> IssuerFuture<'a, IssuedToken> {
			Box::pin(async move {
				let raw = serde_json::to_string(&self.winner).expect("Token should encode.");

				self.store.put(&self.cache_key, raw, None).await?;

				Ok(IssuedToken::new("late", None))
			})
		}

		fn close_session<'a>(
			&'a self,
			_credential: &'a Credential,
			_session: &'a Secret,
		) -> IssuerFuture<'a, ()> {
			Box::pin(async { Ok(()) })
		}
	}

	#[tokio::test]
	async fn get_token_caches_until_refresh_is_due() {
		let issuer = Arc::new(ScriptedIssuer::default());
		let (manager, _) = build_test_manager(issuer.clone(), fast_config());
		let first = manager.get_token(AuthMode::Rest).await.expect("First fetch should issue.");
		let second = manager.get_token(AuthMode::Rest).await.expect("Second fetch should be cached.");

		assert_eq!(first, second);
		assert_eq!(first.generation, 1);
		assert_eq!(issuer.issued(), 1);
		assert!(!manager.is_expired(AuthMode::Rest).await.expect("Expiry check should succeed."));
	}

	#[tokio::test]
	async fn short_lived_tokens_are_refreshed_before_use() {
		// Issued lifetime (10s) sits inside the one-hour refresh threshold.
		let issuer = Arc::new(ScriptedIssuer::expiring_in(Duration::seconds(10)));
		let (manager, _) = build_test_manager(issuer.clone(), fast_config());
		let first = manager.get_token(AuthMode::Rest).await.expect("First fetch should issue.");
		let second = manager.get_token(AuthMode::Rest).await.expect("Second fetch should refresh.");

		assert_ne!(first.value, second.value);
		assert_eq!(second.generation, 2);
		assert!(second.expires_at > OffsetDateTime::now_utc());
		assert!(
			manager
				.is_valid_token(AuthMode::Rest, first.value.expose())
				.await
				.expect("Lookup should succeed.")
		);
	}

	#[tokio::test]
	async fn forced_refresh_rotates_generations() {
		let issuer = Arc::new(ScriptedIssuer::default());
		let (manager, _) = build_test_manager(issuer.clone(), fast_config());
		let mut values = Vec::new();

		for _ in 0..3 {
			manager.refresh_token(AuthMode::SoapStateless).await.expect("Refresh should succeed.");
			let token =
				manager.get_token(AuthMode::SoapStateless).await.expect("Token should be cached.");

			values.push(token.value);
		}

		let mut validity = Vec::new();

		for value in &values {
			validity.push(
				manager
					.is_valid_token(AuthMode::SoapStateless, value.expose())
					.await
					.expect("Lookup should succeed."),
			);
		}

		assert_eq!(validity, vec![false, true, true]);
		assert_eq!(manager.refresh_metrics().issued(), 3);
	}

	#[tokio::test]
	async fn authentication_failures_are_retried_then_wrapped() {
		let issuer = Arc::new(ScriptedIssuer::default());

		for _ in 0..3 {
			issuer
				.fail_next(Error::Authentication { mode: AuthMode::Rest, reason: "expired".into() });
		}

		let (manager, _) = build_test_manager(issuer.clone(), fast_config());
		let err = manager.get_token(AuthMode::Rest).await.expect_err("Retries should be exhausted.");

		assert!(err.is_authentication());
		assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
		assert_eq!(manager.refresh_metrics().failures(), 1);

		let recovered = manager.get_token(AuthMode::Rest).await.expect("Next call should succeed.");

		assert_eq!(recovered.generation, 1);
	}

	#[tokio::test]
	async fn transient_failure_recovers_within_budget() {
		let issuer = Arc::new(ScriptedIssuer::default());

		issuer.fail_next(TransportError::Status { status: 503, retry_after: None }.into());

		let (manager, _) = build_test_manager(issuer.clone(), fast_config());

		manager.get_token(AuthMode::Rest).await.expect("The second attempt should succeed.");

		assert_eq!(issuer.issued(), 1);
	}

	#[tokio::test]
	async fn authorization_header_per_mode() {
		let issuer = Arc::new(ScriptedIssuer::default());
		let (manager, _) = build_test_manager(issuer, fast_config());
		let rest = manager.authorization_header(AuthMode::Rest).await.expect("REST header.");
		let soap =
			manager.authorization_header(AuthMode::SoapStateless).await.expect("SOAP header.");

		assert_eq!(rest, "Bearer rest-token-1");
		assert_eq!(soap, "soap_stateless-token-2");
		assert!(matches!(
			manager.authorization_header(AuthMode::SoapSession).await,
			Err(Error::Config(ConfigError::SessionModeRequiresLease))
		));
	}

	#[tokio::test]
	async fn session_mode_checks_out_and_releases_leases() {
		let issuer = Arc::new(ScriptedIssuer::default());
		let mut config = fast_config();

		config.session_pool.size = 1;

		let (manager, _) = build_test_manager(issuer.clone(), config);
		let token =
			manager.get_token(AuthMode::SoapSession).await.expect("Checkout should succeed.");

		assert_eq!(token.mode, AuthMode::SoapSession);
		assert!(matches!(
			manager.get_token(AuthMode::SoapSession).await,
			Err(Error::PoolExhausted { size: 1 })
		));

		manager.release_session(&token).await.expect("Release should succeed.");

		let again =
			manager.get_token(AuthMode::SoapSession).await.expect("Lease should be reused.");

		assert_eq!(again.value, token.value);
		assert_eq!(issuer.issued(), 1);
	}

	#[tokio::test]
	async fn logout_clears_cache_and_generations() {
		let issuer = Arc::new(ScriptedIssuer::default());
		let (manager, _) = build_test_manager(issuer.clone(), fast_config());
		let token = manager.get_token(AuthMode::Rest).await.expect("Token should be issued.");

		manager.logout(AuthMode::Rest).await.expect("Logout should succeed.");

		assert!(manager.is_expired(AuthMode::Rest).await.expect("Expiry check should succeed."));
		assert!(
			!manager
				.is_valid_token(AuthMode::Rest, token.value.expose())
				.await
				.expect("Lookup should succeed.")
		);

		let next = manager.get_token(AuthMode::Rest).await.expect("Token should be reissued.");

		assert_eq!(next.generation, 2);
		assert_eq!(issuer.issued(), 2);
	}

	#[test]
	fn invalid_config_is_rejected() {
		let mut config = fast_config();

		config.modes.rest.refresh_threshold_seconds = config.modes.rest.token_lifetime_seconds;

		let err = TokenManager::new(
			Arc::new(crate::store::MemoryStore::default()),
			Arc::new(ScriptedIssuer::default()),
			crate::_preludet::test_credential(),
			config,
		)
		.expect_err("Threshold equal to lifetime should be rejected.");

		assert!(matches!(
			err,
			Error::Config(ConfigError::RefreshThresholdTooLarge { mode: AuthMode::Rest })
		));
	}

	#[tokio::test]
	async fn concurrent_forced_refreshes_issue_once() {
		let issuer = Arc::new(ScriptedIssuer::slow(StdDuration::from_millis(50)));
		let (manager, _) = build_test_manager(issuer.clone(), fast_config());
		let initial = manager.get_token(AuthMode::Rest).await.expect("Initial fetch should issue.");
		let (first, second) = tokio::join!(
			manager.refresh_token(AuthMode::Rest),
			manager.refresh_token(AuthMode::Rest)
		);

		first.expect("First refresh should succeed.");
		second.expect("Second refresh should succeed.");

		assert_eq!(issuer.issued(), 2);
		assert_eq!(manager.refresh_metrics().reused(), 1);

		let current = manager.get_token(AuthMode::Rest).await.expect("Token should be cached.");

		assert_eq!(current.generation, 2);
		assert!(
			manager
				.is_valid_token(AuthMode::Rest, initial.value.expose())
				.await
				.expect("Lookup should succeed.")
		);
	}

	#[tokio::test]
	async fn refresh_keeps_a_token_published_while_it_was_issuing() {
		let store = Arc::new(MemoryStore::default());
		let credential = test_credential();
		let winner = Token::new(
			AuthMode::Rest,
			"winner",
			OffsetDateTime::now_utc(),
			Duration::days(7),
			9,
		);
		let issuer = Arc::new(InterleavedIssuer {
			store: store.clone(),
			cache_key: format!("{}:token:rest", credential.namespace()),
			winner: winner.clone(),
		});
		let manager = TokenManager::new(store.clone(), issuer, credential, fast_config())
			.expect("Manager should build.");
		let token = manager.get_token(AuthMode::Rest).await.expect("Refresh should settle.");

		assert_eq!(token, winner);
		assert_eq!(manager.refresh_metrics().issued(), 0);
		assert_eq!(manager.refresh_metrics().reused(), 1);
		assert_eq!(
			manager.get_token(AuthMode::Rest).await.expect("Token should be cached.").value,
			Secret::new("winner")
		);
	}
}
