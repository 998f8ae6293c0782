//! Bounded pool of stateful upstream sessions shared through the store.
//!
//! The lease table lives under one store key. Every change is a short, purely local step taken
//! under the pool-wide distributed lock and persisted with a write fenced on the table that was
//! read, so a holder that lost the lock cannot overwrite a newer table. Upstream calls never run
//! under the lock: checkout first reserves a slot, creates the session with the lock released,
//! and then turns the reservation into a lease. Sweeps hold due leases the same way while their
//! replacements are created.
//!
//! Checkout never waits for a lease to come free. Once leases plus reservations reach the pool
//! size it fails with [`Error::PoolExhausted`], and a contended pool lock fails it after the
//! short checkout wait with [`Error::LockAcquisition`].

pub mod lease;

pub use lease::{PoolStats, Reservation, SessionLease};

// crates.io
use uuid::Uuid;
// self
use crate::{
	_prelude::*,
	auth::{AuthMode, Credential, Secret},
	config::SessionPoolConfig,
	issuer::CredentialIssuer,
	lock::DistributedLock,
	obs::{self, OpKind},
	retry::{DefaultClassifier, RetryOrchestrator},
	session::lease::{Claim, PoolTable},
	store::{self, SharedStore, StoreError},
};

/// Session pool for one credential.
pub struct SessionPool {
	store: Arc<dyn SharedStore>,
	issuer: Arc<dyn CredentialIssuer>,
	credential: Arc<Credential>,
	config: SessionPoolConfig,
	lock: DistributedLock,
	retry: RetryOrchestrator,
	leases_key: String,
	lock_key: String,
}
impl SessionPool {
	/// Creates a pool whose keys are namespaced by the credential.
	pub fn new(
		store: Arc<dyn SharedStore>,
		issuer: Arc<dyn CredentialIssuer>,
		credential: Arc<Credential>,
		config: SessionPoolConfig,
		lock: DistributedLock,
		retry: RetryOrchestrator,
	) -> Self {
		let namespace = credential.namespace();

		Self {
			store,
			issuer,
			credential,
			config,
			lock,
			retry,
			leases_key: format!("{namespace}:sessions"),
			lock_key: format!("{namespace}:lock:session_pool"),
		}
	}

	/// Pool policy.
	pub fn config(&self) -> &SessionPoolConfig {
		&self.config
	}

	/// Checks out a free lease, creating a session when the pool has room.
	///
	/// Expired leases are evicted before the scan. Among free leases the youngest is handed out.
	pub async fn checkout(&self) -> Result<SessionLease> {
		obs::observe(OpKind::Session, "checkout", async {
			let size = self.config.size;
			let claim = self
				.update(OffsetDateTime::now_utc(), self.config.checkout_wait(), |table, now| {
					table.claim(now, size)
				})
				.await?;

			match claim {
				Claim::Leased(lease) => {
					tracing::debug!("reusing pooled session");

					Ok(lease)
				},
				Claim::Reserved(id) => self.fill_reservation(&id).await,
				Claim::Exhausted => {
					tracing::warn!(size, "session pool exhausted");

					Err(Error::PoolExhausted { size })
				},
			}
		})
		.await
	}

	/// Returns a lease to the pool. Unknown tokens (already evicted) are ignored.
	pub async fn release(&self, session_token: &Secret) -> Result<()> {
		obs::observe(OpKind::Session, "release", async {
			let released = self
				.update(OffsetDateTime::now_utc(), self.lock_wait(), |table, now| {
					table.release(session_token, now)
				})
				.await?;

			if released {
				tracing::debug!("session released");
			} else {
				tracing::debug!("released session is no longer pooled");
			}

			Ok(())
		})
		.await
	}

	/// Evicts expired leases and re-issues free leases inside the refresh margin.
	pub async fn sweep(&self) -> Result<PoolStats> {
		self.sweep_at(OffsetDateTime::now_utc()).await
	}

	/// [`sweep`](Self::sweep) evaluated at `now`.
	///
	/// A lease whose re-issue fails is kept and checked back in.
	pub async fn sweep_at(&self, now: OffsetDateTime) -> Result<PoolStats> {
		obs::observe(OpKind::Session, "sweep", async {
			let lifetime = self.config.session_lifetime();
			let margin = self.config.refresh_margin();
			let size = self.config.size;
			let owner = format!("sweep:{}", Uuid::new_v4());
			let (due, stats) = self
				.update(now, self.lock_wait(), |table, now| {
					(table.mark_due(now, lifetime, margin, &owner), table.stats())
				})
				.await?;

			if due.is_empty() {
				return Ok(stats);
			}

			let mut settled = Vec::with_capacity(due.len());

			for previous in due {
				match self.create_session().await {
					Ok(replacement) => {
						tracing::info!("re-issued session nearing expiry");

						settled.push((previous, Some(replacement)));
					},
					Err(err) => {
						tracing::warn!(error = %err, "failed to re-issue session; keeping current");

						settled.push((previous, None));
					},
				}
			}

			let replacements =
				settled.iter().filter_map(|(_, replacement)| replacement.clone()).collect();
			let outcome = self
				.update(now, self.lock_wait(), |table, now| {
					let retired = settled
						.into_iter()
						.filter_map(|(previous, replacement)| {
							table.settle(&previous, replacement, &owner, now, size)
						})
						.collect::<Vec<_>>();

					(table.stats(), retired)
				})
				.await;

			match outcome {
				Ok((stats, retired)) => {
					self.close_all(retired).await;

					Ok(stats)
				},
				Err(err) => {
					self.close_all(replacements).await;

					Err(err)
				},
			}
		})
		.await
	}

	/// Current occupancy, read without taking the pool lock.
	pub async fn stats(&self) -> Result<PoolStats> {
		Ok(self.load().await?.stats())
	}

	/// Snapshot of every tracked lease.
	pub async fn leases(&self) -> Result<Vec<SessionLease>> {
		Ok(self.load().await?.leases)
	}

	async fn fill_reservation(&self, id: &str) -> Result<SessionLease> {
		let size = self.config.size;
		let session_token = match self.create_session().await {
			Ok(session_token) => session_token,
			Err(err) => {
				let now = OffsetDateTime::now_utc();
				let cancelled =
					self.update(now, self.lock_wait(), |table, _| table.cancel(id)).await;

				if let Err(cancel_err) = cancelled {
					tracing::warn!(
						error = %cancel_err,
						"failed to drop session reservation; it is reclaimed on timeout"
					);
				}

				return Err(err);
			},
		};
		let pooled = session_token.clone();
		let filled = self
			.update(OffsetDateTime::now_utc(), self.lock_wait(), move |table, now| {
				table.fill(id, pooled, now, size)
			})
			.await;

		match filled {
			Ok(Some(lease)) => {
				tracing::info!("created pooled session");

				Ok(lease)
			},
			Ok(None) => {
				tracing::warn!(size, "session reservation was reclaimed and the pool is full");
				self.close_all(vec![session_token]).await;

				Err(Error::PoolExhausted { size })
			},
			Err(err) => {
				self.close_all(vec![session_token]).await;

				Err(err)
			},
		}
	}

	/// Applies `mutate` to the table under the pool lock and persists it with a fenced write.
	///
	/// Expired leases and abandoned reservations are evicted first; their sessions are closed
	/// once the lock is released.
	async fn update<T>(
		&self,
		now: OffsetDateTime,
		wait: StdDuration,
		mutate: impl FnOnce(&mut PoolTable, OffsetDateTime) -> T,
	) -> Result<T> {
		let lifetime = self.config.session_lifetime();
		let reservation_timeout = self.config.reservation_timeout();
		let (value, retired) = self
			.lock
			.with_lock_within(&self.lock_key, self.config.lock_timeout(), wait, move || async move {
				let (raw, mut table) =
					match store::get_json_fenced(self.store.as_ref(), &self.leases_key).await? {
						Some((raw, table)) => (Some(raw), table),
						None => (None, PoolTable::default()),
					};
				let retired = table.evict(now, lifetime, reservation_timeout);
				let value = mutate(&mut table, now);
				let stored = store::swap_json(
					self.store.as_ref(),
					&self.leases_key,
					raw.as_deref(),
					&table,
					None,
				)
				.await?;

				if !stored {
					tracing::warn!(key = %self.leases_key, "lease table changed under the lock");

					return Err(StoreError::Conflict { key: self.leases_key.clone() }.into());
				}

				Ok((value, retired))
			})
			.await?;

		self.close_all(retired).await;

		Ok(value)
	}

	fn lock_wait(&self) -> StdDuration {
		StdDuration::try_from(self.config.lock_timeout()).unwrap_or(StdDuration::ZERO)
	}

	async fn create_session(&self) -> Result<Secret> {
		let issued = self
			.retry
			.execute(
				|_| self.issuer.issue(AuthMode::SoapSession, &self.credential),
				&DefaultClassifier,
				"session_create",
			)
			.await?;

		Ok(issued.value)
	}

	async fn close_all(&self, sessions: Vec<Secret>) {
		for session in sessions {
			if let Err(err) = self.issuer.close_session(&self.credential, &session).await {
				tracing::warn!(error = %err, "failed to close retired session");
			}
		}
	}

	async fn load(&self) -> Result<PoolTable> {
		Ok(store::get_json(self.store.as_ref(), &self.leases_key).await?.unwrap_or_default())
	}
}
impl Debug for SessionPool {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("SessionPool")
			.field("config", &self.config)
			.field("leases_key", &self.leases_key)
			.finish()
	}
}

/// Spawns a task that sweeps `pool` every `interval`.
///
/// The first sweep runs one interval after spawning. Sweep failures are logged and the
/// loop continues; abort the returned handle to stop it.
pub fn spawn_sweep_task(
	pool: Arc<SessionPool>,
	interval: StdDuration,
) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);

		ticker.tick().await;

		loop {
			ticker.tick().await;

			match pool.sweep().await {
				Ok(stats) => tracing::debug!(?stats, "session sweep finished"),
				Err(err) => tracing::warn!(error = %err, "session sweep failed"),
			}
		}
	})
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		_preludet::{ScriptedIssuer, fast_config, test_credential},
		store::MemoryStore,
	};

	fn pool(size: usize) -> (Arc<SessionPool>, Arc<ScriptedIssuer>) {
		pool_with(size, ScriptedIssuer::default())
	}

	fn pool_with(size: usize, issuer: ScriptedIssuer) -> (Arc<SessionPool>, Arc<ScriptedIssuer>) {
		let config = fast_config();
		let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::default());
		let issuer = Arc::new(issuer);
		let pool = SessionPool::new(
			store.clone(),
			issuer.clone(),
			Arc::new(test_credential()),
			SessionPoolConfig { size, ..config.session_pool },
			DistributedLock::new(store, config.lock),
			RetryOrchestrator::new(config.retry),
		);

		(Arc::new(pool), issuer)
	}

	fn office_closed() -> Error {
		Error::Authorization { reason: "office closed".into() }
	}

	#[tokio::test]
	async fn third_checkout_is_rejected_when_two_are_held() {
		let (pool, issuer) = pool(2);
		let first = pool.checkout().await.expect("First checkout should succeed.");
		let second = pool.checkout().await.expect("Second checkout should succeed.");

		assert_ne!(first.session_token, second.session_token);
		assert_eq!(issuer.issued(), 2);
		assert!(matches!(pool.checkout().await, Err(Error::PoolExhausted { size: 2 })));
		assert_eq!(
			pool.stats().await.expect("Stats should load."),
			PoolStats { total: 2, in_use: 2, free: 0, reserved: 0 }
		);

		pool.release(&first.session_token).await.expect("Release should succeed.");

		let reused = pool.checkout().await.expect("A released lease should be reused.");

		assert_eq!(reused.session_token, first.session_token);
		assert_eq!(issuer.issued(), 2);
	}

	#[tokio::test]
	async fn sweep_reissues_free_leases_and_evicts_expired_ones() {
		let (pool, issuer) = pool(2);
		let lease = pool.checkout().await.expect("Checkout should succeed.");

		pool.release(&lease.session_token).await.expect("Release should succeed.");

		let near_expiry = lease.acquired_at + Duration::seconds(800);
		let stats = pool.sweep_at(near_expiry).await.expect("Sweep should succeed.");

		assert_eq!(stats, PoolStats { total: 1, in_use: 0, free: 1, reserved: 0 });
		assert_eq!(issuer.issued(), 2);
		assert_eq!(issuer.closed(), 1);

		let reissued = pool.checkout().await.expect("Checkout should succeed.");

		assert_ne!(reissued.session_token, lease.session_token);

		let expired = reissued.acquired_at + Duration::seconds(901);
		let stats = pool.sweep_at(expired).await.expect("Sweep should succeed.");

		assert_eq!(stats.total, 0);
		assert_eq!(issuer.closed(), 2);
	}

	#[tokio::test]
	async fn failed_reissue_keeps_the_current_lease() {
		let (pool, issuer) = pool(2);
		let lease = pool.checkout().await.expect("Checkout should succeed.");

		pool.release(&lease.session_token).await.expect("Release should succeed.");
		issuer.fail_next(office_closed());

		let stats = pool
			.sweep_at(lease.acquired_at + Duration::seconds(800))
			.await
			.expect("A failed re-issue should not fail the sweep.");

		assert_eq!(stats, PoolStats { total: 1, in_use: 0, free: 1, reserved: 0 });
		assert_eq!(issuer.closed(), 0);

		let again = pool.checkout().await.expect("The kept lease should be checked out.");

		assert_eq!(again.session_token, lease.session_token);
	}

	#[tokio::test]
	async fn failed_creation_after_a_reissue_leaks_nothing() {
		let (pool, issuer) = pool(2);
		let lease = pool.checkout().await.expect("Checkout should succeed.");

		pool.release(&lease.session_token).await.expect("Release should succeed.");
		pool.sweep_at(lease.acquired_at + Duration::seconds(800))
			.await
			.expect("Sweep should succeed.");

		let reissued = pool.checkout().await.expect("The re-issued lease should be free.");

		issuer.fail_next(office_closed());

		assert!(matches!(pool.checkout().await, Err(Error::Authorization { .. })));
		assert_eq!(issuer.issued(), 2);
		assert_eq!(issuer.closed(), 1);

		let leases = pool.leases().await.expect("Leases should load.");

		assert_eq!(leases.len(), 1);
		assert_eq!(leases[0].session_token, reissued.session_token);
		assert_eq!(
			pool.stats().await.expect("Stats should load."),
			PoolStats { total: 1, in_use: 1, free: 0, reserved: 0 }
		);

		pool.checkout().await.expect("The freed slot should be usable again.");

		assert_eq!(issuer.issued(), 3);
	}

	#[tokio::test]
	async fn checkout_does_not_wait_behind_a_slow_creation() {
		let (pool, issuer) = pool_with(1, ScriptedIssuer::slow(StdDuration::from_millis(300)));
		let first = tokio::spawn({
			let pool = pool.clone();

			async move { pool.checkout().await }
		});

		tokio::time::sleep(StdDuration::from_millis(50)).await;

		assert_eq!(pool.stats().await.expect("Stats should load.").reserved, 1);

		let started = tokio::time::Instant::now();
		let err = pool.checkout().await.expect_err("The only slot is reserved.");

		assert!(matches!(err, Error::PoolExhausted { size: 1 }));
		assert!(started.elapsed() < StdDuration::from_millis(200));

		first
			.await
			.expect("Checkout task should not panic.")
			.expect("First checkout should succeed.");

		assert_eq!(issuer.issued(), 1);
		assert_eq!(
			pool.stats().await.expect("Stats should load."),
			PoolStats { total: 1, in_use: 1, free: 0, reserved: 0 }
		);
	}

	#[tokio::test]
	async fn releasing_an_unknown_session_is_a_no_op() {
		let (pool, _) = pool(1);

		pool.release(&Secret::new("gone")).await.expect("Release should not fail.");

		assert_eq!(pool.stats().await.expect("Stats should load.").total, 0);
	}

	#[tokio::test]
	async fn concurrent_checkouts_never_exceed_pool_size() {
		let (pool, issuer) = pool(3);
		let tasks = (0..8)
			.map(|_| {
				let pool = pool.clone();

				tokio::spawn(async move { pool.checkout().await })
			})
			.collect::<Vec<_>>();
		let mut leased = 0;

		for task in tasks {
			match task.await.expect("Checkout task should not panic.") {
				Ok(_) => leased += 1,
				Err(Error::PoolExhausted { .. } | Error::LockAcquisition { .. }) => {},
				Err(other) => panic!("Unexpected error: {other:?}"),
			}
		}

		assert!(leased <= 3);
		assert!(issuer.issued() <= 3);
		assert!(pool.stats().await.expect("Stats should load.").in_use <= 3);
	}
}
