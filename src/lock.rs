//! Best-effort distributed mutex built on [`SharedStore::add_if_absent`].
//!
//! A lock is a store entry holding `{owner, acquired_at, ttl}` written with a TTL equal to the
//! lock timeout, so a crashed holder's lock disappears on its own. Entries older than the
//! timeout that are still visible (stores with coarse expiry) are taken over with
//! [`SharedStore::compare_and_swap`] against the exact stale value that was observed, so two
//! contenders cannot both seize the same stale lock. Release only deletes an entry that still
//! carries the caller's owner id.
//!
//! While a guard is alive a background task re-stamps the entry every third of the TTL, so a
//! holder that outlives its timeout (slow issuer, long retry backoff) keeps the lock. Only a
//! holder that stops running loses it.

// crates.io
use tokio::task::JoinHandle;
use uuid::Uuid;
// self
use crate::{
	_prelude::*,
	config::LockConfig,
	obs::{self, OpKind},
	store::{CompareAndSwapOutcome, SharedStore},
};

/// Stored representation of a held lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
	/// Opaque unique owner id.
	pub owner: String,
	/// Acquisition instant.
	pub acquired_at: OffsetDateTime,
	/// Lock TTL in whole seconds.
	pub ttl_seconds: i64,
}
impl LockRecord {
	fn new(timeout: Duration) -> Self {
		Self::stamped(Uuid::new_v4().to_string(), timeout)
	}

	fn stamped(owner: String, timeout: Duration) -> Self {
		Self { owner, acquired_at: OffsetDateTime::now_utc(), ttl_seconds: timeout.whole_seconds() }
	}

	/// Returns `true` once the record outlived `timeout` at `now`.
	pub fn is_stale_at(&self, now: OffsetDateTime, timeout: Duration) -> bool {
		now - self.acquired_at > timeout
	}
}

/// Mutual exclusion over named resources shared by every process using the same store.
#[derive(Clone)]
pub struct DistributedLock {
	store: Arc<dyn SharedStore>,
	config: LockConfig,
}
impl DistributedLock {
	/// Creates a lock manager over `store` with the provided policy.
	pub fn new(store: Arc<dyn SharedStore>, config: LockConfig) -> Self {
		Self { store, config }
	}

	/// Policy backing this lock manager.
	pub fn config(&self) -> &LockConfig {
		&self.config
	}

	/// Acquires `key`, polling at the configured interval.
	///
	/// `timeout` is the lock TTL, the age after which a holder is considered stale, and the
	/// total wait budget. Fails with [`Error::LockAcquisition`] once `max_retries` attempts or
	/// the wait budget are used up.
	pub async fn acquire_lock(&self, key: &str, timeout: Duration) -> Result<LockGuard> {
		let wait = StdDuration::try_from(timeout).unwrap_or(StdDuration::ZERO);

		self.acquire_within(key, timeout, wait).await
	}

	/// Acquires `key` with TTL `timeout`, giving up after `wait`.
	///
	/// At least one attempt is made even when `wait` is zero.
	pub async fn acquire_within(
		&self,
		key: &str,
		timeout: Duration,
		wait: StdDuration,
	) -> Result<LockGuard> {
		obs::observe(OpKind::Lock, "acquire_lock", self.acquire_inner(key, timeout, wait)).await
	}

	/// Releases a guard explicitly; equivalent to [`LockGuard::release`].
	pub async fn release_lock(&self, guard: LockGuard) -> Result<()> {
		guard.release().await
	}

	/// Runs `f` while holding `key`, releasing the lock on every exit path.
	///
	/// Errors from `f` take precedence over release failures. If the returned future is dropped
	/// or `f` panics, the guard's drop hook schedules the release on the current runtime.
	pub async fn with_lock<T, F, Fut>(&self, key: &str, timeout: Duration, f: F) -> Result<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let wait = StdDuration::try_from(timeout).unwrap_or(StdDuration::ZERO);

		self.with_lock_within(key, timeout, wait, f).await
	}

	/// [`with_lock`](Self::with_lock) with a wait budget independent of the TTL.
	pub async fn with_lock_within<T, F, Fut>(
		&self,
		key: &str,
		timeout: Duration,
		wait: StdDuration,
		f: F,
	) -> Result<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let guard = self.acquire_within(key, timeout, wait).await?;
		let outcome = f().await;
		let released = guard.release().await;
		let value = outcome?;

		released?;

		Ok(value)
	}

	/// Runs `f` under `key` using the configured default timeout.
	pub async fn with_default_lock<T, F, Fut>(&self, key: &str, f: F) -> Result<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		self.with_lock(key, self.config.timeout(), f).await
	}

	async fn acquire_inner(
		&self,
		key: &str,
		timeout: Duration,
		wait: StdDuration,
	) -> Result<LockGuard> {
		let deadline = tokio::time::Instant::now() + wait;
		let max_attempts = self.config.max_retries.max(1);
		let mut attempt = 0;

		loop {
			attempt += 1;

			if let Some(guard) = self.try_acquire(key, timeout).await? {
				tracing::debug!(key, attempt, "lock acquired");

				return Ok(guard);
			}
			if attempt >= max_attempts || tokio::time::Instant::now() >= deadline {
				tracing::warn!(key, attempts = attempt, "lock acquisition failed");

				return Err(Error::LockAcquisition { key: key.to_owned(), attempts: attempt });
			}

			tokio::time::sleep(self.config.retry_interval()).await;
		}
	}

	/// Makes a single acquisition attempt, including a stale takeover when applicable.
	pub async fn try_acquire(&self, key: &str, timeout: Duration) -> Result<Option<LockGuard>> {
		let record = LockRecord::new(timeout);
		let raw = encode(key, &record)?;

		if self.store.add_if_absent(key, raw.clone(), Some(timeout)).await? {
			return Ok(Some(self.guard(key, timeout, record, raw)));
		}

		let Some(existing_raw) = self.store.get(key).await? else {
			return Ok(None);
		};
		let stale = match serde_json::from_str::<LockRecord>(&existing_raw) {
			Ok(existing) => existing.is_stale_at(OffsetDateTime::now_utc(), timeout),
			Err(_) => true,
		};

		if !stale {
			return Ok(None);
		}

		match self.store.compare_and_swap(key, &existing_raw, raw.clone(), Some(timeout)).await? {
			CompareAndSwapOutcome::Updated => {
				tracing::warn!(key, "took over stale lock");

				Ok(Some(self.guard(key, timeout, record, raw)))
			},
			CompareAndSwapOutcome::Mismatch | CompareAndSwapOutcome::Missing => Ok(None),
		}
	}

	/// Reads the current holder of `key`, if any.
	pub async fn holder(&self, key: &str) -> Result<Option<LockRecord>> {
		crate::store::get_json(self.store.as_ref(), key).await
	}

	fn guard(&self, key: &str, timeout: Duration, record: LockRecord, raw: String) -> LockGuard {
		let raw = Arc::new(Mutex::new(raw));
		let renewal = spawn_renewal(
			self.store.clone(),
			key.to_owned(),
			record.owner.clone(),
			timeout,
			raw.clone(),
		);

		LockGuard {
			store: self.store.clone(),
			key: key.to_owned(),
			record,
			raw,
			renewal,
			released: false,
		}
	}
}
impl Debug for DistributedLock {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("DistributedLock").field("config", &self.config).finish()
	}
}

/// Proof of lock ownership; releases the lock when released explicitly or dropped.
pub struct LockGuard {
	store: Arc<dyn SharedStore>,
	key: String,
	record: LockRecord,
	raw: Arc<Mutex<String>>,
	renewal: Option<JoinHandle<()>>,
	released: bool,
}
impl LockGuard {
	/// Lock key.
	pub fn key(&self) -> &str {
		&self.key
	}

	/// Owner id written to the store.
	pub fn owner(&self) -> &str {
		&self.record.owner
	}

	/// Deletes the lock entry if this guard still owns it.
	pub async fn release(mut self) -> Result<()> {
		self.released = true;

		if let Some(renewal) = self.renewal.take() {
			renewal.abort();
		}

		let raw = self.raw.lock().clone();

		match release_owned(self.store.as_ref(), &self.key, &self.record.owner, &raw).await? {
			CompareAndSwapOutcome::Updated => tracing::debug!(key = %self.key, "lock released"),
			outcome => tracing::warn!(
				key = %self.key,
				?outcome,
				"lock was no longer held by this owner at release"
			),
		}

		Ok(())
	}
}
impl Drop for LockGuard {
	fn drop(&mut self) {
		if let Some(renewal) = self.renewal.take() {
			renewal.abort();
		}
		if self.released {
			return;
		}

		let store = self.store.clone();
		let key = std::mem::take(&mut self.key);
		let owner = self.record.owner.clone();
		let raw = self.raw.lock().clone();

		match tokio::runtime::Handle::try_current() {
			Ok(handle) => {
				handle.spawn(async move {
					if let Err(err) = release_owned(store.as_ref(), &key, &owner, &raw).await {
						tracing::warn!(%key, error = %err, "failed to release dropped lock");
					}
				});
			},
			Err(_) => tracing::warn!(%key, "lock dropped outside a runtime; it expires via TTL"),
		}
	}
}
impl Debug for LockGuard {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("LockGuard")
			.field("key", &self.key)
			.field("owner", &self.record.owner)
			.field("released", &self.released)
			.finish()
	}
}

/// Deletes `key` if it holds `raw`, or any record still naming `owner`.
///
/// The second case covers a renewal that landed in the store after the guard last saw it.
async fn release_owned(
	store: &dyn SharedStore,
	key: &str,
	owner: &str,
	raw: &str,
) -> Result<CompareAndSwapOutcome> {
	let outcome = store.compare_and_delete(key, raw).await?;

	if outcome != CompareAndSwapOutcome::Mismatch {
		return Ok(outcome);
	}

	let Some(current) = store.get(key).await? else {
		return Ok(CompareAndSwapOutcome::Missing);
	};

	match serde_json::from_str::<LockRecord>(&current) {
		Ok(record) if record.owner == owner => Ok(store.compare_and_delete(key, &current).await?),
		_ => Ok(CompareAndSwapOutcome::Mismatch),
	}
}

/// Re-stamps the lock every third of its TTL until aborted or the lock is lost.
fn spawn_renewal(
	store: Arc<dyn SharedStore>,
	key: String,
	owner: String,
	timeout: Duration,
	raw: Arc<Mutex<String>>,
) -> Option<JoinHandle<()>> {
	let period = StdDuration::try_from(timeout / 3).ok().filter(|period| !period.is_zero())?;
	let handle = tokio::runtime::Handle::try_current().ok()?;

	Some(handle.spawn(async move {
		let mut ticker = tokio::time::interval(period);

		ticker.tick().await;

		loop {
			ticker.tick().await;

			let Ok(next) = encode(&key, &LockRecord::stamped(owner.clone(), timeout)) else {
				return;
			};
			let expected = raw.lock().clone();

			match store.compare_and_swap(&key, &expected, next.clone(), Some(timeout)).await {
				Ok(CompareAndSwapOutcome::Updated) => *raw.lock() = next,
				Ok(outcome) => {
					tracing::warn!(%key, ?outcome, "lock lost before renewal");

					return;
				},
				Err(err) => tracing::warn!(%key, error = %err, "lock renewal failed"),
			}
		}
	}))
}

fn encode(key: &str, record: &LockRecord) -> Result<String> {
	serde_json::to_string(record)
		.map_err(|err| crate::store::StoreError::encode(key, err).into())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::store::MemoryStore;

	fn lock_over(store: &Arc<MemoryStore>, max_retries: u32) -> DistributedLock {
		let shared: Arc<dyn SharedStore> = store.clone();

		DistributedLock::new(shared, LockConfig {
			timeout_seconds: 30,
			max_retries,
			retry_interval_ms: 5,
		})
	}

	#[tokio::test]
	async fn second_holder_is_rejected_until_release() {
		let store = Arc::new(MemoryStore::default());
		let lock = lock_over(&store, 3);
		let first = lock
			.acquire_lock("refresh_token_rest", Duration::seconds(30))
			.await
			.expect("First acquisition should succeed.");
		let err = lock
			.acquire_lock("refresh_token_rest", Duration::seconds(30))
			.await
			.expect_err("A held lock should not be acquired twice.");

		assert!(matches!(err, Error::LockAcquisition { attempts: 3, .. }));

		first.release().await.expect("Release should succeed.");

		let second = lock
			.acquire_lock("refresh_token_rest", Duration::seconds(30))
			.await
			.expect("Acquisition after release should succeed.");

		let holder =
			lock.holder("refresh_token_rest").await.expect("Holder lookup should succeed.");

		assert_eq!(holder.map(|record| record.owner), Some(second.owner().to_owned()));
	}

	#[tokio::test]
	async fn with_lock_releases_when_the_body_fails() {
		let store = Arc::new(MemoryStore::default());
		let lock = lock_over(&store, 1);
		let err = lock
			.with_lock("k", Duration::seconds(30), || async {
				Err::<(), _>(Error::Authorization { reason: "boom".into() })
			})
			.await
			.expect_err("The body error should propagate.");

		assert!(matches!(err, Error::Authorization { .. }));

		let guard = lock
			.acquire_lock("k", Duration::seconds(30))
			.await
			.expect("The lock should be free immediately after a failed body.");

		guard.release().await.expect("Release should succeed.");
	}

	#[tokio::test]
	async fn stale_lock_is_taken_over() {
		let store = Arc::new(MemoryStore::default());
		let lock = lock_over(&store, 1);
		let stale = LockRecord {
			owner: "crashed".into(),
			acquired_at: OffsetDateTime::now_utc() - Duration::minutes(10),
			ttl_seconds: 30,
		};

		store
			.put("k", serde_json::to_string(&stale).expect("Record should encode."), None)
			.await
			.expect("Seeding the stale lock should succeed.");

		let guard = lock
			.acquire_lock("k", Duration::seconds(30))
			.await
			.expect("A stale lock should be taken over.");

		assert_ne!(guard.owner(), "crashed");
	}

	#[tokio::test]
	async fn release_does_not_delete_someone_elses_lock() {
		let store = Arc::new(MemoryStore::default());
		let lock = lock_over(&store, 1);
		let guard =
			lock.acquire_lock("k", Duration::seconds(30)).await.expect("Acquire should succeed.");

		store.put("k", "other-owner".into(), None).await.expect("Overwrite should succeed.");
		guard.release().await.expect("Release should not fail on mismatch.");

		assert_eq!(store.get("k").await.expect("Get should succeed."), Some("other-owner".into()));
	}

	#[tokio::test]
	async fn dropped_guard_releases_in_the_background() {
		let store = Arc::new(MemoryStore::default());
		let lock = lock_over(&store, 1);

		drop(lock.acquire_lock("k", Duration::seconds(30)).await.expect("Acquire should succeed."));
		tokio::time::sleep(StdDuration::from_millis(20)).await;

		let guard = lock
			.acquire_lock("k", Duration::seconds(30))
			.await
			.expect("The dropped guard should have released the lock.");

		guard.release().await.expect("Release should succeed.");
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn held_lock_is_renewed_past_its_ttl() {
		let store = Arc::new(MemoryStore::default());
		let lock = lock_over(&store, 1);
		let guard =
			lock.acquire_lock("k", Duration::seconds(1)).await.expect("Acquire should succeed.");

		tokio::time::sleep(StdDuration::from_millis(1_500)).await;

		assert!(
			lock.try_acquire("k", Duration::seconds(1))
				.await
				.expect("Contender attempt should run.")
				.is_none()
		);
		let holder = lock.holder("k").await.expect("Holder lookup should succeed.");

		assert_eq!(holder.map(|record| record.owner), Some(guard.owner().to_owned()));

		guard.release().await.expect("Release should succeed.");

		assert_eq!(store.get("k").await.expect("Get should succeed."), None);
	}

	#[tokio::test]
	async fn zero_wait_makes_a_single_attempt() {
		let store = Arc::new(MemoryStore::default());
		let lock = lock_over(&store, 50);
		let _held =
			lock.acquire_lock("k", Duration::seconds(30)).await.expect("Acquire should succeed.");
		let err = lock
			.acquire_within("k", Duration::seconds(30), StdDuration::ZERO)
			.await
			.expect_err("A held lock should not be acquired.");

		assert!(matches!(err, Error::LockAcquisition { attempts: 1, .. }));
	}
}
