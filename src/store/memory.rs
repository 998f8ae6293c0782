//! Thread-safe in-memory [`SharedStore`] implementation for tests and single-host deployments.

// self
use crate::{
	_prelude::*,
	store::{CompareAndSwapOutcome, SharedStore, StoreError, StoreFuture},
};

type StoreMap = Arc<RwLock<HashMap<String, Entry>>>;

#[derive(Clone, Debug)]
struct Entry {
	value: String,
	expires_at: Option<OffsetDateTime>,
}
impl Entry {
	fn new(value: String, ttl: Option<Duration>, now: OffsetDateTime) -> Self {
		Self { value, expires_at: ttl.map(|ttl| now + ttl) }
	}

	fn is_live_at(&self, now: OffsetDateTime) -> bool {
		self.expires_at.is_none_or(|at| now < at)
	}
}

/// Storage backend that keeps entries in-process, honoring TTLs lazily on access.
///
/// Clones share the same map, so handing clones to several managers simulates several
/// processes coordinating through one store.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore(StoreMap);
impl MemoryStore {
	/// Number of live entries.
	pub fn len(&self) -> usize {
		let now = OffsetDateTime::now_utc();

		self.0.read().values().filter(|entry| entry.is_live_at(now)).count()
	}

	/// Returns `true` if the store holds no live entries.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn get_now(map: &StoreMap, key: &str) -> Option<String> {
		let now = OffsetDateTime::now_utc();

		map.read().get(key).filter(|entry| entry.is_live_at(now)).map(|entry| entry.value.clone())
	}

	fn add_now(map: &StoreMap, key: &str, value: String, ttl: Option<Duration>) -> bool {
		let now = OffsetDateTime::now_utc();
		let mut guard = map.write();

		if guard.get(key).is_some_and(|entry| entry.is_live_at(now)) {
			return false;
		}

		guard.insert(key.to_owned(), Entry::new(value, ttl, now));

		true
	}

	fn increment_now(map: &StoreMap, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError> {
		let now = OffsetDateTime::now_utc();
		let mut guard = map.write();
		let next = match guard.get_mut(key).filter(|entry| entry.is_live_at(now)) {
			Some(entry) => {
				let current = entry.value.parse::<i64>().map_err(|e| StoreError::Serialization {
					message: format!("Counter `{key}` is not an integer: {e}"),
				})?;
				let next = current.saturating_add(1);

				entry.value = next.to_string();

				next
			},
			None => {
				guard.insert(key.to_owned(), Entry::new("1".into(), ttl, now));

				1
			},
		};

		Ok(next)
	}

	fn cas_now(
		map: &StoreMap,
		key: &str,
		expected: &str,
		replacement: Option<(String, Option<Duration>)>,
	) -> CompareAndSwapOutcome {
		let now = OffsetDateTime::now_utc();
		let mut guard = map.write();
		let outcome = match guard.get(key).filter(|entry| entry.is_live_at(now)) {
			Some(existing) if existing.value == expected => CompareAndSwapOutcome::Updated,
			Some(_) => CompareAndSwapOutcome::Mismatch,
			None => CompareAndSwapOutcome::Missing,
		};

		if matches!(outcome, CompareAndSwapOutcome::Updated) {
			match replacement {
				Some((value, ttl)) => {
					guard.insert(key.to_owned(), Entry::new(value, ttl, now));
				},
				None => {
					guard.remove(key);
				},
			}
		}

		outcome
	}
}
impl SharedStore for MemoryStore {
	fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
		Box::pin(async move { Ok(Self::get_now(&self.0, key)) })
	}

	fn put<'a>(
		&'a self,
		key: &'a str,
		value: String,
		ttl: Option<Duration>,
	) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			self.0.write().insert(key.to_owned(), Entry::new(value, ttl, OffsetDateTime::now_utc()));

			Ok(())
		})
	}

	fn add_if_absent<'a>(
		&'a self,
		key: &'a str,
		value: String,
		ttl: Option<Duration>,
	) -> StoreFuture<'a, bool> {
		Box::pin(async move { Ok(Self::add_now(&self.0, key, value, ttl)) })
	}

	fn increment<'a>(&'a self, key: &'a str, ttl: Option<Duration>) -> StoreFuture<'a, i64> {
		Box::pin(async move { Self::increment_now(&self.0, key, ttl) })
	}

	fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			self.0.write().remove(key);

			Ok(())
		})
	}

	fn compare_and_swap<'a>(
		&'a self,
		key: &'a str,
		expected: &'a str,
		replacement: String,
		ttl: Option<Duration>,
	) -> StoreFuture<'a, CompareAndSwapOutcome> {
		Box::pin(async move { Ok(Self::cas_now(&self.0, key, expected, Some((replacement, ttl)))) })
	}

	fn compare_and_delete<'a>(
		&'a self,
		key: &'a str,
		expected: &'a str,
	) -> StoreFuture<'a, CompareAndSwapOutcome> {
		Box::pin(async move { Ok(Self::cas_now(&self.0, key, expected, None)) })
	}
}
