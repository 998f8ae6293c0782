//! Shared key-value store contract used as the only cross-process coordination substrate.
//!
//! Every component receives an `Arc<dyn SharedStore>` at construction. Correctness relies
//! exclusively on the atomic primitives below: `add_if_absent`, `increment`, `put` with a
//! TTL, and the compare-and-swap pair. Components never perform an unguarded
//! read-modify-write on shared keys.

pub mod memory;

pub use memory::MemoryStore;

// self
use crate::_prelude::*;

/// Boxed future returned by [`SharedStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Key-value backend shared by every process that uses the broker.
///
/// Values are opaque strings (components serialize JSON). A `ttl` of `None` keeps the entry
/// until it is deleted or overwritten.
pub trait SharedStore
where
	Self: Send + Sync,
{
	/// Fetches the live value stored under `key`.
	fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

	/// Stores `value` under `key`, replacing any previous value.
	fn put<'a>(&'a self, key: &'a str, value: String, ttl: Option<Duration>)
	-> StoreFuture<'a, ()>;

	/// Atomically stores `value` only if no live entry exists; returns whether it was stored.
	fn add_if_absent<'a>(
		&'a self,
		key: &'a str,
		value: String,
		ttl: Option<Duration>,
	) -> StoreFuture<'a, bool>;

	/// Atomically increments the integer counter under `key` and returns the new value.
	///
	/// A missing or expired counter starts from zero and receives `ttl`; an existing counter
	/// keeps its original expiry.
	fn increment<'a>(&'a self, key: &'a str, ttl: Option<Duration>) -> StoreFuture<'a, i64>;

	/// Removes `key` if present.
	fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

	/// Atomically replaces the value under `key` if it still equals `expected`.
	fn compare_and_swap<'a>(
		&'a self,
		key: &'a str,
		expected: &'a str,
		replacement: String,
		ttl: Option<Duration>,
	) -> StoreFuture<'a, CompareAndSwapOutcome>;

	/// Atomically deletes `key` if its value still equals `expected`.
	fn compare_and_delete<'a>(
		&'a self,
		key: &'a str,
		expected: &'a str,
	) -> StoreFuture<'a, CompareAndSwapOutcome>;
}

/// Result of a compare-and-swap style attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareAndSwapOutcome {
	/// The value matched and the entry was replaced or removed.
	Updated,
	/// The entry exists but holds a different value.
	Mismatch,
	/// No live entry exists under the key.
	Missing,
}

/// Error type produced by [`SharedStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend or by components encoding values.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
	/// A fenced write found the entry changed since it was read.
	#[error("Entry `{key}` changed concurrently.")]
	Conflict {
		/// Key whose value no longer matched.
		key: String,
	},
}
impl StoreError {
	pub(crate) fn encode(key: &str, err: serde_json::Error) -> Self {
		Self::Serialization { message: format!("Failed to encode `{key}`: {err}") }
	}

	pub(crate) fn decode(key: &str, err: serde_json::Error) -> Self {
		Self::Serialization { message: format!("Failed to decode `{key}`: {err}") }
	}
}

/// Reads and decodes a JSON value stored under `key`.
pub(crate) async fn get_json<T>(store: &dyn SharedStore, key: &str) -> Result<Option<T>>
where
	T: serde::de::DeserializeOwned,
{
	match store.get(key).await? {
		Some(raw) =>
			Ok(Some(serde_json::from_str(&raw).map_err(|err| StoreError::decode(key, err))?)),
		None => Ok(None),
	}
}

/// Like [`get_json`], but also returns the raw value so a later write can be fenced on it.
pub(crate) async fn get_json_fenced<T>(
	store: &dyn SharedStore,
	key: &str,
) -> Result<Option<(String, T)>>
where
	T: serde::de::DeserializeOwned,
{
	match store.get(key).await? {
		Some(raw) => {
			let value = serde_json::from_str(&raw).map_err(|err| StoreError::decode(key, err))?;

			Ok(Some((raw, value)))
		},
		None => Ok(None),
	}
}

/// Stores `value` only if `key` still holds `expected`.
///
/// `None` means the entry was absent when read. An entry that expired since the read counts as
/// unchanged. Returns `false` when another writer got there first.
pub(crate) async fn swap_json<T>(
	store: &dyn SharedStore,
	key: &str,
	expected: Option<&str>,
	value: &T,
	ttl: Option<Duration>,
) -> Result<bool>
where
	T: ?Sized + Serialize + Sync,
{
	let raw = serde_json::to_string(value).map_err(|err| StoreError::encode(key, err))?;
	let Some(expected) = expected else {
		return Ok(store.add_if_absent(key, raw, ttl).await?);
	};

	match store.compare_and_swap(key, expected, raw.clone(), ttl).await? {
		CompareAndSwapOutcome::Updated => Ok(true),
		CompareAndSwapOutcome::Mismatch => Ok(false),
		CompareAndSwapOutcome::Missing => Ok(store.add_if_absent(key, raw, ttl).await?),
	}
}
