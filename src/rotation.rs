//! Two-generation validity window for rotated credentials.
//!
//! After a refresh the previous token stays valid alongside the new one so requests already
//! in flight with the old value are not rejected. Only fingerprints are persisted; the list
//! is updated with compare-and-swap so concurrent rotations never lose an entry.

// self
use crate::{
	_prelude::*,
	auth::{AuthMode, Secret, Token},
	store::{self, SharedStore, StoreError},
};

/// Number of generations accepted at any time: the current one and its predecessor.
pub const RETAINED_GENERATIONS: usize = 2;

const MAX_CAS_ATTEMPTS: u32 = 16;

/// Persisted fingerprint of one token generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationEntry {
	/// Generation number assigned at issuance.
	pub generation: u64,
	/// Base64url SHA-256 digest of the token value.
	pub fingerprint: String,
}
impl GenerationEntry {
	fn of(token: &Token) -> Self {
		Self { generation: token.generation, fingerprint: token.value.fingerprint() }
	}
}

/// Tracks which token generations are currently accepted for each mode.
#[derive(Clone)]
pub struct TokenRotator {
	store: Arc<dyn SharedStore>,
	namespace: String,
}
impl TokenRotator {
	/// Creates a rotator whose entries live under `namespace`.
	pub fn new(store: Arc<dyn SharedStore>, namespace: impl Into<String>) -> Self {
		Self { store, namespace: namespace.into() }
	}

	/// Records `new` as the current generation, demoting the previous one.
	///
	/// When no history exists yet and `old` is provided, `old` is seeded first so it stays
	/// valid as the predecessor.
	pub async fn rotate_token(
		&self,
		mode: AuthMode,
		old: Option<&Token>,
		new: &Token,
	) -> Result<()> {
		let key = self.key(mode);

		for _ in 0..MAX_CAS_ATTEMPTS {
			let current_raw = self.store.get(&key).await?;
			let mut entries = match &current_raw {
				Some(raw) => decode(&key, raw)?,
				None => Vec::new(),
			};

			if entries.is_empty()
				&& let Some(old) = old
			{
				entries.push(GenerationEntry::of(old));
			}

			let fresh = GenerationEntry::of(new);

			entries.retain(|entry| entry.fingerprint != fresh.fingerprint);
			entries.insert(0, fresh);
			entries.truncate(RETAINED_GENERATIONS);

			let stored = store::swap_json(
				self.store.as_ref(),
				&key,
				current_raw.as_deref(),
				&entries,
				None,
			)
			.await?;

			if stored {
				tracing::debug!(%mode, generation = new.generation, "token rotated");

				return Ok(());
			}
		}

		tracing::warn!(%mode, attempts = MAX_CAS_ATTEMPTS, "rotation list kept changing");

		Err(StoreError::Conflict { key }.into())
	}

	/// Returns `true` if `value` matches the current or previous generation for `mode`.
	pub async fn is_valid_token(&self, mode: AuthMode, value: &str) -> Result<bool> {
		let fingerprint = Secret::new(value).fingerprint();

		Ok(self.generations(mode).await?.iter().any(|entry| entry.fingerprint == fingerprint))
	}

	/// Accepted generations for `mode`, newest first.
	pub async fn generations(&self, mode: AuthMode) -> Result<Vec<GenerationEntry>> {
		let key = self.key(mode);

		match self.store.get(&key).await? {
			Some(raw) => Ok(decode(&key, &raw)?),
			None => Ok(Vec::new()),
		}
	}

	/// Forgets every generation for `mode`.
	pub async fn cleanup(&self, mode: AuthMode) -> Result<()> {
		self.store.delete(&self.key(mode)).await?;

		Ok(())
	}

	fn key(&self, mode: AuthMode) -> String {
		format!("{}:rotation:{mode}", self.namespace)
	}
}
impl Debug for TokenRotator {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenRotator").field("namespace", &self.namespace).finish()
	}
}

fn decode(key: &str, raw: &str) -> Result<Vec<GenerationEntry>, StoreError> {
	serde_json::from_str(raw).map_err(|e| StoreError::decode(key, e))
}
