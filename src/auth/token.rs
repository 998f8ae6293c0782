//! Issued token model and lifecycle helpers.

// self
use crate::{
	_prelude::*,
	auth::{mode::AuthMode, secret::Secret},
};

/// Lifecycle status of a token at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStatus {
	/// Token is valid and outside the refresh window.
	Valid,
	/// Token is still valid but inside the proactive refresh window.
	RefreshDue,
	/// Token reached its expiry instant.
	Expired,
}

/// Credential generation produced by a successful refresh.
///
/// Tokens are superseded, never mutated. Validity for in-flight callers is decided by
/// the rotation window, not by the token itself.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
	/// Token material; callers must avoid logging it.
	pub value: Secret,
	/// Mode that produced the token.
	pub mode: AuthMode,
	/// Issued-at instant.
	pub issued_at: OffsetDateTime,
	/// Expiry instant.
	pub expires_at: OffsetDateTime,
	/// Monotonic generation number for the mode.
	pub generation: u64,
}
impl Token {
	/// Creates a token that expires `lifetime` after `issued_at`.
	pub fn new(
		mode: AuthMode,
		value: impl Into<Secret>,
		issued_at: OffsetDateTime,
		lifetime: Duration,
		generation: u64,
	) -> Self {
		Self { value: value.into(), mode, issued_at, expires_at: issued_at + lifetime, generation }
	}

	/// Computes the status at `instant` given the mode's refresh threshold.
	pub fn status_at(&self, instant: OffsetDateTime, refresh_threshold: Duration) -> TokenStatus {
		if instant >= self.expires_at {
			return TokenStatus::Expired;
		}
		if instant >= self.expires_at - refresh_threshold {
			return TokenStatus::RefreshDue;
		}

		TokenStatus::Valid
	}

	/// Returns `true` if the token has expired at `instant`.
	pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
		instant >= self.expires_at
	}

	/// Returns `true` if the token can be served without a refresh at `instant`.
	pub fn is_fresh_at(&self, instant: OffsetDateTime, refresh_threshold: Duration) -> bool {
		matches!(self.status_at(instant, refresh_threshold), TokenStatus::Valid)
	}

	/// Remaining lifetime at `instant`, clamped at zero.
	pub fn remaining_at(&self, instant: OffsetDateTime) -> Duration {
		let remaining = self.expires_at - instant;

		if remaining.is_negative() { Duration::ZERO } else { remaining }
	}
}
impl Debug for Token {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Token")
			.field("value", &"<redacted>")
			.field("mode", &self.mode)
			.field("issued_at", &self.issued_at)
			.field("expires_at", &self.expires_at)
			.field("generation", &self.generation)
			.finish()
	}
}
