//! Broker-level error types shared by tokens, sessions, locks, quotas, and stores.

// self
use crate::{_prelude::*, auth::AuthMode, rate_limit::RateLimitExceeded};

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical broker error exposed by public APIs.
///
/// Recoverable conditions ([`Error::RateLimited`], [`Error::PoolExhausted`]) are plain values
/// callers are expected to branch on; they are never retried internally.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Storage-layer failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Temporary upstream failure; retry with backoff.
	#[error(transparent)]
	Transient(#[from] TransientError),
	/// Transport failure (DNS, TCP, TLS, retryable HTTP status).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Local quota exhausted for the requested key.
	#[error(transparent)]
	RateLimited(#[from] RateLimitExceeded),

	/// Credential was rejected or has expired for the given mode.
	#[error("Authentication failed for the {mode} mode: {reason}.")]
	Authentication {
		/// Mode whose issuance failed.
		mode: AuthMode,
		/// Issuer- or broker-supplied reason string.
		reason: String,
	},
	/// Credential is valid but lacks the scope or office access for the request.
	#[error("Authorization failed: {reason}.")]
	Authorization {
		/// Issuer- or broker-supplied reason string.
		reason: String,
	},
	/// Session pool is at capacity with every lease in use.
	#[error("Session pool exhausted: all {size} sessions are in use.")]
	PoolExhausted {
		/// Configured pool size.
		size: usize,
	},
	/// Distributed lock could not be acquired in time.
	#[error("Failed to acquire lock `{key}` after {attempts} attempts.")]
	LockAcquisition {
		/// Lock key.
		key: String,
		/// Number of acquisition attempts made.
		attempts: u32,
	},
	/// Retryable failures persisted past the configured attempt budget.
	#[error("Retries exhausted for {context} after {attempts} attempts.")]
	RetriesExhausted {
		/// Operation label supplied by the caller.
		context: String,
		/// Number of attempts made.
		attempts: u32,
		/// Last failure observed.
		#[source]
		source: Box<Error>,
	},
}
impl Error {
	/// Returns the innermost cause, unwrapping [`Error::RetriesExhausted`].
	pub fn root(&self) -> &Error {
		match self {
			Error::RetriesExhausted { source, .. } => source.root(),
			other => other,
		}
	}

	/// Returns `true` when the (root) cause is an authentication failure.
	pub fn is_authentication(&self) -> bool {
		matches!(self.root(), Error::Authentication { .. })
	}

	/// Upstream or local Retry-After hint carried by the error, if any.
	pub fn retry_after(&self) -> Option<Duration> {
		match self.root() {
			Error::Transient(TransientError::IssuerResponse { retry_after, .. }) => *retry_after,
			Error::Transport(TransportError::Status { retry_after, .. }) => *retry_after,
			Error::RateLimited(exceeded) => Some(exceeded.retry_after_duration()),
			_ => None,
		}
	}
}

/// Configuration and validation failures raised by the broker.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(#[from] oauth2::http::Error),
	/// An issuer endpoint is not a valid URL.
	#[error("Issuer endpoint is invalid.")]
	InvalidEndpoint {
		/// Underlying parsing failure.
		#[source]
		source: oauth2::url::ParseError,
	},
	/// Configuration document could not be parsed.
	#[error("Configuration could not be parsed.")]
	Parse {
		/// Structured parsing failure including the offending path.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},

	/// The refresh threshold would never leave a token outside its refresh window.
	#[error("Refresh threshold for the {mode} mode must be shorter than the token lifetime.")]
	RefreshThresholdTooLarge {
		/// Offending mode.
		mode: AuthMode,
	},
	/// Token lifetime must be positive.
	#[error("Token lifetime for the {mode} mode must be positive.")]
	NonPositiveLifetime {
		/// Offending mode.
		mode: AuthMode,
	},
	/// Session pool size must be at least one.
	#[error("Session pool size must be at least 1.")]
	EmptySessionPool,
	/// Session refresh margin must leave room inside the session lifetime.
	#[error("Session refresh margin must be shorter than the session lifetime.")]
	SessionMarginTooLarge,
	/// Retry policy is unusable.
	#[error("Retry policy is invalid: {reason}.")]
	InvalidRetryPolicy {
		/// Human-readable reason.
		reason: &'static str,
	},
	/// Lock policy is unusable.
	#[error("Lock policy is invalid: {reason}.")]
	InvalidLockPolicy {
		/// Human-readable reason.
		reason: &'static str,
	},
	/// A rate limit rule has a zero limit or window.
	#[error("Rate limit rule `{key}` must have a positive limit and window.")]
	InvalidRateLimitRule {
		/// Rule key (`default`, `category`, or `category.operation`).
		key: String,
	},
	/// Session-mode tokens are leases and cannot back a detached header.
	#[error("The soap_session mode does not expose a detached authorization header.")]
	SessionModeRequiresLease,
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<reqwest::Error> for ConfigError {
	fn from(e: reqwest::Error) -> Self {
		Self::http_client_build(e)
	}
}

/// Temporary failure variants (safe to retry).
#[derive(Debug, ThisError)]
pub enum TransientError {
	/// Issuer returned an unexpected but non-fatal response.
	#[error("Issuer returned an unexpected response: {message}.")]
	IssuerResponse {
		/// Issuer- or broker-supplied message summarizing the failure.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
	/// Issuer responded with malformed JSON that could not be parsed.
	#[error("Issuer returned malformed JSON.")]
	ResponseParse {
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
}

/// Transport-level failures (network, IO, retryable HTTP statuses).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling the issuer.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Issuer answered with a throttling or server-error status.
	#[error("Issuer responded with HTTP status {status}.")]
	Status {
		/// HTTP status code.
		status: u16,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling the issuer.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		Self::network(e)
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn store_error_converts_into_broker_error_with_source() {
		let store_error = crate::store::StoreError::Backend { message: "store unreachable".into() };
		let broker_error: Error = store_error.clone().into();

		assert!(matches!(broker_error, Error::Storage(_)));
		assert!(broker_error.to_string().contains("store unreachable"));

		let source = StdError::source(&broker_error)
			.expect("Broker error should expose the original store error as its source.");

		assert_eq!(source.to_string(), store_error.to_string());
	}

	#[test]
	fn root_and_retry_after_see_through_exhausted_retries() {
		let cause = Error::Transport(TransportError::Status {
			status: 503,
			retry_after: Some(Duration::seconds(7)),
		});
		let wrapped = Error::RetriesExhausted {
			context: "refresh_token:rest".into(),
			attempts: 3,
			source: Box::new(cause),
		};

		assert!(matches!(wrapped.root(), Error::Transport(TransportError::Status { status: 503, .. })));
		assert_eq!(wrapped.retry_after(), Some(Duration::seconds(7)));
		assert!(StdError::source(&wrapped).is_some());
	}

	#[test]
	fn authentication_is_detected_through_wrapper() {
		let wrapped = Error::RetriesExhausted {
			context: "refresh_token:soap_stateless".into(),
			attempts: 2,
			source: Box::new(Error::Authentication {
				mode: AuthMode::SoapStateless,
				reason: "bad password".into(),
			}),
		};

		assert!(wrapped.is_authentication());
		assert!(!Error::PoolExhausted { size: 2 }.is_authentication());
	}
}
