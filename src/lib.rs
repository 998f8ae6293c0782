//! Client-side reliability layer that lets many workers share a handful of scarce, expiring
//! credentials and stateful sessions without tripping upstream quotas or re-authenticating on
//! every call.
//!
//! The crate is organized leaves first:
//!
//! - [`store`] defines the [`SharedStore`](store::SharedStore) coordination substrate.
//! - [`lock`] builds a best-effort distributed mutex on top of add-if-absent.
//! - [`retry`] runs fallible operations with classified, jittered exponential backoff.
//! - [`rate_limit`] tracks hierarchical fixed-window quotas.
//! - [`rotation`] keeps the two newest credential generations valid.
//! - [`session`] pools stateful upstream sessions.
//! - [`manager`] ties everything together behind [`TokenManager`](manager::TokenManager).

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod config;
pub mod error;
#[cfg(feature = "reqwest")] pub mod http;
pub mod issuer;
pub mod lock;
pub mod manager;
pub mod obs;
pub mod rate_limit;
pub mod retry;
pub mod rotation;
pub mod session;
pub mod store;
#[cfg(test)]
pub mod _preludet {
	//! Convenience re-exports and fixtures shared by unit tests.

	pub use crate::_prelude::*;

	// std
	use std::{
		collections::VecDeque,
		sync::atomic::{AtomicUsize, Ordering},
	};
	// self
	use crate::{
		auth::{AuthMode, Credential, Secret},
		config::BrokerConfig,
		issuer::{CredentialIssuer, IssuedToken, IssuerFuture},
		manager::TokenManager,
		store::{MemoryStore, SharedStore},
	};

	/// Scripted issuer that hands out sequential tokens and replays queued failures first.
	#[derive(Debug, Default)]
	pub struct ScriptedIssuer {
		issued: AtomicUsize,
		closed: AtomicUsize,
		failures: Mutex<VecDeque<Error>>,
		expires_in: Option<Duration>,
		delay: Option<StdDuration>,
	}
	impl ScriptedIssuer {
		/// Builds an issuer that stalls every issuance for `delay`.
		pub fn slow(delay: StdDuration) -> Self {
			Self { delay: Some(delay), ..Default::default() }
		}

		/// Builds an issuer whose tokens expire after `expires_in`.
		pub fn expiring_in(expires_in: Duration) -> Self {
			Self { expires_in: Some(expires_in), ..Default::default() }
		}

		/// Queues an error returned by the next issuance attempt.
		pub fn fail_next(&self, error: Error) {
			self.failures.lock().push_back(error);
		}

		/// Number of successful issuance calls.
		pub fn issued(&self) -> usize {
			self.issued.load(Ordering::SeqCst)
		}

		/// Number of closed sessions.
		pub fn closed(&self) -> usize {
			self.closed.load(Ordering::SeqCst)
		}
	}
	impl CredentialIssuer for ScriptedIssuer {
		fn issue<'a>(
			&'a self,
			mode: AuthMode,
			_credential: &'a Credential,
		) -> IssuerFuture<'a, IssuedToken> {
			Box::pin(async move {
				if let Some(delay) = self.delay {
					tokio::time::sleep(delay).await;
				}
				if let Some(err) = self.failures.lock().pop_front() {
					return Err(err);
				}

				let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;

				Ok(IssuedToken::new(format!("{mode}-token-{n}"), self.expires_in))
			})
		}

		fn close_session<'a>(
			&'a self,
			_credential: &'a Credential,
			_session: &'a Secret,
		) -> IssuerFuture<'a, ()> {
			Box::pin(async move {
				self.closed.fetch_add(1, Ordering::SeqCst);

				Ok(())
			})
		}
	}

	/// Credential fixture shared by unit tests.
	pub fn test_credential() -> Credential {
		Credential::builder("client-id", "client-secret")
			.user("user-1", "pass-1")
			.pcc("PCC1")
			.environment("cert")
			.build()
	}

	/// Config tuned for fast tests (no jitter, millisecond backoff and lock polling).
	pub fn fast_config() -> BrokerConfig {
		let mut config = BrokerConfig::default();

		config.retry.initial_delay_ms = 1;
		config.retry.max_delay_ms = 5;
		config.retry.jitter = false;
		config.lock.retry_interval_ms = 2;

		config
	}

	/// Builds a manager over a fresh memory store and the provided issuer.
	pub fn build_test_manager(
		issuer: Arc<ScriptedIssuer>,
		config: BrokerConfig,
	) -> (TokenManager, Arc<MemoryStore>) {
		let store_backend = Arc::new(MemoryStore::default());
		let store: Arc<dyn SharedStore> = store_backend.clone();
		let manager = TokenManager::new(store, issuer, test_credential(), config)
			.expect("Failed to build test token manager.");

		(manager, store_backend)
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
		time::Duration as StdDuration,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(not(feature = "reqwest"))] use oauth2 as _;
#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _};
