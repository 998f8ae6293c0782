//! Fixtures shared by the integration suites.

#![allow(dead_code)]

// std
use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration as StdDuration,
};
// crates.io
use credential_broker::{
	auth::{AuthMode, Credential, Secret},
	config::BrokerConfig,
	issuer::{CredentialIssuer, IssuedToken, IssuerFuture},
	manager::TokenManager,
	store::{MemoryStore, SharedStore},
};
use time::Duration;

/// Issuer that counts calls and optionally stalls each issuance.
#[derive(Debug, Default)]
pub struct CountingIssuer {
	issued: AtomicUsize,
	closed: AtomicUsize,
	delay: Option<StdDuration>,
	expires_in: Option<Duration>,
}
impl CountingIssuer {
	pub fn slow(delay: StdDuration) -> Self {
		Self { delay: Some(delay), ..Default::default() }
	}

	pub fn expiring_in(expires_in: Duration) -> Self {
		Self { expires_in: Some(expires_in), ..Default::default() }
	}

	pub fn issued(&self) -> usize {
		self.issued.load(Ordering::SeqCst)
	}

	pub fn closed(&self) -> usize {
		self.closed.load(Ordering::SeqCst)
	}
}
impl CredentialIssuer for CountingIssuer {
	fn issue<'a>(
		&'a self,
		mode: AuthMode,
		_credential: &'a Credential,
	) -> IssuerFuture<'a, IssuedToken> {
		Box::pin(async move {
			if let Some(delay) = self.delay {
				tokio::time::sleep(delay).await;
			}

			let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;

			Ok(IssuedToken::new(format!("{mode}-{n}"), self.expires_in))
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

pub fn credential() -> Credential {
	Credential::builder("client-id", "client-secret")
		.user("agent", "hunter2")
		.pcc("X1Y2")
		.environment("cert")
		.build()
}

/// No jitter, millisecond backoff, and fast lock polling.
pub fn fast_config() -> BrokerConfig {
	let mut config = BrokerConfig::default();

	config.retry.initial_delay_ms = 1;
	config.retry.max_delay_ms = 5;
	config.retry.jitter = false;
	config.lock.retry_interval_ms = 2;

	config
}

/// Builds a manager for [`credential`] over an existing store.
pub fn manager(
	store: &Arc<MemoryStore>,
	issuer: Arc<dyn CredentialIssuer>,
	config: BrokerConfig,
) -> TokenManager {
	let store: Arc<dyn SharedStore> = store.clone();

	TokenManager::new(store, issuer, credential(), config)
		.expect("Token manager should build from a valid config.")
}
