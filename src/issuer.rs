//! Remote credential issuance boundary.
//!
//! [`CredentialIssuer`] is the only seam between the broker and the upstream API. The
//! `reqwest` feature provides [`HttpIssuer`], which speaks the REST password grant and the
//! SOAP token/session handshakes; tests and embedders can supply their own implementation.

#[cfg(feature = "reqwest")] mod rest;
#[cfg(feature = "reqwest")] mod soap;

// self
use crate::{
	_prelude::*,
	auth::{AuthMode, Credential, Secret},
};
#[cfg(feature = "reqwest")]
use crate::{error::ConfigError, http::ReqwestHttpClient};

/// Boxed future returned by [`CredentialIssuer`] operations.
pub type IssuerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a + Send>>;

/// Raw issuance result before the broker stamps lifetime and generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
	/// Token or session material.
	pub value: Secret,
	/// Lifetime reported by the issuer, when it reports one.
	pub expires_in: Option<Duration>,
}
impl IssuedToken {
	/// Creates an issuance result.
	pub fn new(value: impl Into<Secret>, expires_in: Option<Duration>) -> Self {
		Self { value: value.into(), expires_in }
	}
}

/// Upstream API capable of minting credentials for every [`AuthMode`].
pub trait CredentialIssuer
where
	Self: Send + Sync,
{
	/// Performs one issuance call for `mode`.
	///
	/// For [`AuthMode::SoapSession`] the result is a fresh stateful session.
	fn issue<'a>(&'a self, mode: AuthMode, credential: &'a Credential)
	-> IssuerFuture<'a, IssuedToken>;

	/// Closes a stateful session previously returned by [`issue`](Self::issue).
	fn close_session<'a>(
		&'a self,
		credential: &'a Credential,
		session: &'a Secret,
	) -> IssuerFuture<'a, ()>;
}

/// Upstream endpoints used by [`HttpIssuer`].
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerEndpoints {
	/// REST token endpoint (`POST /v2/auth/token` or equivalent).
	pub rest_token_url: Url,
	/// SOAP service endpoint.
	pub soap_url: Url,
}
#[cfg(feature = "reqwest")]
impl IssuerEndpoints {
	/// Parses both endpoints.
	pub fn parse(rest_token_url: &str, soap_url: &str) -> Result<Self> {
		let parse = |raw: &str| {
			Url::parse(raw).map_err(|source| Error::from(ConfigError::InvalidEndpoint { source }))
		};

		Ok(Self { rest_token_url: parse(rest_token_url)?, soap_url: parse(soap_url)? })
	}
}

/// HTTP implementation of [`CredentialIssuer`].
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug)]
pub struct HttpIssuer {
	http: ReqwestHttpClient,
	endpoints: IssuerEndpoints,
	rest: rest::RestClient,
}
#[cfg(feature = "reqwest")]
impl HttpIssuer {
	/// Builds an issuer with a default redirect-refusing reqwest client.
	pub fn new(endpoints: IssuerEndpoints, credential: &Credential) -> Result<Self> {
		Self::with_client(ReqwestHttpClient::new()?, endpoints, credential)
	}

	/// Builds an issuer over a caller-supplied client.
	pub fn with_client(
		http: ReqwestHttpClient,
		endpoints: IssuerEndpoints,
		credential: &Credential,
	) -> Result<Self> {
		let rest = rest::client(&endpoints.rest_token_url, credential)?;

		Ok(Self { http, endpoints, rest })
	}

	/// Endpoints this issuer talks to.
	pub fn endpoints(&self) -> &IssuerEndpoints {
		&self.endpoints
	}
}
#[cfg(feature = "reqwest")]
impl CredentialIssuer for HttpIssuer {
	fn issue<'a>(
		&'a self,
		mode: AuthMode,
		credential: &'a Credential,
	) -> IssuerFuture<'a, IssuedToken> {
		Box::pin(async move {
			match mode {
				AuthMode::Rest => rest::exchange_password(&self.rest, &self.http, credential).await,
				AuthMode::SoapStateless | AuthMode::SoapSession =>
					soap::create(&self.http, &self.endpoints.soap_url, mode, credential).await,
			}
		})
	}

	fn close_session<'a>(
		&'a self,
		credential: &'a Credential,
		session: &'a Secret,
	) -> IssuerFuture<'a, ()> {
		Box::pin(soap::close(&self.http, &self.endpoints.soap_url, credential, session))
	}
}
