//! REST password grant through the `oauth2` crate.

// crates.io
use oauth2::{
	ClientId, ClientSecret, EndpointNotSet, EndpointSet, HttpClientError, RequestTokenError,
	ResourceOwnerPassword, ResourceOwnerUsername, TokenResponse, TokenUrl,
	basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType, BasicRequestTokenError},
};
// self
use crate::{
	_prelude::*,
	auth::{AuthMode, Credential},
	error::{ConfigError, TransientError, TransportError},
	http::{ReqwestHttpClient, ResponseMetadata, ResponseMetadataSlot},
	issuer::IssuedToken,
};

pub(super) type RestClient =
	BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

pub(super) fn client(token_url: &Url, credential: &Credential) -> Result<RestClient> {
	let token_url = TokenUrl::new(token_url.to_string())
		.map_err(|source| ConfigError::InvalidEndpoint { source })?;

	Ok(BasicClient::new(ClientId::new(credential.client_id.clone()))
		.set_client_secret(ClientSecret::new(credential.client_secret.expose().to_owned()))
		.set_token_uri(token_url))
}

pub(super) async fn exchange_password(
	client: &RestClient,
	http: &ReqwestHttpClient,
	credential: &Credential,
) -> Result<IssuedToken> {
	let meta = ResponseMetadataSlot::default();
	let handle = http.instrumented(meta.clone());
	let username = ResourceOwnerUsername::new(credential.username.clone());
	let password = ResourceOwnerPassword::new(credential.password.expose().to_owned());
	let response = client
		.exchange_password(&username, &password)
		.request_async(&handle)
		.await
		.map_err(|err| map_request_error(meta.take(), err))?;
	let expires_in = response
		.expires_in()
		.and_then(|lifetime| Duration::try_from(lifetime).ok())
		.filter(|lifetime| lifetime.is_positive());

	Ok(IssuedToken::new(response.access_token().secret().to_owned(), expires_in))
}

fn map_request_error(
	meta: Option<ResponseMetadata>,
	err: BasicRequestTokenError<HttpClientError<ReqwestError>>,
) -> Error {
	let status = meta.as_ref().and_then(|meta| meta.status);
	let retry_after = meta.as_ref().and_then(|meta| meta.retry_after);

	// Throttling and server faults are transport conditions whatever the body says.
	if let Some(code) = status.filter(|code| *code == 429 || *code >= 500) {
		return TransportError::Status { status: code, retry_after }.into();
	}

	match err {
		RequestTokenError::ServerResponse(response) => map_server_response(&response),
		RequestTokenError::Request(HttpClientError::Reqwest(inner)) =>
			if inner.is_builder() {
				ConfigError::from(*inner).into()
			} else {
				TransportError::from(*inner).into()
			},
		RequestTokenError::Request(HttpClientError::Http(inner)) => ConfigError::from(inner).into(),
		RequestTokenError::Request(HttpClientError::Io(inner)) => TransportError::Io(inner).into(),
		RequestTokenError::Request(other) => TransientError::IssuerResponse {
			message: format!("HTTP client failed while calling the token endpoint: {other}"),
			status,
			retry_after,
		}
		.into(),
		RequestTokenError::Parse(source, _body) =>
			TransientError::ResponseParse { source, status }.into(),
		RequestTokenError::Other(message) =>
			TransientError::IssuerResponse { message, status, retry_after }.into(),
	}
}

fn map_server_response(response: &BasicErrorResponse) -> Error {
	let reason = match response.error_description() {
		Some(description) => format!("{}: {description}", response.error().as_ref()),
		None => response.error().as_ref().to_owned(),
	};

	match response.error() {
		BasicErrorResponseType::InvalidScope => Error::Authorization { reason },
		BasicErrorResponseType::Extension(code) if code == "temporarily_unavailable" =>
			TransientError::IssuerResponse { message: reason, status: None, retry_after: None }
				.into(),
		_ => Error::Authentication { mode: AuthMode::Rest, reason },
	}
}
