//! SOAP token, session-create, and session-close handshakes.
//!
//! Envelopes are small and fixed, so they are rendered from templates with escaped
//! interpolation; responses are scanned for the `BinarySecurityToken` element or a `Fault`.

// crates.io
use reqwest::header::CONTENT_TYPE;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;
// self
use crate::{
	_prelude::*,
	auth::{AuthMode, Credential, Secret},
	error::{TransientError, TransportError},
	http::{self, ReqwestHttpClient},
	issuer::IssuedToken,
};

const SOAP_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// Upstream actions used by the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
	TokenCreate,
	SessionCreate,
	SessionClose,
}
impl Action {
	fn name(self) -> &'static str {
		match self {
			Self::TokenCreate => "TokenCreateRQ",
			Self::SessionCreate => "SessionCreateRQ",
			Self::SessionClose => "SessionCloseRQ",
		}
	}

	fn mode(self) -> AuthMode {
		match self {
			Self::TokenCreate => AuthMode::SoapStateless,
			Self::SessionCreate | Self::SessionClose => AuthMode::SoapSession,
		}
	}
}

pub(super) async fn create(
	http: &ReqwestHttpClient,
	endpoint: &Url,
	mode: AuthMode,
	credential: &Credential,
) -> Result<IssuedToken> {
	let action = match mode {
		AuthMode::SoapSession => Action::SessionCreate,
		_ => Action::TokenCreate,
	};
	let request =
		envelope(action, credential, &username_token(credential), &body(action, credential));
	let response = post(http, endpoint, action, request).await?;
	let token = element_text(&response, "BinarySecurityToken")
		.filter(|token| !token.is_empty())
		.ok_or_else(|| TransientError::IssuerResponse {
			message: format!("{} response carried no BinarySecurityToken", action.name()),
			status: None,
			retry_after: None,
		})?;

	tracing::debug!(action = action.name(), "soap credential issued");

	Ok(IssuedToken::new(token, None))
}

pub(super) async fn close(
	http: &ReqwestHttpClient,
	endpoint: &Url,
	credential: &Credential,
	session: &Secret,
) -> Result<()> {
	let action = Action::SessionClose;
	let security = format!(
		concat!(
			"<wsse:BinarySecurityToken valueType=\"String\" EncodingType=\"wsse:Base64Binary\">",
			"{}",
			"</wsse:BinarySecurityToken>",
		),
		escape(session.expose())
	);
	let request = envelope(action, credential, &security, &body(action, credential));

	post(http, endpoint, action, request).await?;

	Ok(())
}

async fn post(
	http: &ReqwestHttpClient,
	endpoint: &Url,
	action: Action,
	envelope: String,
) -> Result<String> {
	let response = http
		.post(endpoint.clone())
		.header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
		.header("SOAPAction", action.name())
		.body(envelope)
		.send()
		.await
		.map_err(TransportError::from)?;
	let status = response.status().as_u16();
	let retry_after = http::parse_retry_after(response.headers());
	let text = response.text().await.map_err(TransportError::from)?;

	if let Some(fault) = Fault::parse(&text) {
		return Err(fault.into_error(action, status, retry_after));
	}
	if status == 429 || status >= 500 {
		return Err(TransportError::Status { status, retry_after }.into());
	}
	if !(200..300).contains(&status) {
		return Err(TransientError::IssuerResponse {
			message: format!("{} returned HTTP {status} without a SOAP fault", action.name()),
			status: Some(status),
			retry_after,
		}
		.into());
	}

	Ok(text)
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Fault {
	code: String,
	message: String,
}
impl Fault {
	fn parse(xml: &str) -> Option<Self> {
		element_text(xml, "Fault")?;

		Some(Self {
			code: element_text(xml, "faultcode").unwrap_or_default(),
			message: element_text(xml, "faultstring").unwrap_or_default(),
		})
	}

	fn into_error(self, action: Action, status: u16, retry_after: Option<Duration>) -> Error {
		let code = self.code.to_ascii_lowercase();
		let reason = format!("{} fault {}: {}", action.name(), self.code, self.message);

		if code.contains("authoriz") || code.contains("pcc") || code.contains("permission") {
			return Error::Authorization { reason };
		}
		if code.contains("server") || status == 429 || (status >= 500 && !code.contains("client")) {
			return TransientError::IssuerResponse {
				message: reason,
				status: Some(status),
				retry_after,
			}
			.into();
		}

		Error::Authentication { mode: action.mode(), reason }
	}
}

fn envelope(action: Action, credential: &Credential, security: &str, body: &str) -> String {
	let timestamp = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
	let conversation = Uuid::new_v4();
	let message_id = Uuid::new_v4();

	format!(
		concat!(
			"<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
			"<soap-env:Envelope xmlns:soap-env=\"http://schemas.xmlsoap.org/soap/envelope/\">",
			"<soap-env:Header>",
			"<eb:MessageHeader xmlns:eb=\"http://www.ebxml.org/namespaces/messageHeader\" ",
			"soap-env:mustUnderstand=\"1\" eb:version=\"1.0\">",
			"<eb:From><eb:PartyId>{client_id}</eb:PartyId></eb:From>",
			"<eb:To><eb:PartyId>{environment}</eb:PartyId></eb:To>",
			"<eb:CPAId>{pcc}</eb:CPAId>",
			"<eb:ConversationId>{conversation}</eb:ConversationId>",
			"<eb:Service>{action}</eb:Service>",
			"<eb:Action>{action}</eb:Action>",
			"<eb:MessageData><eb:MessageId>{message_id}</eb:MessageId>",
			"<eb:Timestamp>{timestamp}</eb:Timestamp></eb:MessageData>",
			"</eb:MessageHeader>",
			"<wsse:Security xmlns:wsse=\"http://schemas.xmlsoap.org/ws/2002/12/secext\">",
			"{security}",
			"</wsse:Security>",
			"</soap-env:Header>",
			"<soap-env:Body>{body}</soap-env:Body>",
			"</soap-env:Envelope>",
		),
		client_id = escape(&credential.client_id),
		environment = escape(&credential.environment),
		pcc = escape(&credential.pcc),
		conversation = conversation,
		action = action.name(),
		message_id = message_id,
		timestamp = timestamp,
		security = security,
		body = body,
	)
}

fn username_token(credential: &Credential) -> String {
	format!(
		concat!(
			"<wsse:UsernameToken>",
			"<wsse:Username>{username}</wsse:Username>",
			"<wsse:Password>{password}</wsse:Password>",
			"<Organization>{pcc}</Organization>",
			"<Domain>DEFAULT</Domain>",
			"<ClientId>{client_id}</ClientId>",
			"<ClientSecret>{client_secret}</ClientSecret>",
			"</wsse:UsernameToken>",
		),
		username = escape(&credential.username),
		password = escape(credential.password.expose()),
		pcc = escape(&credential.pcc),
		client_id = escape(&credential.client_id),
		client_secret = escape(credential.client_secret.expose()),
	)
}

fn body(action: Action, credential: &Credential) -> String {
	match action {
		Action::TokenCreate => "<TokenCreateRQ Version=\"1.0.0\"/>".into(),
		Action::SessionCreate | Action::SessionClose => format!(
			"<{name} Version=\"1.0.0\"><POS><Source PseudoCityCode=\"{pcc}\"/></POS></{name}>",
			name = action.name(),
			pcc = escape(&credential.pcc),
		),
	}
}

fn escape(raw: &str) -> String {
	let mut escaped = String::with_capacity(raw.len());

	for c in raw.chars() {
		match c {
			'&' => escaped.push_str("&amp;"),
			'<' => escaped.push_str("&lt;"),
			'>' => escaped.push_str("&gt;"),
			'"' => escaped.push_str("&quot;"),
			'\'' => escaped.push_str("&apos;"),
			c => escaped.push(c),
		}
	}

	escaped
}

fn unescape(raw: &str) -> String {
	raw.replace("&lt;", "<")
		.replace("&gt;", ">")
		.replace("&quot;", "\"")
		.replace("&apos;", "'")
		.replace("&amp;", "&")
}

/// Text content of the first element whose local name is `local`, ignoring namespace prefixes.
fn element_text(xml: &str, local: &str) -> Option<String> {
	let mut rest = xml;

	while let Some(open) = rest.find('<') {
		rest = &rest[open + 1..];

		let close = rest.find('>')?;
		let tag = &rest[..close];

		rest = &rest[close + 1..];

		if tag.starts_with(['/', '?', '!']) {
			continue;
		}

		let name = tag.split(|c: char| c.is_whitespace() || c == '/').next().unwrap_or_default();

		if name.rsplit(':').next() != Some(local) {
			continue;
		}
		if tag.ends_with('/') {
			return Some(String::new());
		}

		let end = rest.find("</")?;

		return Some(unescape(rest[..end].trim()));
	}

	None
}
