//! Immutable credential supplied once at startup.

// self
use crate::{_prelude::*, auth::secret::{self, Secret}};

/// Credential used for every issuance against the remote API.
///
/// The value is immutable after construction and owned by the token manager. Its
/// [`namespace`](Self::namespace) partitions shared-store keys so several credentials
/// can coordinate through the same store without colliding.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
	/// Application client identifier.
	pub client_id: String,
	/// Application client secret.
	pub client_secret: Secret,
	/// End-user (agent) name.
	pub username: String,
	/// End-user password.
	pub password: Secret,
	/// Pseudo city code (agency/office identifier) the user signs in under.
	pub pcc: String,
	/// Target environment label (e.g. `cert`, `prod`).
	pub environment: String,
}
impl Credential {
	/// Returns a builder seeded with the client identity.
	pub fn builder(
		client_id: impl Into<String>,
		client_secret: impl Into<Secret>,
	) -> CredentialBuilder {
		CredentialBuilder {
			client_id: client_id.into(),
			client_secret: client_secret.into(),
			username: String::new(),
			password: Secret::new(""),
			pcc: String::new(),
			environment: String::new(),
		}
	}

	/// Stable store-key prefix derived from the non-secret identity fields.
	pub fn namespace(&self) -> String {
		let material =
			[self.client_id.as_str(), &self.username, &self.pcc, &self.environment].join("\n");
		let digest = secret::fingerprint(material.as_bytes());

		format!("cb:{}", &digest[..16])
	}
}
impl Debug for Credential {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Credential")
			.field("client_id", &self.client_id)
			.field("client_secret", &self.client_secret)
			.field("username", &self.username)
			.field("password", &self.password)
			.field("pcc", &self.pcc)
			.field("environment", &self.environment)
			.finish()
	}
}

/// Builder for [`Credential`].
#[derive(Clone, Debug)]
pub struct CredentialBuilder {
	client_id: String,
	client_secret: Secret,
	username: String,
	password: Secret,
	pcc: String,
	environment: String,
}
impl CredentialBuilder {
	/// Sets the user name and password.
	pub fn user(mut self, username: impl Into<String>, password: impl Into<Secret>) -> Self {
		self.username = username.into();
		self.password = password.into();

		self
	}

	/// Sets the pseudo city code.
	pub fn pcc(mut self, pcc: impl Into<String>) -> Self {
		self.pcc = pcc.into();

		self
	}

	/// Sets the environment label.
	pub fn environment(mut self, environment: impl Into<String>) -> Self {
		self.environment = environment.into();

		self
	}

	/// Produces the immutable credential.
	pub fn build(self) -> Credential {
		Credential {
			client_id: self.client_id,
			client_secret: self.client_secret,
			username: self.username,
			password: self.password,
			pcc: self.pcc,
			environment: self.environment,
		}
	}
}
