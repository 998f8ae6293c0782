//! Authentication modes supported by the remote issuer.

// self
use crate::_prelude::*;

/// One of the three authentication schemes offered by the remote API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
	/// Stateless REST bearer token obtained through a password-style grant.
	Rest,
	/// Stateless SOAP binary security token.
	SoapStateless,
	/// Stateful SOAP session served from the session pool.
	SoapSession,
}
impl AuthMode {
	/// Every supported mode.
	pub const ALL: [AuthMode; 3] = [AuthMode::Rest, AuthMode::SoapStateless, AuthMode::SoapSession];

	/// Returns a stable label suitable for store keys, span fields, and metric labels.
	pub const fn as_str(self) -> &'static str {
		match self {
			AuthMode::Rest => "rest",
			AuthMode::SoapStateless => "soap_stateless",
			AuthMode::SoapSession => "soap_session",
		}
	}

	/// Returns `true` for modes whose tokens are cached in the shared store.
	pub const fn is_cached(self) -> bool {
		!matches!(self, AuthMode::SoapSession)
	}
}
impl Display for AuthMode {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
impl FromStr for AuthMode {
	type Err = UnknownAuthMode;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"rest" => Ok(AuthMode::Rest),
			"soap_stateless" | "soap" => Ok(AuthMode::SoapStateless),
			"soap_session" | "session" => Ok(AuthMode::SoapSession),
			other => Err(UnknownAuthMode(other.to_owned())),
		}
	}
}

/// Error returned when parsing an unknown mode label.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("Unknown authentication mode `{0}`.")]
pub struct UnknownAuthMode(pub String);

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn labels_round_trip_through_from_str() {
		for mode in AuthMode::ALL {
			assert_eq!(mode.as_str().parse::<AuthMode>(), Ok(mode));
		}

		assert_eq!("session".parse::<AuthMode>(), Ok(AuthMode::SoapSession));
		assert!("ldap".parse::<AuthMode>().is_err());
	}

	#[test]
	fn serde_uses_snake_case_labels() {
		let payload = serde_json::to_string(&AuthMode::SoapStateless)
			.expect("AuthMode should serialize to JSON.");

		assert_eq!(payload, "\"soap_stateless\"");
	}
}
