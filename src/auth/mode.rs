//! Authorization modes and the credentials each one carries.

// self
use crate::{
	_prelude::*,
	auth::{ClientAssertionSigner, ScopeSet, Secret},
};

/// Mode names accepted by the `auth_mode` option.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthModeKind {
	/// `Authorization: SSWS <api_token>`.
	#[default]
	#[serde(rename = "SSWS", alias = "ssws")]
	Ssws,
	/// Caller-supplied bearer token.
	#[serde(rename = "Bearer", alias = "bearer")]
	Bearer,
	/// Tokens acquired with a private-key client assertion.
	#[serde(rename = "PrivateKey", alias = "privatekey", alias = "private_key")]
	PrivateKey,
	/// Tokens acquired with a caller-supplied client assertion.
	#[serde(rename = "JWT", alias = "jwt")]
	Jwt,
}
impl AuthModeKind {
	/// Configuration spelling.
	pub const fn as_str(self) -> &'static str {
		match self {
			AuthModeKind::Ssws => "SSWS",
			AuthModeKind::Bearer => "Bearer",
			AuthModeKind::PrivateKey => "PrivateKey",
			AuthModeKind::Jwt => "JWT",
		}
	}
}
impl Display for AuthModeKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Authorization mode fixed at construction time.
#[derive(Clone, Debug)]
pub enum AuthMode {
	/// Static API token.
	Ssws {
		/// API token.
		api_token: Secret,
	},
	/// Static access token.
	Bearer {
		/// Access token.
		access_token: Secret,
	},
	/// Client-credentials grant authenticated by a locally signed assertion.
	PrivateKey {
		/// Scopes requested for every token.
		scopes: ScopeSet,
		/// Assertion signer carrying the client id.
		signer: ClientAssertionSigner,
	},
	/// Client-credentials grant authenticated by a caller-supplied assertion.
	Jwt {
		/// Client id sent with the grant.
		client_id: String,
		/// Scopes requested for every token.
		scopes: ScopeSet,
		/// Pre-built client assertion.
		assertion: Secret,
	},
}
impl AuthMode {
	/// Mode name.
	pub fn kind(&self) -> AuthModeKind {
		match self {
			Self::Ssws { .. } => AuthModeKind::Ssws,
			Self::Bearer { .. } => AuthModeKind::Bearer,
			Self::PrivateKey { .. } => AuthModeKind::PrivateKey,
			Self::Jwt { .. } => AuthModeKind::Jwt,
		}
	}

	/// Returns `true` for modes that acquire tokens and can therefore re-authorize.
	pub fn acquires_tokens(&self) -> bool {
		matches!(self, Self::PrivateKey { .. } | Self::Jwt { .. })
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn mode_names_deserialize_from_config_spellings() {
		for (raw, kind) in [
			("\"SSWS\"", AuthModeKind::Ssws),
			("\"Bearer\"", AuthModeKind::Bearer),
			("\"PrivateKey\"", AuthModeKind::PrivateKey),
			("\"JWT\"", AuthModeKind::Jwt),
			("\"jwt\"", AuthModeKind::Jwt),
		] {
			let parsed: AuthModeKind =
				serde_json::from_str(raw).expect("Mode spelling should deserialize.");

			assert_eq!(parsed, kind);
		}

		assert!(serde_json::from_str::<AuthModeKind>("\"Basic\"").is_err());
	}

	#[test]
	fn only_grant_modes_acquire_tokens() {
		let ssws = AuthMode::Ssws { api_token: Secret::new("00abc") };
		let jwt = AuthMode::Jwt {
			client_id: "0oa1".into(),
			scopes: ScopeSet::default(),
			assertion: Secret::new("eyJ..."),
		};

		assert!(!ssws.acquires_tokens());
		assert!(jwt.acquires_tokens());
		assert_eq!(jwt.kind().to_string(), "JWT");
	}
}
