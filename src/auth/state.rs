//! Cached authorization state: the token, its type, and the DPoP nonce + key bound to it.

// self
use crate::{
	_prelude::*,
	auth::{DpopKey, Secret},
	error::ConfigError,
};

/// Stored expiry precedes the server expiry by this margin.
pub const EXPIRY_SKEW: Duration = Duration::from_secs(2);

/// Presentation scheme of an access token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenType {
	/// `Authorization: Bearer <token>`.
	Bearer,
	/// `Authorization: DPoP <token>` plus a `DPoP` proof.
	Dpop,
}
impl TokenType {
	/// Authorization scheme as sent on the wire.
	pub const fn as_str(self) -> &'static str {
		match self {
			TokenType::Bearer => "Bearer",
			TokenType::Dpop => "DPoP",
		}
	}

	/// Parses a `token_type` value, case-insensitively.
	pub fn parse(raw: &str) -> Result<Self, ConfigError> {
		if raw.eq_ignore_ascii_case("bearer") {
			Ok(Self::Bearer)
		} else if raw.eq_ignore_ascii_case("dpop") {
			Ok(Self::Dpop)
		} else {
			Err(ConfigError::UnsupportedTokenType { token_type: raw.to_owned() })
		}
	}
}
impl Display for TokenType {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Token cache of the authorizer.
///
/// Token, nonce, and key form one unit: any invalidation drops all of them together.
#[derive(Clone, Debug, Default)]
pub enum AuthorizationState {
	/// No usable token.
	#[default]
	Unauthenticated,
	/// Plain bearer token.
	BearerActive {
		/// Access token.
		token: Secret,
		/// Local expiry, already skewed.
		expires_at: OffsetDateTime,
	},
	/// DPoP-bound token.
	DpopActive {
		/// Access token.
		token: Secret,
		/// Local expiry, already skewed.
		expires_at: OffsetDateTime,
		/// Most recent server nonce.
		nonce: Option<String>,
		/// Key the token is bound to.
		key: Arc<DpopKey>,
	},
}
impl AuthorizationState {
	/// Builds the active state for a freshly issued token.
	///
	/// `expires_in` is the server lifetime; the stored expiry is [`EXPIRY_SKEW`] earlier.
	pub fn issued(
		token_type: TokenType,
		token: Secret,
		expires_in: Duration,
		issued_at: OffsetDateTime,
		dpop: Option<(Arc<DpopKey>, Option<String>)>,
	) -> Result<Self, ConfigError> {
		let lifetime = expires_in.saturating_sub(EXPIRY_SKEW);
		let expires_at = issued_at + lifetime;

		match (token_type, dpop) {
			(TokenType::Bearer, _) => Ok(Self::BearerActive { token, expires_at }),
			(TokenType::Dpop, Some((key, nonce))) =>
				Ok(Self::DpopActive { token, expires_at, nonce, key }),
			(TokenType::Dpop, None) =>
				Err(ConfigError::UnsupportedTokenType { token_type: "DPoP without a proof".into() }),
		}
	}

	/// Returns `true` when a token exists and has not reached its local expiry at `now`.
	pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
		match self {
			Self::Unauthenticated => false,
			Self::BearerActive { expires_at, .. } | Self::DpopActive { expires_at, .. } =>
				now < *expires_at,
		}
	}

	/// Token type of the active token.
	pub fn token_type(&self) -> Option<TokenType> {
		match self {
			Self::Unauthenticated => None,
			Self::BearerActive { .. } => Some(TokenType::Bearer),
			Self::DpopActive { .. } => Some(TokenType::Dpop),
		}
	}

	/// Active token.
	pub fn token(&self) -> Option<&Secret> {
		match self {
			Self::Unauthenticated => None,
			Self::BearerActive { token, .. } | Self::DpopActive { token, .. } => Some(token),
		}
	}

	/// DPoP nonce bound to the active token.
	pub fn nonce(&self) -> Option<&str> {
		match self {
			Self::DpopActive { nonce, .. } => nonce.as_deref(),
			_ => None,
		}
	}
}
