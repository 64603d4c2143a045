//! Private-key JWT client assertions (`client_assertion_type=...jwt-bearer`).

// crates.io
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::{
	RsaPrivateKey,
	pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey},
	pkcs8::DecodePrivateKey,
};
// self
use crate::{_prelude::*, error::ConfigError};

/// `client_assertion_type` sent alongside every signed assertion.
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
/// Lifetime of a signed assertion.
pub const ASSERTION_TTL: Duration = Duration::from_secs(3600);

/// Claims of a client assertion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
	/// Issuer, the client id.
	pub iss: String,
	/// Subject, the client id.
	pub sub: String,
	/// Token endpoint URL.
	pub aud: String,
	/// Expiry, unix seconds.
	pub exp: i64,
	/// Issue time, unix seconds.
	pub iat: i64,
	/// Unique assertion identifier.
	pub jti: String,
}

/// Signs client assertions with a PEM private key.
///
/// The algorithm follows the key: PKCS#1 or PKCS#8 RSA keys sign RS256, PKCS#8 P-256 keys sign
/// ES256. Any other key is rejected at construction.
#[derive(Clone)]
pub struct ClientAssertionSigner {
	client_id: String,
	audience: String,
	key_id: Option<String>,
	algorithm: Algorithm,
	key: EncodingKey,
}
impl ClientAssertionSigner {
	/// Parses `pem` and infers the signing algorithm.
	pub fn from_pem(
		client_id: impl Into<String>,
		audience: impl Into<String>,
		pem: &str,
	) -> Result<Self, ConfigError> {
		let (algorithm, key) = infer_key(pem)?;
		let signer = Self {
			client_id: client_id.into(),
			audience: audience.into(),
			key_id: None,
			algorithm,
			key,
		};

		// Catches EC keys on curves other than P-256.
		signer.sign_at(OffsetDateTime::now_utc())?;

		Ok(signer)
	}

	/// Sets the `kid` header.
	pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
		self.key_id = Some(key_id.into());

		self
	}

	/// Inferred signing algorithm.
	pub fn algorithm(&self) -> Algorithm {
		self.algorithm
	}

	/// Client id used for `iss` and `sub`.
	pub fn client_id(&self) -> &str {
		&self.client_id
	}

	/// Signs a fresh assertion valid for one hour.
	pub fn sign(&self) -> Result<String, ConfigError> {
		self.sign_at(OffsetDateTime::now_utc())
	}

	/// Signs an assertion issued at `now`.
	pub fn sign_at(&self, now: OffsetDateTime) -> Result<String, ConfigError> {
		let mut header = Header::new(self.algorithm);

		header.kid = self.key_id.clone();

		let iat = now.unix_timestamp();
		let claims = AssertionClaims {
			iss: self.client_id.clone(),
			sub: self.client_id.clone(),
			aud: self.audience.clone(),
			exp: iat + ASSERTION_TTL.as_secs() as i64,
			iat,
			jti: uuid::Uuid::new_v4().to_string(),
		};

		Ok(jsonwebtoken::encode(&header, &claims, &self.key)?)
	}
}
impl Debug for ClientAssertionSigner {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ClientAssertionSigner")
			.field("client_id", &self.client_id)
			.field("audience", &self.audience)
			.field("key_id", &self.key_id)
			.field("algorithm", &self.algorithm)
			.finish_non_exhaustive()
	}
}

fn infer_key(pem: &str) -> Result<(Algorithm, EncodingKey), ConfigError> {
	let pem = pem.trim();

	if pem.contains("BEGIN RSA PRIVATE KEY") {
		RsaPrivateKey::from_pkcs1_pem(pem)
			.map_err(|e| ConfigError::invalid_key(format!("malformed PKCS#1 RSA key: {e}")))?;

		return Ok((Algorithm::RS256, EncodingKey::from_rsa_pem(pem.as_bytes())?));
	}
	if !pem.contains("BEGIN PRIVATE KEY") {
		return Err(ConfigError::invalid_key("expected a PKCS#1 or PKCS#8 PEM private key"));
	}
	if let Ok(rsa) = RsaPrivateKey::from_pkcs8_pem(pem) {
		let der = rsa
			.to_pkcs1_der()
			.map_err(|e| ConfigError::invalid_key(format!("RSA key encoding failed: {e}")))?;

		return Ok((Algorithm::RS256, EncodingKey::from_rsa_der(der.as_bytes())));
	}

	EncodingKey::from_ec_pem(pem.as_bytes())
		.map(|key| (Algorithm::ES256, key))
		.map_err(|_| ConfigError::invalid_key("only RSA and ECDSA P-256 keys are supported"))
}

#[cfg(test)]
mod tests {
	// crates.io
	use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
	// self
	use super::*;
	use crate::_preludet::*;

	const AUDIENCE: &str = "https://acme.okta.com/oauth2/v1/token";

	fn claims_of(jwt: &str) -> AssertionClaims {
		let payload = jwt.split('.').nth(1).expect("JWT should have a payload segment.");
		let bytes = URL_SAFE_NO_PAD.decode(payload).expect("Payload should be base64url.");

		serde_json::from_slice(&bytes).expect("Payload should be assertion claims.")
	}

	#[test]
	fn algorithm_follows_key_type() {
		let pkcs1 = ClientAssertionSigner::from_pem("0oa1", AUDIENCE, &fixture("rsa_pkcs1.pem"))
			.expect("PKCS#1 RSA keys should be accepted.");
		let pkcs8 = ClientAssertionSigner::from_pem("0oa1", AUDIENCE, &fixture("rsa_pkcs8.pem"))
			.expect("PKCS#8 RSA keys should be accepted.");
		let ec = ClientAssertionSigner::from_pem("0oa1", AUDIENCE, &fixture("ec_pkcs8.pem"))
			.expect("PKCS#8 P-256 keys should be accepted.");

		assert_eq!(pkcs1.algorithm(), Algorithm::RS256);
		assert_eq!(pkcs8.algorithm(), Algorithm::RS256);
		assert_eq!(ec.algorithm(), Algorithm::ES256);
	}

	#[test]
	fn unsupported_keys_are_rejected() {
		let ed25519 =
			ClientAssertionSigner::from_pem("0oa1", AUDIENCE, &fixture("ed25519_pkcs8.pem"));

		assert!(matches!(ed25519, Err(ConfigError::InvalidKey { .. })));
		assert!(matches!(
			ClientAssertionSigner::from_pem("0oa1", AUDIENCE, "not a key"),
			Err(ConfigError::InvalidKey { .. })
		));
	}

	#[test]
	fn claims_and_header_follow_the_client() {
		let signer = ClientAssertionSigner::from_pem("0oa1", AUDIENCE, &fixture("rsa_pkcs1.pem"))
			.expect("Fixture key should be accepted.")
			.with_key_id("kid-1");
		let now = OffsetDateTime::from_unix_timestamp(1_704_067_200).expect("Valid timestamp.");
		let jwt = signer.sign_at(now).expect("Assertion should sign.");
		let header = jsonwebtoken::decode_header(&jwt).expect("Header should decode.");
		let claims = claims_of(&jwt);

		assert_eq!(header.kid.as_deref(), Some("kid-1"));
		assert_eq!(claims.iss, "0oa1");
		assert_eq!(claims.sub, "0oa1");
		assert_eq!(claims.aud, AUDIENCE);
		assert_eq!(claims.iat, 1_704_067_200);
		assert_eq!(claims.exp, 1_704_067_200 + 3600);
		assert_ne!(claims.jti, claims_of(&signer.sign_at(now).expect("Assertion should sign.")).jti);
	}
}
