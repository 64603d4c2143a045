//! DPoP (RFC 9449) key material and proof construction.
//!
//! A [`DpopKey`] is generated once per token acquisition and stays bound to the resulting token.
//! Proofs are never reused: every outbound request gets a fresh JWT covering its method, URL,
//! the server nonce, and the access-token hash.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{
	Algorithm, EncodingKey, Header,
	jwk::{AlgorithmParameters, CommonParameters, Jwk, RSAKeyParameters, RSAKeyType},
};
use oauth2::http::{Method, Uri};
use rsa::{RsaPrivateKey, pkcs1::EncodeRsaPrivateKey, traits::PublicKeyParts};
use sha2::{Digest, Sha256};
// self
use crate::{_prelude::*, error::ConfigError};

/// Modulus size of generated DPoP keys.
pub const DPOP_KEY_BITS: usize = 2048;
/// `typ` header value of DPoP proofs.
pub const DPOP_JWT_TYPE: &str = "dpop+jwt";

/// Claims carried by a DPoP proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpopClaims {
	/// HTTP method of the bound request.
	pub htm: String,
	/// Request URL without query or fragment.
	pub htu: String,
	/// Issue time, unix seconds.
	pub iat: i64,
	/// Unique proof identifier.
	pub jti: String,
	/// Server-issued nonce, when one is known.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nonce: Option<String>,
	/// Access-token hash, present on resource requests.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ath: Option<String>,
}

/// RSA key pair proving possession of a DPoP-bound token.
#[derive(Clone)]
pub struct DpopKey {
	encoding: EncodingKey,
	jwk: Jwk,
}
impl DpopKey {
	/// Generates a fresh 2048-bit RSA key pair.
	pub fn generate() -> Result<Self, ConfigError> {
		let key = RsaPrivateKey::new(&mut rand::thread_rng(), DPOP_KEY_BITS)
			.map_err(|e| ConfigError::invalid_key(format!("RSA key generation failed: {e}")))?;

		Self::from_rsa(&key)
	}

	/// Wraps an existing RSA private key.
	pub fn from_rsa(key: &RsaPrivateKey) -> Result<Self, ConfigError> {
		let der = key
			.to_pkcs1_der()
			.map_err(|e| ConfigError::invalid_key(format!("RSA key encoding failed: {e}")))?;
		let jwk = Jwk {
			common: CommonParameters::default(),
			algorithm: AlgorithmParameters::RSA(RSAKeyParameters {
				key_type: RSAKeyType::RSA,
				n: URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
				e: URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
			}),
		};

		Ok(Self { encoding: EncodingKey::from_rsa_der(der.as_bytes()), jwk })
	}

	/// Public half embedded in every proof header.
	pub fn jwk(&self) -> &Jwk {
		&self.jwk
	}

	/// Signs a proof for `method` + `uri`.
	///
	/// `access_token` is hashed into `ath` for resource requests and omitted for token
	/// requests.
	pub fn proof(
		&self,
		method: &Method,
		uri: &Uri,
		nonce: Option<&str>,
		access_token: Option<&str>,
	) -> Result<String, ConfigError> {
		let mut header = Header::new(Algorithm::RS256);

		header.typ = Some(DPOP_JWT_TYPE.into());
		header.jwk = Some(self.jwk.clone());

		let claims = DpopClaims {
			htm: method.as_str().to_owned(),
			htu: htu(uri),
			iat: OffsetDateTime::now_utc().unix_timestamp(),
			jti: uuid::Uuid::new_v4().to_string(),
			nonce: nonce.map(str::to_owned),
			ath: access_token.map(access_token_hash),
		};

		Ok(jsonwebtoken::encode(&header, &claims, &self.encoding)?)
	}
}
impl Debug for DpopKey {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("DpopKey(..)")
	}
}

/// `htu` claim: scheme, authority, and path of `uri`.
pub fn htu(uri: &Uri) -> String {
	match (uri.scheme_str(), uri.authority()) {
		(Some(scheme), Some(authority)) => format!("{scheme}://{authority}{}", uri.path()),
		_ => uri.path().to_owned(),
	}
}

/// `ath` claim: base64url (no padding) SHA-256 of the access token.
pub fn access_token_hash(access_token: &str) -> String {
	URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()))
}
