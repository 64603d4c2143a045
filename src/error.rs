//! Governor-level error types shared across the pipeline, authorizer, and transports.

// self
use crate::_prelude::*;

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Temporary token endpoint failure.
	#[error(transparent)]
	Transient(#[from] TransientError),
	/// Transport failure (DNS, TCP, TLS, body read).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Rate-limit backoff could not be derived from the 429 response.
	#[error(transparent)]
	RateLimit(#[from] RateLimitError),
	/// Response body could not be decoded.
	#[error(transparent)]
	Decode(#[from] DecodeError),
	/// Non-success API response that is not retried.
	#[error(transparent)]
	Api(#[from] ApiError),

	/// Credentials were rejected or lack the required scopes.
	#[error("Authentication failed: {reason}.")]
	Authentication {
		/// Server- or client-supplied reason string.
		reason: String,
		/// HTTP status code, when available.
		status: Option<u16>,
		/// `X-Okta-Request-Id` of the failing response, when available.
		request_id: Option<String>,
	},
	/// The caller cancelled the request.
	#[error("Request was cancelled.")]
	Cancelled,
	/// The per-request deadline elapsed.
	#[error(
		"Request timed out{}",
		.last.as_ref().map(|e| format!("; last failure: {e}")).unwrap_or_else(|| ".".into())
	)]
	Timeout {
		/// Most recent underlying failure observed before the deadline fired.
		last: Option<Box<Error>>,
	},
	/// Retries were exhausted.
	#[error("Giving up after {attempts} attempt(s): {last}")]
	GaveUp {
		/// Total number of dispatch attempts.
		attempts: u32,
		/// Last observed failure.
		#[source]
		last: Box<Error>,
	},
}
impl Error {
	/// Returns the `X-Okta-Request-Id` associated with the failure, when known.
	pub fn request_id(&self) -> Option<&str> {
		match self {
			Self::Authentication { request_id, .. } => request_id.as_deref(),
			Self::Api(api) => api.request_id.as_deref(),
			Self::RateLimit(err) => err.request_id.as_deref(),
			Self::GaveUp { last, .. } => last.request_id(),
			Self::Timeout { last: Some(last) } => last.request_id(),
			_ => None,
		}
	}

	/// Returns `true` for authentication failures, including wrapped ones.
	pub fn is_authentication(&self) -> bool {
		match self {
			Self::Authentication { .. } => true,
			Self::GaveUp { last, .. } => last.is_authentication(),
			_ => false,
		}
	}

	/// Returns `true` when the failure is safe to retry at the network level.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Transport(err) if err.is_transient())
	}
}

/// Configuration and validation failures.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(#[from] oauth2::http::Error),
	/// Configuration sources could not be read or deserialized.
	#[error("Configuration could not be loaded.")]
	Load(#[from] ::config::ConfigError),
	/// A URL option could not be parsed.
	#[error("The {option} option is not a valid URL.")]
	InvalidUrl {
		/// Option name.
		option: &'static str,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// A required option is missing for the selected mode.
	#[error("The {option} option is required.")]
	MissingOption {
		/// Option name.
		option: &'static str,
	},
	/// An option value is outside its accepted range.
	#[error("The {option} option is invalid: {reason}.")]
	InvalidOption {
		/// Option name.
		option: &'static str,
		/// Human-readable reason.
		reason: String,
	},
	/// Endpoint class names must be valid identifiers.
	#[error(transparent)]
	InvalidEndpointClass(#[from] crate::ratelimit::EndpointClassError),
	/// Scopes cannot be normalized.
	#[error("Requested scopes are invalid.")]
	InvalidScope(#[from] crate::auth::ScopeValidationError),
	/// Private key could not be used for signing.
	#[error("Private key is unusable: {reason}.")]
	InvalidKey {
		/// Human-readable reason.
		reason: String,
	},
	/// JWT signing failed.
	#[error("JWT could not be signed.")]
	Signing(#[from] jsonwebtoken::errors::Error),
	/// Token endpoint response omitted `expires_in`.
	#[error("Token endpoint response is missing expires_in.")]
	MissingExpiresIn,
	/// Token endpoint returned an excessively large `expires_in`.
	#[error("The expires_in value exceeds the supported range.")]
	ExpiresInOutOfRange,
	/// Token endpoint returned a non-positive duration.
	#[error("The expires_in value must be positive.")]
	NonPositiveExpiresIn,
	/// Token endpoint returned a token type this crate cannot present.
	#[error("Token endpoint returned an unsupported token type: {token_type}.")]
	UnsupportedTokenType {
		/// Raw `token_type` value.
		token_type: String,
	},
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}

	/// Shorthand for [`ConfigError::InvalidKey`].
	pub fn invalid_key(reason: impl Into<String>) -> Self {
		Self::InvalidKey { reason: reason.into() }
	}
}
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Temporary token endpoint failures.
#[derive(Debug, ThisError)]
pub enum TransientError {
	/// Token endpoint returned an unexpected but non-fatal response.
	#[error("Token endpoint returned an unexpected response: {message}.")]
	TokenEndpoint {
		/// Server- or client-supplied message summarizing the failure.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
	/// Token endpoint responded with malformed JSON that could not be parsed.
	#[error("Token endpoint returned malformed JSON.")]
	TokenResponseParse {
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::error::Error>,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
	/// DPoP negotiation did not converge within the retry budget.
	#[error("DPoP nonce negotiation did not converge after {attempts} attempt(s).")]
	DpopNegotiation {
		/// Number of token requests issued.
		attempts: u32,
	},
}

/// Transport-level failures (network, IO).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling {target}.")]
	Network {
		/// Endpoint label for diagnostics.
		target: &'static str,
		/// Whether the failure is a timeout, reset, or premature EOF.
		transient: bool,
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred during transport.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(
		target: &'static str,
		transient: bool,
		src: impl 'static + Send + Sync + std::error::Error,
	) -> Self {
		Self::Network { target, transient, source: Box::new(src) }
	}

	/// Returns `true` for timeouts, connection resets, and premature EOF.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Network { transient, .. } => *transient,
			Self::Io(err) => is_transient_io(err.kind()),
		}
	}
}
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		let transient = is_transient_reqwest(&e);

		Self::network("the API", transient, e)
	}
}

/// Failure to derive a backoff delay from a 429 response.
#[derive(Debug, ThisError)]
#[error("Rate limit backoff could not be computed: {reason}.")]
pub struct RateLimitError {
	/// Which header was missing or malformed.
	pub reason: String,
	/// `X-Okta-Request-Id` of the 429 response, when available.
	pub request_id: Option<String>,
}

/// Response decoding failures.
#[derive(Debug, ThisError)]
pub enum DecodeError {
	/// Response content type cannot be decoded.
	#[error("Unsupported response content type: {content_type}.")]
	UnsupportedContentType {
		/// Raw `Content-Type` header.
		content_type: String,
	},
	/// JSON body does not match the target type.
	#[error("Response JSON could not be decoded.")]
	Json(#[from] serde_path_to_error::Error<serde_json::Error>),
	/// XML body does not match the target type.
	#[error("Response XML could not be decoded.")]
	Xml(#[from] quick_xml::DeError),
	/// Request JSON body could not be encoded.
	#[error("Request JSON could not be encoded.")]
	Encode(#[source] serde_json::Error),
}

/// Error payload returned by the management API for non-success responses.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("API returned HTTP {status}: {}.", .summary.as_deref().unwrap_or("no error summary"))]
pub struct ApiError {
	/// HTTP status code.
	pub status: u16,
	/// Server `errorCode`, e.g. `E0000011`.
	pub code: Option<String>,
	/// Server `errorSummary`.
	pub summary: Option<String>,
	/// Server `errorCauses[].errorSummary` values.
	pub causes: Vec<String>,
	/// `X-Okta-Request-Id` of the response.
	pub request_id: Option<String>,
}

fn is_transient_reqwest(err: &ReqwestError) -> bool {
	if err.is_timeout() || err.is_body() {
		return true;
	}

	let mut source = err.source();

	while let Some(cause) = source {
		if let Some(io) = cause.downcast_ref::<std::io::Error>() {
			return is_transient_io(io.kind());
		}

		source = cause.source();
	}

	false
}

fn is_transient_io(kind: std::io::ErrorKind) -> bool {
	use std::io::ErrorKind::*;

	matches!(kind, ConnectionReset | ConnectionAborted | BrokenPipe | TimedOut | UnexpectedEof)
}
