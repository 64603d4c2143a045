//! Token endpoint facade over the `oauth2` crate.
//!
//! One call to [`TokenEndpoint::exchange`] performs a single `client_credentials` POST
//! authenticated by a JWT-bearer client assertion, optionally carrying a DPoP proof. DPoP
//! negotiation signals (`invalid_dpop_proof`, `use_dpop_nonce`) come back as [`TokenReply`]
//! variants so the authorizer can drive the retry loop.

pub use oauth2;

// crates.io
use oauth2::{
	AuthType, ClientId, EndpointNotSet, EndpointSet, HttpClientError, RequestTokenError, Scope,
	TokenResponse, TokenUrl,
	basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType, BasicTokenType},
	http::{HeaderMap, Method, Uri},
};
// self
use crate::{
	_prelude::*,
	auth::{CLIENT_ASSERTION_TYPE, ScopeSet, Secret, TokenType},
	error::{ConfigError, TransientError, TransportError},
	http::{ReqwestHttpClient, ResponseMetadata, ResponseMetadataSlot, TokenHttpClient},
	transport::{self, DPOP},
};

/// OAuth error code asking the client to present a DPoP proof.
pub const INVALID_DPOP_PROOF: &str = "invalid_dpop_proof";
/// OAuth error code asking the client to retry with the `DPoP-Nonce` it was sent.
pub const USE_DPOP_NONCE: &str = "use_dpop_nonce";

const MAX_EXPIRES_IN_SECS: u64 = u32::MAX as u64;

type ConfiguredBasicClient =
	BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;
type FacadeTokenResponse = oauth2::basic::BasicTokenResponse;

/// Maps HTTP transport failures into crate [`Error`] values.
pub trait TransportErrorMapper<E>
where
	Self: 'static + Send + Sync,
	E: 'static + Send + Sync + StdError,
{
	/// Converts an [`HttpClientError`] emitted by the transport into a crate error.
	fn map_transport_error(
		&self,
		metadata: Option<&ResponseMetadata>,
		error: HttpClientError<E>,
	) -> Error;
}

/// Default mapper for reqwest-backed transports.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransportErrorMapper;
impl TransportErrorMapper<ReqwestError> for ReqwestTransportErrorMapper {
	fn map_transport_error(
		&self,
		meta: Option<&ResponseMetadata>,
		err: HttpClientError<ReqwestError>,
	) -> Error {
		match err {
			HttpClientError::Reqwest(inner) => map_reqwest_error(meta, *inner),
			HttpClientError::Http(inner) => ConfigError::from(inner).into(),
			HttpClientError::Io(inner) => TransportError::Io(inner).into(),
			HttpClientError::Other(message) => TransientError::TokenEndpoint {
				message: format!("HTTP client error while calling the token endpoint: {message}"),
				status: meta_status(meta),
			}
			.into(),
			_ => TransientError::TokenEndpoint {
				message: "HTTP client error while calling the token endpoint".into(),
				status: meta_status(meta),
			}
			.into(),
		}
	}
}

/// Successful token response.
#[derive(Clone, Debug)]
pub struct TokenGrant {
	/// Presentation scheme.
	pub token_type: TokenType,
	/// Access token.
	pub access_token: Secret,
	/// Server-declared lifetime.
	pub expires_in: Duration,
}

/// Outcome of one token POST.
#[derive(Clone, Debug)]
pub enum TokenReply {
	/// A token was issued.
	Granted(TokenGrant),
	/// The server demands a DPoP proof (`invalid_dpop_proof`).
	DpopRequired,
	/// The server demands a proof carrying this nonce (`use_dpop_nonce`).
	NonceRequired(String),
}

/// Client-credentials token endpoint of an org authorization server.
pub struct TokenEndpoint<C = ReqwestHttpClient, M = ReqwestTransportErrorMapper>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	oauth_client: ConfiguredBasicClient,
	uri: Uri,
	http_client: Arc<C>,
	error_mapper: Arc<M>,
}
impl<C, M> TokenEndpoint<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a facade posting to `token_url` as `client_id`.
	pub fn new(
		client_id: &str,
		token_url: &Url,
		http_client: impl Into<Arc<C>>,
		error_mapper: impl Into<Arc<M>>,
	) -> Result<Self> {
		let uri = token_url.as_str().parse::<Uri>().map_err(|e| ConfigError::InvalidOption {
			option: "org_url",
			reason: format!("token endpoint is not a valid URI: {e}"),
		})?;
		let oauth_client = BasicClient::new(ClientId::new(client_id.to_owned()))
			.set_token_uri(TokenUrl::from_url(token_url.clone()))
			.set_auth_type(AuthType::RequestBody);

		Ok(Self { oauth_client, uri, http_client: http_client.into(), error_mapper: error_mapper.into() })
	}

	/// Token endpoint URI, the `htu` of token-request proofs.
	pub fn uri(&self) -> &Uri {
		&self.uri
	}

	/// HTTP method of token requests, the `htm` of token-request proofs.
	pub fn method(&self) -> Method {
		Method::POST
	}

	/// Performs one token POST.
	pub async fn exchange(
		&self,
		scopes: &ScopeSet,
		client_assertion: &str,
		dpop_proof: Option<&str>,
	) -> Result<TokenReply> {
		let meta = ResponseMetadataSlot::default();
		let mut headers = HeaderMap::new();

		if let Some(proof) = dpop_proof {
			transport::set_header(&mut headers, DPOP, proof);
		}

		let instrumented = self.http_client.with_metadata(meta.clone(), headers);
		let mut request = self
			.oauth_client
			.exchange_client_credentials()
			.add_extra_param("client_assertion_type", CLIENT_ASSERTION_TYPE)
			.add_extra_param("client_assertion", client_assertion);

		for scope in scopes.iter() {
			request = request.add_scope(Scope::new(scope.to_owned()));
		}

		match request.request_async(&instrumented).await {
			Ok(response) => map_token_response(response).map(TokenReply::Granted),
			Err(err) => map_request_error(meta.take(), err, self.error_mapper.as_ref()),
		}
	}
}
impl<C, M> Debug for TokenEndpoint<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenEndpoint").field("uri", &self.uri).finish_non_exhaustive()
	}
}

fn map_token_response(response: FacadeTokenResponse) -> Result<TokenGrant> {
	let token_type = match response.token_type() {
		BasicTokenType::Bearer => TokenType::Bearer,
		BasicTokenType::Extension(raw) => TokenType::parse(raw)?,
		other =>
			return Err(ConfigError::UnsupportedTokenType { token_type: format!("{other:?}") }.into()),
	};
	let expires_in = response.expires_in().ok_or(ConfigError::MissingExpiresIn)?;

	if expires_in.is_zero() {
		return Err(ConfigError::NonPositiveExpiresIn.into());
	}
	if expires_in.as_secs() > MAX_EXPIRES_IN_SECS {
		return Err(ConfigError::ExpiresInOutOfRange.into());
	}

	Ok(TokenGrant {
		token_type,
		access_token: Secret::new(response.access_token().secret().to_owned()),
		expires_in,
	})
}

fn map_request_error<E, M>(
	meta: Option<ResponseMetadata>,
	err: RequestTokenError<HttpClientError<E>, BasicErrorResponse>,
	mapper: &M,
) -> Result<TokenReply>
where
	E: 'static + Send + Sync + StdError,
	M: ?Sized + TransportErrorMapper<E>,
{
	let meta_ref = meta.as_ref();

	match err {
		RequestTokenError::ServerResponse(response) => map_server_response(response, meta_ref),
		RequestTokenError::Request(error) => Err(mapper.map_transport_error(meta_ref, error)),
		RequestTokenError::Parse(error, _body) =>
			Err(TransientError::TokenResponseParse { source: error, status: meta_status(meta_ref) }
				.into()),
		RequestTokenError::Other(message) =>
			Err(TransientError::TokenEndpoint { message, status: meta_status(meta_ref) }.into()),
	}
}

fn map_server_response(
	response: BasicErrorResponse,
	meta: Option<&ResponseMetadata>,
) -> Result<TokenReply> {
	let code = response.error().as_ref();

	if code == INVALID_DPOP_PROOF {
		return Ok(TokenReply::DpopRequired);
	}
	if code == USE_DPOP_NONCE {
		return match meta.and_then(|m| m.dpop_nonce.clone()) {
			Some(nonce) => Ok(TokenReply::NonceRequired(nonce)),
			None => Err(TransientError::TokenEndpoint {
				message: "use_dpop_nonce without a DPoP-Nonce header".into(),
				status: meta_status(meta),
			}
			.into()),
		};
	}

	let reason = match response.error_description() {
		Some(description) => format!("{code}: {description}"),
		None => code.to_owned(),
	};
	let status = meta_status(meta);

	match response.error() {
		BasicErrorResponseType::Extension(_) if status.is_some_and(|s| s >= 500) =>
			Err(TransientError::TokenEndpoint { message: reason, status }.into()),
		_ => Err(Error::Authentication {
			reason,
			status,
			request_id: meta.and_then(|m| m.request_id.clone()),
		}),
	}
}

fn map_reqwest_error(meta: Option<&ResponseMetadata>, err: ReqwestError) -> Error {
	if err.is_builder() {
		return ConfigError::from(err).into();
	}
	if err.is_timeout() {
		return TransientError::TokenEndpoint {
			message: "request timed out while calling the token endpoint".into(),
			status: meta_status(meta).or_else(|| err.status().map(|code| code.as_u16())),
		}
		.into();
	}

	TransportError::network("the token endpoint", false, err).into()
}

fn meta_status(meta: Option<&ResponseMetadata>) -> Option<u16> {
	meta.and_then(|value| value.status)
}
