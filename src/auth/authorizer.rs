//! Per-request authorization step with cached, singleflight token acquisition.
//!
//! Static modes (`SSWS`, `Bearer`) only stamp a header. Grant modes (`PrivateKey`, `JWT`)
//! acquire tokens through [`TokenEndpoint`], negotiate DPoP when the authorization server
//! demands it, and cache the resulting [`AuthorizationState`] until it expires or is
//! invalidated. Concurrent callers that miss the cache wait for the one acquisition in flight.

// crates.io
use oauth2::http::{HeaderValue, header::AUTHORIZATION};
// self
use crate::{
	_prelude::*,
	auth::{AuthMode, AuthorizationState, DpopKey, ScopeSet, Secret},
	error::{ConfigError, TransientError},
	http::{ReqwestHttpClient, TokenHttpClient},
	oauth::{ReqwestTransportErrorMapper, TokenEndpoint, TokenReply, TransportErrorMapper},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	transport::{self, DPOP, HttpRequest, RequestContext, USER_AGENT_EXTENDED},
};

/// Authorizer specialized for the crate's default reqwest transport stack.
pub type ReqwestAuthorizer = Authorizer<ReqwestHttpClient, ReqwestTransportErrorMapper>;

/// Applies the configured [`AuthMode`] to outbound requests.
pub struct Authorizer<C = ReqwestHttpClient, M = ReqwestTransportErrorMapper>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	mode: AuthMode,
	endpoint: Option<TokenEndpoint<C, M>>,
	state: RwLock<AuthorizationState>,
	acquisition: AsyncMutex<()>,
	max_retries: u32,
	dpop_key: Option<Arc<DpopKey>>,
}
impl<C, M> Authorizer<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates an authorizer; grant modes post to `token_url` through `http_client`.
	pub fn new(
		mode: AuthMode,
		token_url: &Url,
		http_client: impl Into<Arc<C>>,
		mapper: impl Into<Arc<M>>,
	) -> Result<Self> {
		let endpoint = match &mode {
			AuthMode::PrivateKey { signer, .. } =>
				Some(TokenEndpoint::new(signer.client_id(), token_url, http_client, mapper)?),
			AuthMode::Jwt { client_id, .. } =>
				Some(TokenEndpoint::new(client_id, token_url, http_client, mapper)?),
			AuthMode::Ssws { .. } | AuthMode::Bearer { .. } => None,
		};

		Ok(Self {
			mode,
			endpoint,
			state: RwLock::new(AuthorizationState::Unauthenticated),
			acquisition: AsyncMutex::new(()),
			max_retries: 5,
			dpop_key: None,
		})
	}

	/// Caps the token POSTs of one acquisition at `max_retries + 1`.
	pub fn with_max_retries(mut self, max_retries: u32) -> Self {
		self.max_retries = max_retries;

		self
	}

	/// Binds DPoP tokens to `key` instead of generating a fresh RSA key per acquisition.
	pub fn with_dpop_key(mut self, key: DpopKey) -> Self {
		self.dpop_key = Some(Arc::new(key));

		self
	}

	/// Configured mode.
	pub fn mode(&self) -> &AuthMode {
		&self.mode
	}

	/// Snapshot of the cached authorization state.
	pub fn state(&self) -> AuthorizationState {
		self.state.read().clone()
	}

	/// Drops the cached token, nonce, and key together.
	pub fn invalidate(&self) {
		*self.state.write() = AuthorizationState::Unauthenticated;
	}

	/// Stamps `Authorization` (and a fresh `DPoP` proof for bound tokens) onto `request`.
	///
	/// Grant modes acquire a token first when the cache is empty or expired.
	pub async fn authorize(&self, request: &mut HttpRequest, cx: &RequestContext) -> Result<()> {
		match &self.mode {
			AuthMode::Ssws { api_token } => {
				set_authorization(request, "SSWS", api_token)?;

				request.headers_mut().remove(DPOP);
			},
			AuthMode::Bearer { access_token } => {
				set_authorization(request, "Bearer", access_token)?;

				request.headers_mut().remove(DPOP);
			},
			AuthMode::PrivateKey { .. } | AuthMode::Jwt { .. } => {
				let state = self.current(cx).await?;

				apply_state(&state, request)?;
			},
		}

		Ok(())
	}

	/// Returns a valid cached state, acquiring a new token when needed.
	pub async fn current(&self, cx: &RequestContext) -> Result<AuthorizationState> {
		if let Some(state) = self.cached(OffsetDateTime::now_utc()) {
			return Ok(state);
		}

		cx.run(async {
			let _singleflight = self.acquisition.lock().await;

			if let Some(state) = self.cached(OffsetDateTime::now_utc()) {
				return Ok(state);
			}

			let state = self.acquire(cx).await?;

			*self.state.write() = state.clone();

			Ok(state)
		})
		.await
	}

	fn cached(&self, now: OffsetDateTime) -> Option<AuthorizationState> {
		let state = self.state.read();

		state.is_valid_at(now).then(|| state.clone())
	}

	async fn acquire(&self, cx: &RequestContext) -> Result<AuthorizationState> {
		const KIND: FlowKind = FlowKind::TokenAcquisition;

		let span = FlowSpan::new(KIND, "acquire");

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span.instrument(self.negotiate(cx)).await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}

	async fn negotiate(&self, cx: &RequestContext) -> Result<AuthorizationState> {
		let endpoint = self.endpoint.as_ref().ok_or(ConfigError::InvalidOption {
			option: "auth_mode",
			reason: format!("{} does not acquire tokens", self.mode.kind()),
		})?;
		let (scopes, assertion) = self.grant_credentials()?;
		let attempts = self.max_retries.saturating_add(1);
		let mut key = None::<Arc<DpopKey>>;
		let mut nonce = None::<String>;

		for attempt in 1..=attempts {
			cx.check()?;

			let proof = match &key {
				Some(key) =>
					Some(key.proof(&endpoint.method(), endpoint.uri(), nonce.as_deref(), None)?),
				None => None,
			};
			let issued_at = OffsetDateTime::now_utc();

			match endpoint.exchange(scopes, assertion.expose(), proof.as_deref()).await? {
				TokenReply::Granted(grant) => {
					tracing::debug!(
						attempt,
						token_type = %grant.token_type,
						expires_in = grant.expires_in.as_secs(),
						"Acquired access token."
					);

					return Ok(AuthorizationState::issued(
						grant.token_type,
						grant.access_token,
						grant.expires_in,
						issued_at,
						key.map(|key| (key, nonce)),
					)?);
				},
				TokenReply::DpopRequired => {
					tracing::debug!(attempt, "Token endpoint requires a DPoP proof.");

					if key.is_none() {
						key = Some(self.dpop_key()?);
					}
				},
				TokenReply::NonceRequired(server_nonce) => {
					tracing::debug!(attempt, "Token endpoint issued a new DPoP nonce.");

					if key.is_none() {
						key = Some(self.dpop_key()?);
					}

					nonce = Some(server_nonce);
				},
			}
		}

		tracing::warn!(attempts, "DPoP negotiation did not converge.");

		Err(TransientError::DpopNegotiation { attempts }.into())
	}

	fn grant_credentials(&self) -> Result<(&ScopeSet, Secret)> {
		match &self.mode {
			AuthMode::PrivateKey { scopes, signer } => Ok((scopes, Secret::new(signer.sign()?))),
			AuthMode::Jwt { scopes, assertion, .. } => Ok((scopes, assertion.clone())),
			AuthMode::Ssws { .. } | AuthMode::Bearer { .. } => Err(ConfigError::InvalidOption {
				option: "auth_mode",
				reason: format!("{} does not acquire tokens", self.mode.kind()),
			}
			.into()),
		}
	}

	fn dpop_key(&self) -> Result<Arc<DpopKey>> {
		match &self.dpop_key {
			Some(key) => Ok(Arc::clone(key)),
			None => Ok(Arc::new(DpopKey::generate()?)),
		}
	}
}
impl<C, M> Debug for Authorizer<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Authorizer")
			.field("mode", &self.mode.kind())
			.field("endpoint", &self.endpoint)
			.field("max_retries", &self.max_retries)
			.finish_non_exhaustive()
	}
}

fn apply_state(state: &AuthorizationState, request: &mut HttpRequest) -> Result<()> {
	match state {
		AuthorizationState::Unauthenticated =>
			Err(ConfigError::MissingOption { option: "access_token" }.into()),
		AuthorizationState::BearerActive { token, .. } => {
			set_authorization(request, "Bearer", token)?;

			request.headers_mut().remove(DPOP);

			Ok(())
		},
		AuthorizationState::DpopActive { token, nonce, key, .. } => {
			let proof =
				key.proof(request.method(), request.uri(), nonce.as_deref(), Some(token.expose()))?;

			set_authorization(request, "DPoP", token)?;
			transport::set_header(request.headers_mut(), DPOP, &proof);
			transport::set_header(request.headers_mut(), USER_AGENT_EXTENDED, "isDPoP:true");

			Ok(())
		},
	}
}

fn set_authorization(request: &mut HttpRequest, scheme: &str, token: &Secret) -> Result<()> {
	let mut value = HeaderValue::from_str(&format!("{scheme} {}", token.expose())).map_err(|_| {
		ConfigError::InvalidOption {
			option: "credentials",
			reason: "token contains characters that are not valid in a header".into(),
		}
	})?;

	value.set_sensitive(true);
	request.headers_mut().insert(AUTHORIZATION, value);

	Ok(())
}
