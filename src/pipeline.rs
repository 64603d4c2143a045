//! Request pipeline: authorization, governed dispatch, retries, and backoff behind one
//! [`RequestPipeline::execute`] call.
//!
//! Each attempt replays the buffered request, authorizes it (a fresh DPoP proof every time),
//! passes it through the [`GovernedTransport`] when the governor is enabled, and lets the
//! [`RetryPolicy`] and [`BackoffController`] decide whether to sleep and go again. The request
//! timeout covers the whole loop, backoff sleeps included.

pub mod decode;
pub mod links;

pub use decode::*;
pub use links::*;

// crates.io
use oauth2::http::{
	HeaderValue, Method, Uri,
	header::{ACCEPT, CONTENT_TYPE, USER_AGENT, WWW_AUTHENTICATE},
};
use serde::de::DeserializeOwned;
// self
use crate::{
	_prelude::*,
	auth::Authorizer,
	config::Config,
	error::{ConfigError, DecodeError},
	http::{ReqwestHttpClient, TokenHttpClient},
	oauth::{ReqwestTransportErrorMapper, TransportErrorMapper},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	ratelimit::{EndpointKeyer, GovernedTransport, RateLimitTable},
	retry::{Attempt, BackoffController, BackoffSettings, RetryPolicy},
	transport::{
		self, HttpRequest, HttpResponse, REQUEST_ID, RequestContext, RequestTemplate, RoundTrip,
	},
};

/// Default `Accept` and `Content-Type`.
pub const APPLICATION_JSON: &str = "application/json";

// 400 diagnostics that indicate a credential or scope problem rather than a bad payload.
const AUTH_DIAGNOSTICS: &[&str] = &[
	"invalid_client",
	"invalid_scope",
	"insufficient_scope",
	"unauthorized_client",
	"does not contain the required scopes",
	"Invalid value for 'client_id' parameter",
];

/// Pipeline specialized for the crate's default reqwest transport stack.
pub type ReqwestPipeline = RequestPipeline<ReqwestHttpClient, ReqwestTransportErrorMapper>;

type SharedRoundTrip = Arc<dyn RoundTrip>;

/// Authorized, rate-limit aware request executor for one org.
///
/// The pipeline owns its rate-limit table and token cache; share it through an [`Arc`].
pub struct RequestPipeline<C = ReqwestHttpClient, M = ReqwestTransportErrorMapper>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	base_url: Url,
	base: SharedRoundTrip,
	governor: Option<GovernedTransport<SharedRoundTrip>>,
	rate_limits: Arc<RateLimitTable>,
	authorizer: Authorizer<C, M>,
	policy: RetryPolicy,
	backoff: Option<BackoffSettings>,
	request_timeout: Option<Duration>,
	user_agent: String,
}
impl ReqwestPipeline {
	/// Builds the reqwest-backed pipeline described by `config`.
	pub fn from_config(config: &Config) -> Result<Self> {
		config.validate()?;

		let http_client = config.http_client()?;
		let authorizer = Authorizer::new(
			config.auth_mode()?,
			&config.token_url()?,
			http_client.clone(),
			ReqwestTransportErrorMapper,
		)?
		.with_max_retries(config.max_retries);
		let mut pipeline = Self::new(config.base_url()?, authorizer, http_client)
			.with_user_agent(config.user_agent())
			.with_backoff(config.backoff.then(|| config.backoff_settings()))
			.with_request_timeout(config.request_timeout());

		if let Some(percent) = config.governor_percent() {
			pipeline = pipeline.with_governor(config.keyer()?, percent);
		}

		Ok(pipeline)
	}
}
impl<C, M> RequestPipeline<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a pipeline with the default retry policy and backoff, no governor, and no
	/// request timeout.
	pub fn new(base_url: Url, authorizer: Authorizer<C, M>, base: impl RoundTrip) -> Self {
		Self {
			base_url,
			base: Arc::new(base),
			governor: None,
			rate_limits: Arc::new(RateLimitTable::default()),
			authorizer,
			policy: RetryPolicy::Default,
			backoff: Some(BackoffSettings::default()),
			request_timeout: None,
			user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
		}
	}

	/// Gates dispatch on `percent` of the advertised budget of each endpoint class.
	///
	/// Percentages outside `1..=99` leave the governor disabled.
	pub fn with_governor(mut self, keyer: EndpointKeyer, percent: u8) -> Self {
		self.governor = (1..=99).contains(&percent).then(|| {
			GovernedTransport::new(
				Arc::clone(&self.base),
				Arc::clone(&self.rate_limits),
				keyer,
				percent,
			)
		});

		self
	}

	/// Replaces the retry strategy.
	pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
		self.policy = policy;

		self
	}

	/// Sets the backoff bounds; `None` disables the retry layer.
	pub fn with_backoff(mut self, backoff: Option<BackoffSettings>) -> Self {
		self.backoff = backoff;

		self
	}

	/// Bounds every [`execute`](Self::execute) call, retries included.
	pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
		self.request_timeout = timeout.filter(|timeout| !timeout.is_zero());

		self
	}

	/// Overrides the `User-Agent` header.
	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.user_agent = user_agent.into();

		self
	}

	/// Org base URL.
	pub fn base_url(&self) -> &Url {
		&self.base_url
	}

	/// Authorizer applied to every attempt.
	pub fn authorizer(&self) -> &Authorizer<C, M> {
		&self.authorizer
	}

	/// Rate-limit table fed by the governor.
	pub fn rate_limits(&self) -> &Arc<RateLimitTable> {
		&self.rate_limits
	}

	/// Builds a request for `path` relative to the org URL.
	pub fn request(&self, method: Method, path: &str) -> Result<HttpRequest> {
		let url = self
			.base_url
			.join(path)
			.map_err(|source| ConfigError::InvalidUrl { option: "path", source })?;

		self.request_url(method, &url)
	}

	/// Builds a request for an absolute URL, such as a pagination link.
	pub fn request_url(&self, method: Method, url: &Url) -> Result<HttpRequest> {
		let uri = url.as_str().parse::<Uri>().map_err(|e| ConfigError::InvalidOption {
			option: "url",
			reason: e.to_string(),
		})?;
		let mut request = HttpRequest::new(Vec::new());

		*request.method_mut() = method;
		*request.uri_mut() = uri;

		Ok(request)
	}

	/// Builds a request for `path` carrying `body` as JSON.
	pub fn json_request<B>(&self, method: Method, path: &str, body: &B) -> Result<HttpRequest>
	where
		B: ?Sized + Serialize,
	{
		let mut request = self.request(method, path)?;

		*request.body_mut() = serde_json::to_vec(body).map_err(DecodeError::Encode)?;
		request.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));

		Ok(request)
	}

	/// Executes `request` and decodes a JSON response into `T`.
	///
	/// Non-success statuses become [`Error::Api`]; an empty body yields `None`.
	pub async fn send_json<T>(&self, request: HttpRequest, cx: &RequestContext) -> Result<Option<T>>
	where
		T: DeserializeOwned,
	{
		let response = self.execute(request, cx).await?;

		if !response.status().is_success() {
			return Err(decode::api_error(&response).into());
		}

		match decode::decode(&response)? {
			Decoded::Empty => Ok(None),
			Decoded::Value(value) => Ok(Some(value)),
			Decoded::Bytes(_) => Err(DecodeError::UnsupportedContentType {
				content_type: "application/octet-stream".into(),
			}
			.into()),
		}
	}

	/// Runs `request` through authorization, the governor, and the retry loop.
	///
	/// The final response is returned whatever its status, except that `401`/`403` and
	/// credential diagnostics on `400` become [`Error::Authentication`].
	pub async fn execute(&self, request: HttpRequest, cx: &RequestContext) -> Result<HttpResponse> {
		const KIND: FlowKind = FlowKind::ApiRequest;

		let span = FlowSpan::new(KIND, "execute");
		let cx = match self.request_timeout {
			Some(timeout) => cx.clone().with_timeout(timeout),
			None => cx.clone(),
		};
		let template = RequestTemplate::capture(self.with_default_headers(request));

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		let result = span.instrument(self.run(&template, &cx)).await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(_) => obs::record_flow_outcome(KIND, FlowOutcome::Failure),
		}

		result
	}

	async fn run(&self, template: &RequestTemplate, cx: &RequestContext) -> Result<HttpResponse> {
		let settings =
			self.backoff.unwrap_or(BackoffSettings { max_retries: 0, ..Default::default() });
		let mut backoff = BackoffController::new(settings);
		let mut last = None::<Error>;
		let mut prior_request_id = None::<String>;
		let mut reauthorized = false;

		loop {
			let mut request = template.replay();

			if backoff.retry_count() > 0 {
				backoff.annotate(request.headers_mut(), prior_request_id.as_deref());
			}

			let outcome = match self.authorizer.authorize(&mut request, cx).await {
				Ok(()) => self.dispatch(request, cx).await,
				Err(e) => Err(e),
			};
			let (delay, failure) = match outcome {
				Ok(response) => {
					let status = response.status().as_u16();

					if status == 401
						&& !reauthorized && self.authorizer.mode().acquires_tokens()
						&& backoff.register_retry()
					{
						tracing::debug!(
							method = %template.method(),
							path = template.path(),
							"Token rejected; re-authorizing once."
						);

						reauthorized = true;
						prior_request_id = request_id(&response);
						self.authorizer.invalidate();

						continue;
					}
					if let Some(err) = authentication_failure(&response) {
						return Err(err);
					}
					if self.backoff.is_none()
						|| !self
							.policy
							.should_retry(cx, Attempt::Response(&response))
							.map_err(|e| attach_last(e, &mut last))?
					{
						return Ok(response);
					}

					prior_request_id = request_id(&response);

					(
						backoff.delay_for(Attempt::Response(&response))?,
						Error::from(decode::api_error(&response)),
					)
				},
				Err(err @ (Error::Cancelled | Error::Timeout { .. })) =>
					return Err(attach_last(err, &mut last)),
				Err(err) => {
					if self.backoff.is_none()
						|| !self
							.policy
							.should_retry(cx, Attempt::Failed(&err))
							.map_err(|e| attach_last(e, &mut last))?
					{
						return Err(err);
					}

					prior_request_id = None;

					(backoff.delay_for(Attempt::Failed(&err))?, err)
				},
			};

			if !backoff.register_retry() {
				tracing::warn!(attempts = backoff.attempts(), error = %failure, "Giving up.");

				return Err(Error::GaveUp { attempts: backoff.attempts(), last: Box::new(failure) });
			}

			last = Some(failure);

			tracing::debug!(
				method = %template.method(),
				path = template.path(),
				retry = backoff.retry_count(),
				delay_ms = delay.as_millis() as u64,
				"Backing off before retry."
			);
			obs::record_flow_outcome(FlowKind::ApiRequest, FlowOutcome::Retry);

			cx.sleep(delay).await.map_err(|e| attach_last(e, &mut last))?;
		}
	}

	async fn dispatch(&self, request: HttpRequest, cx: &RequestContext) -> Result<HttpResponse> {
		match &self.governor {
			Some(governor) => governor.round_trip(request, cx).await,
			None => cx.run(self.base.round_trip(request, cx)).await,
		}
	}

	fn with_default_headers(&self, mut request: HttpRequest) -> HttpRequest {
		let has_body = !request.body().is_empty();
		let headers = request.headers_mut();

		if !headers.contains_key(USER_AGENT) {
			transport::set_header(headers, "user-agent", &self.user_agent);
		}
		if !headers.contains_key(ACCEPT) {
			headers.insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
		}
		if has_body && !headers.contains_key(CONTENT_TYPE) {
			headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
		}

		request
	}
}
impl<C, M> Debug for RequestPipeline<C, M>
where
	C: ?Sized + TokenHttpClient,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RequestPipeline")
			.field("base_url", &self.base_url.as_str())
			.field("governor", &self.governor)
			.field("authorizer", &self.authorizer)
			.field("policy", &self.policy)
			.field("backoff", &self.backoff)
			.field("request_timeout", &self.request_timeout)
			.finish_non_exhaustive()
	}
}

/// Maps credential failures to [`Error::Authentication`].
///
/// `401` and `403` always qualify; a `400` qualifies when its body or `WWW-Authenticate`
/// header names a client or scope problem.
pub fn authentication_failure(response: &HttpResponse) -> Option<Error> {
	let status = response.status().as_u16();
	let challenge = transport::header_str(response.headers(), WWW_AUTHENTICATE.as_str());
	let body = String::from_utf8_lossy(response.body());
	let qualifies = match status {
		401 | 403 => true,
		400 => AUTH_DIAGNOSTICS
			.iter()
			.any(|needle| body.contains(needle) || challenge.is_some_and(|c| c.contains(needle))),
		_ => false,
	};

	if !qualifies {
		return None;
	}

	let api = decode::api_error(response);
	let reason = match (api.summary, challenge) {
		(Some(summary), _) => summary,
		(None, Some(challenge)) => challenge.to_owned(),
		(None, None) => format!("HTTP {status}"),
	};

	Some(Error::Authentication { reason, status: Some(status), request_id: api.request_id })
}

fn request_id(response: &HttpResponse) -> Option<String> {
	transport::header_str(response.headers(), REQUEST_ID).map(str::to_owned)
}

// A deadline that fires carries the most recent failure along.
fn attach_last(err: Error, last: &mut Option<Error>) -> Error {
	match err {
		Error::Timeout { last: None } => Error::Timeout { last: last.take().map(Box::new) },
		other => other,
	}
}
