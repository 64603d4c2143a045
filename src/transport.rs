//! Composable round-tripper capability plus the per-request context that carries cancellation,
//! deadlines, and request-scoped retry preferences.
//!
//! Every layer of the pipeline (the governor, the base reqwest transport, test doubles) is a
//! value implementing [`RoundTrip`] that owns its `inner` layer, so chains are assembled by
//! construction. Bodies are buffered (`Vec<u8>`) which keeps requests replayable across retries.

// crates.io
use oauth2::http::{HeaderMap, HeaderValue, Method, Uri, Version, header::HeaderName};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
// self
use crate::_prelude::*;

pub use oauth2::{HttpRequest, HttpResponse};

/// Boxed future returned by [`RoundTrip::round_trip`].
pub type RoundTripFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpResponse>> + 'a + Send>>;

/// `X-Okta-Request-Id` response header.
pub const REQUEST_ID: &str = "x-okta-request-id";
/// `X-Rate-Limit-Limit` response header.
pub const RATE_LIMIT_LIMIT: &str = "x-rate-limit-limit";
/// `X-Rate-Limit-Remaining` response header.
pub const RATE_LIMIT_REMAINING: &str = "x-rate-limit-remaining";
/// `X-Rate-Limit-Reset` response header.
pub const RATE_LIMIT_RESET: &str = "x-rate-limit-reset";
/// `DPoP-Nonce` response header.
pub const DPOP_NONCE: &str = "dpop-nonce";
/// `DPoP` request header.
pub const DPOP: &str = "dpop";
/// `X-Okta-Retry-For` request header.
pub const RETRY_FOR: &str = "x-okta-retry-for";
/// `X-Okta-Retry-Count` request header.
pub const RETRY_COUNT: &str = "x-okta-retry-count";
/// `x-okta-user-agent-extended` request header.
pub const USER_AGENT_EXTENDED: &str = "x-okta-user-agent-extended";

/// A single HTTP exchange capability. Wrappers take their `inner` layer at construction time.
pub trait RoundTrip
where
	Self: 'static + Send + Sync,
{
	/// Dispatches `request`, honoring the cancellation and deadline carried by `cx`.
	fn round_trip<'a>(&'a self, request: HttpRequest, cx: &'a RequestContext)
	-> RoundTripFuture<'a>;
}
impl<T> RoundTrip for Arc<T>
where
	T: ?Sized + RoundTrip,
{
	fn round_trip<'a>(
		&'a self,
		request: HttpRequest,
		cx: &'a RequestContext,
	) -> RoundTripFuture<'a> {
		(**self).round_trip(request, cx)
	}
}

/// Per-request execution context: cancellation signal, optional deadline, and an opt-in list of
/// statuses that should be retried as if transient.
///
/// Cloning shares the cancellation signal.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
	cancel: CancellationToken,
	deadline: Option<Instant>,
	retry_on_status: Option<Arc<[u16]>>,
}
impl RequestContext {
	/// Creates a context with a fresh cancellation token and no deadline.
	pub fn new() -> Self {
		Self::default()
	}

	/// Uses the caller's cancellation token.
	pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
		self.cancel = token;

		self
	}

	/// Sets an absolute deadline, keeping the earlier one if a deadline already exists.
	pub fn with_deadline(mut self, deadline: Instant) -> Self {
		self.deadline = Some(match self.deadline {
			Some(current) if current < deadline => current,
			_ => deadline,
		});

		self
	}

	/// Sets a deadline relative to now.
	pub fn with_timeout(self, timeout: Duration) -> Self {
		self.with_deadline(Instant::now() + timeout)
	}

	/// Attaches statuses that must be retried for this request only (e.g. 404 right after a
	/// create, while the write propagates).
	pub fn with_retry_on_status(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
		self.retry_on_status = Some(codes.into_iter().collect());

		self
	}

	/// Request-scoped retry statuses, if any.
	pub fn retry_on_status(&self) -> Option<&[u16]> {
		self.retry_on_status.as_deref()
	}

	/// Cancellation token observed by every suspension point.
	pub fn cancellation(&self) -> &CancellationToken {
		&self.cancel
	}

	/// Deadline, if any.
	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	/// Signals cancellation to every holder of this context.
	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	/// Returns the context error if the request was cancelled or its deadline passed.
	pub fn check(&self) -> Result<()> {
		if self.cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}
		if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
			return Err(Error::Timeout { last: None });
		}

		Ok(())
	}

	/// Sleeps for `duration` unless cancelled or the deadline fires first.
	pub async fn sleep(&self, duration: Duration) -> Result<()> {
		self.check()?;

		if duration.is_zero() {
			return Ok(());
		}

		self.run(async {
			sleep(duration).await;

			Ok(())
		})
		.await
	}

	/// Drives `fut` to completion unless cancelled or the deadline fires first. Dropping the
	/// future aborts any in-flight connection it owns.
	pub async fn run<F, T>(&self, fut: F) -> Result<T>
	where
		F: Future<Output = Result<T>>,
	{
		self.check()?;

		let deadline = async {
			match self.deadline {
				Some(deadline) => sleep_until(deadline).await,
				None => std::future::pending::<()>().await,
			}
		};

		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => Err(Error::Cancelled),
			_ = deadline => Err(Error::Timeout { last: None }),
			result = fut => result,
		}
	}
}

/// Buffered copy of an outbound request that can be replayed for every attempt.
#[derive(Clone, Debug)]
pub struct RequestTemplate {
	method: Method,
	uri: Uri,
	version: Version,
	headers: HeaderMap,
	body: Vec<u8>,
}
impl RequestTemplate {
	/// Captures `request` for later replays.
	pub fn capture(request: HttpRequest) -> Self {
		let (parts, body) = request.into_parts();

		Self {
			method: parts.method,
			uri: parts.uri,
			version: parts.version,
			headers: parts.headers,
			body,
		}
	}

	/// Builds a fresh request identical to the captured one.
	pub fn replay(&self) -> HttpRequest {
		let mut request = HttpRequest::new(self.body.clone());

		*request.method_mut() = self.method.clone();
		*request.uri_mut() = self.uri.clone();
		*request.version_mut() = self.version;
		*request.headers_mut() = self.headers.clone();

		request
	}

	/// Request path used for endpoint classification.
	pub fn path(&self) -> &str {
		self.uri.path()
	}

	/// Request method.
	pub fn method(&self) -> &Method {
		&self.method
	}
}

/// Reads a header as trimmed UTF-8.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
	headers.get(name).and_then(|value| value.to_str().ok()).map(str::trim)
}

/// Inserts a header, skipping values that are not valid header text.
pub(crate) fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
	match HeaderValue::from_str(value) {
		Ok(value) => {
			headers.insert(HeaderName::from_static(name), value);
		},
		Err(_) => tracing::warn!(header = name, "Dropping header with invalid characters."),
	}
}
