//! Governed transport: consults the rate-limit table before dispatch and feeds it from response
//! headers afterwards.

// crates.io
use oauth2::http::HeaderMap;
// self
use crate::{
	_prelude::*,
	ratelimit::{EndpointClass, EndpointKeyer, RateLimitRecord, RateLimitTable, UpdateOutcome},
	transport::{
		self, HttpRequest, RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING, RATE_LIMIT_RESET,
		RequestContext, RoundTrip, RoundTripFuture,
	},
};

/// Result of the pre-dispatch capacity check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
	/// The request may proceed immediately.
	Proceed,
	/// The request must wait for the window to roll.
	Wait(RetryDirective),
}

/// Advises callers when to dispatch after an [`Admission::Wait`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryDirective {
	/// Instant when the window is expected to reset.
	pub earliest_retry_at: OffsetDateTime,
	/// Time left until `earliest_retry_at`, zero when the window already rolled.
	pub recommended_backoff: Duration,
	/// Optional descriptive string.
	pub reason: Option<String>,
}
impl RetryDirective {
	/// Creates a new directive with the provided timing metadata.
	pub fn new(earliest_retry_at: OffsetDateTime, recommended_backoff: Duration) -> Self {
		Self { earliest_retry_at, recommended_backoff, reason: None }
	}

	/// Adds a human-readable reason.
	pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
		self.reason = Some(reason.into());

		self
	}
}

/// [`RoundTrip`] wrapper that gates requests on the advertised per-class budget.
///
/// The governor only holds requests back when `percent` lies in `1..=99`; outside that range
/// every request is admitted immediately but headers are still ingested.
pub struct GovernedTransport<T> {
	inner: T,
	table: Arc<RateLimitTable>,
	keyer: EndpointKeyer,
	percent: u8,
}
impl<T> GovernedTransport<T>
where
	T: RoundTrip,
{
	/// Wraps `inner`, accounting against `table`.
	pub fn new(inner: T, table: Arc<RateLimitTable>, keyer: EndpointKeyer, percent: u8) -> Self {
		Self { inner, table, keyer, percent }
	}

	/// Shared rate-limit table.
	pub fn table(&self) -> &Arc<RateLimitTable> {
		&self.table
	}

	/// Path keyer in use.
	pub fn keyer(&self) -> &EndpointKeyer {
		&self.keyer
	}

	/// Returns `true` when admission control is in effect.
	pub fn is_active(&self) -> bool {
		(1..100).contains(&self.percent)
	}

	/// Decides whether a request for `class` may be dispatched at `now`.
	pub fn admission(&self, class: &EndpointClass, now: OffsetDateTime) -> Admission {
		if !self.is_active() {
			return Admission::Proceed;
		}

		let record = self.table.get(class);

		if record.has_capacity(self.percent) {
			return Admission::Proceed;
		}

		let wait = Duration::from_secs(record.seconds_until_reset(now));
		let earliest = OffsetDateTime::from_unix_timestamp(record.reset).unwrap_or(now);

		Admission::Wait(RetryDirective::new(earliest, wait).with_reason(format!(
			"{class} has {}/{} requests left, below the {}% ceiling",
			record.remaining, record.limit, self.percent
		)))
	}

	/// Waits until `class` may dispatch. Fails without dispatching when `cx` is cancelled or
	/// its deadline passes first.
	pub async fn admit(&self, class: &EndpointClass, cx: &RequestContext) -> Result<()> {
		match self.admission(class, OffsetDateTime::now_utc()) {
			Admission::Proceed => cx.check(),
			Admission::Wait(directive) => {
				tracing::debug!(
					class = %class,
					wait_secs = directive.recommended_backoff.as_secs(),
					reason = directive.reason.as_deref().unwrap_or_default(),
					"Holding request until the rate-limit window resets."
				);

				cx.sleep(directive.recommended_backoff).await
			},
		}
	}

	/// Feeds the `x-rate-limit-*` triple from `headers` into the table.
	///
	/// Returns `None` when the headers are absent or malformed.
	pub fn ingest(&self, class: &EndpointClass, headers: &HeaderMap) -> Option<UpdateOutcome> {
		let record = parse_record(headers)?;
		let outcome = self.table.update(class, record);

		tracing::trace!(class = %class, ?record, ?outcome, "Ingested rate-limit headers.");

		Some(outcome)
	}
}
impl<T> RoundTrip for GovernedTransport<T>
where
	T: RoundTrip,
{
	fn round_trip<'a>(
		&'a self,
		request: HttpRequest,
		cx: &'a RequestContext,
	) -> RoundTripFuture<'a> {
		Box::pin(async move {
			let class = self.keyer.classify(request.uri().path());

			self.admit(&class, cx).await?;

			let response = cx.run(self.inner.round_trip(request, cx)).await?;

			self.ingest(&class, response.headers());

			Ok(response)
		})
	}
}
impl<T> Debug for GovernedTransport<T> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("GovernedTransport")
			.field("keyer", &self.keyer)
			.field("percent", &self.percent)
			.finish_non_exhaustive()
	}
}

fn parse_record(headers: &HeaderMap) -> Option<RateLimitRecord> {
	let limit = transport::header_str(headers, RATE_LIMIT_LIMIT);
	let remaining = transport::header_str(headers, RATE_LIMIT_REMAINING);
	let reset = transport::header_str(headers, RATE_LIMIT_RESET);

	let (Some(limit), Some(remaining), Some(reset)) = (limit, remaining, reset) else {
		return None;
	};

	match (limit.parse::<u64>(), remaining.parse::<u64>(), reset.parse::<i64>()) {
		(Ok(limit), Ok(remaining), Ok(reset)) => Some(RateLimitRecord::new(limit, remaining, reset)),
		_ => {
			tracing::warn!(limit, remaining, reset, "Skipping malformed rate-limit headers.");

			None
		},
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::_preludet::*;

	fn governor(
		transport: ScriptedTransport,
		percent: u8,
	) -> GovernedTransport<ScriptedTransport> {
		GovernedTransport::new(
			transport,
			Arc::new(RateLimitTable::default()),
			EndpointKeyer::default(),
			percent,
		)
	}

	fn get(path: &str) -> HttpRequest {
		let mut request = HttpRequest::new(Vec::new());

		*request.uri_mut() =
			format!("https://example.okta.com{path}").parse().expect("Fixture URI should parse.");

		request
	}

	#[test]
	fn admission_passes_then_blocks_after_consumption() {
		let now = OffsetDateTime::now_utc();
		let reset = now.unix_timestamp() + 30;
		let gov = governor(ScriptedTransport::default(), 10);

		gov.table().update(&EndpointClass::USERS, RateLimitRecord::new(25, 23, reset));

		assert_eq!(gov.admission(&EndpointClass::USERS, now), Admission::Proceed);

		let consumed = governor(ScriptedTransport::default(), 10);

		consumed.table().update(&EndpointClass::USERS, RateLimitRecord::new(25, 22, reset));

		let Admission::Wait(directive) = consumed.admission(&EndpointClass::USERS, now) else {
			panic!("Admission should wait once the reserve is reached.");
		};

		assert_eq!(directive.recommended_backoff, Duration::from_secs(30));
		assert_eq!(directive.earliest_retry_at.unix_timestamp(), reset);
	}

	#[tokio::test]
	async fn cancelled_wait_never_dispatches() {
		let transport = ScriptedTransport::new([Scripted::respond(200, &[], "")]);
		let gov = governor(transport.clone(), 10);
		let reset = OffsetDateTime::now_utc().unix_timestamp() + 30;

		gov.table().update(&EndpointClass::USERS, RateLimitRecord::new(25, 22, reset));

		let cx = RequestContext::new();

		cx.cancel();

		let result = gov.round_trip(get("/api/v1/users"), &cx).await;

		assert!(matches!(result, Err(Error::Cancelled)));
		assert_eq!(transport.calls(), 0);
	}

	#[tokio::test]
	async fn cancelled_context_blocks_dispatch_even_with_capacity() {
		let transport = ScriptedTransport::new([Scripted::respond(200, &[], "")]);
		let gov = governor(transport.clone(), 50);
		let cx = RequestContext::new();

		cx.cancel();

		assert!(matches!(gov.round_trip(get("/api/v1/apps"), &cx).await, Err(Error::Cancelled)));
		assert_eq!(transport.calls(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn exhausted_class_sleeps_until_reset_then_dispatches() {
		let reset = OffsetDateTime::now_utc().unix_timestamp() + 30;
		let next_reset = (reset + 60).to_string();
		let transport = ScriptedTransport::new([Scripted::respond(
			200,
			&[
				(RATE_LIMIT_LIMIT, "25"),
				(RATE_LIMIT_REMAINING, "24"),
				(RATE_LIMIT_RESET, next_reset.as_str()),
			],
			"",
		)]);
		let gov = governor(transport.clone(), 10);

		gov.table().update(&EndpointClass::USERS, RateLimitRecord::new(25, 0, reset));

		let started = tokio::time::Instant::now();
		let response = gov
			.round_trip(get("/api/v1/users/00u1"), &RequestContext::new())
			.await
			.expect("Request should dispatch after the window resets.");

		assert_eq!(response.status(), 200);
		assert!(started.elapsed() >= Duration::from_secs(29));
		assert_eq!(transport.calls(), 1);
		assert_eq!(gov.table().get(&EndpointClass::USERS).remaining, 24);
	}

	#[tokio::test]
	async fn inactive_governor_still_ingests_429_headers() {
		let transport = ScriptedTransport::new([Scripted::respond(
			429,
			&[(RATE_LIMIT_LIMIT, "600"), (RATE_LIMIT_REMAINING, "0"), (RATE_LIMIT_RESET, "1704067210")],
			"",
		)]);
		let gov = governor(transport, 100);

		assert!(!gov.is_active());

		let response = gov
			.round_trip(get("/api/v1/apps/0oa1"), &RequestContext::new())
			.await
			.expect("A 429 is a response, not a transport error.");

		assert_eq!(response.status(), 429);
		assert_eq!(
			gov.table().get(&EndpointClass::APPS),
			RateLimitRecord::new(600, 0, 1_704_067_210)
		);
	}

	#[test]
	fn malformed_or_partial_headers_are_skipped() {
		let gov = governor(ScriptedTransport::default(), 10);
		let partial = response(200, &[(RATE_LIMIT_LIMIT, "600"), (RATE_LIMIT_REMAINING, "10")], "");
		let malformed = response(
			200,
			&[(RATE_LIMIT_LIMIT, "600"), (RATE_LIMIT_REMAINING, "ten"), (RATE_LIMIT_RESET, "1")],
			"",
		);

		assert_eq!(gov.ingest(&EndpointClass::OTHER, partial.headers()), None);
		assert_eq!(gov.ingest(&EndpointClass::OTHER, malformed.headers()), None);
		assert_eq!(gov.table().get(&EndpointClass::OTHER), RateLimitRecord::default());
	}

	#[tokio::test]
	async fn transport_errors_skip_ingestion() {
		let gov = governor(ScriptedTransport::new([Scripted::Reset]), 10);
		let result = gov.round_trip(get("/api/v1/groups"), &RequestContext::new()).await;

		assert!(result.is_err_and(|e| e.is_transient()));
		assert_eq!(gov.table().get(&EndpointClass::OTHER), RateLimitRecord::default());
	}
}
