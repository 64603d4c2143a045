// crates.io
use tokio::time::Instant;
// self
use okta_governor::{
	_preludet::*,
	auth::{AuthMode, Authorizer, Secret},
	oauth::{ReqwestTransportErrorMapper, oauth2::http::Method},
	pipeline::RequestPipeline,
	ratelimit::{EndpointClass, EndpointKeyer, RateLimitRecord},
	retry::{BackoffSettings, RetryPolicy},
	transport::{HttpResponse, RequestContext},
};

const DATE: &str = "Mon, 01 Jan 2024 00:00:00 GMT";
const RESET_AFTER_TEN: &str = "1704067210";

fn pipeline(transport: &ScriptedTransport) -> RequestPipeline {
	let base = Url::parse("https://example.okta.com").expect("Base URL should parse.");
	let authorizer = Authorizer::new(
		AuthMode::Ssws { api_token: Secret::new("00abc") },
		&base,
		test_reqwest_http_client(),
		ReqwestTransportErrorMapper,
	)
	.expect("SSWS authorizer should build.");

	RequestPipeline::new(base, authorizer, transport.clone())
}

fn settings(min_wait: u64, max_wait: u64, max_retries: u32) -> Option<BackoffSettings> {
	Some(BackoffSettings {
		min_wait: Duration::from_secs(min_wait),
		max_wait: Duration::from_secs(max_wait),
		max_retries,
		..Default::default()
	})
}

fn too_many_requests(request_id: &str) -> Scripted {
	Scripted::respond(
		429,
		&[
			("content-type", "application/json"),
			("date", DATE),
			("x-rate-limit-reset", RESET_AFTER_TEN),
			("x-okta-request-id", request_id),
		],
		"{\"errorCode\":\"E0000047\",\"errorSummary\":\"API call exceeded rate limit due to too many requests.\"}",
	)
}

fn ok() -> Scripted {
	Scripted::respond(200, &[("content-type", "application/json")], "{\"id\":\"00u1\"}")
}

async fn get(pipeline: &RequestPipeline, cx: &RequestContext) -> Result<HttpResponse> {
	let request = pipeline.request(Method::GET, "/api/v1/users/00u1").expect("Request should build.");

	pipeline.execute(request, cx).await
}

#[tokio::test(start_paused = true)]
async fn rate_limited_request_waits_until_reset_and_is_annotated() {
	let transport = ScriptedTransport::new([too_many_requests("req-1"), ok()]);
	let pipeline = pipeline(&transport).with_backoff(settings(5, 60, 3));
	let started = Instant::now();
	let response = get(&pipeline, &RequestContext::new()).await.expect("Retry should succeed.");
	let waited = started.elapsed();
	let requests = transport.requests();

	assert_eq!(response.status().as_u16(), 200);
	assert!(waited >= Duration::from_secs(11) && waited < Duration::from_secs(12), "{waited:?}");
	assert_eq!(requests.len(), 2);
	assert_eq!(requests[0].header("x-okta-retry-for"), None);
	assert_eq!(requests[0].header("x-okta-retry-count"), None);
	assert_eq!(requests[1].header("x-okta-retry-for"), Some("req-1"));
	assert_eq!(requests[1].header("x-okta-retry-count"), Some("1"));
	assert_eq!(requests[1].header("authorization"), Some("SSWS 00abc"));
}

#[tokio::test(start_paused = true)]
async fn rate_limit_delay_is_clamped_to_min_wait() {
	let transport = ScriptedTransport::new([too_many_requests("req-1"), ok()]);
	let pipeline = pipeline(&transport).with_backoff(Some(BackoffSettings::default()));
	let started = Instant::now();

	get(&pipeline, &RequestContext::new()).await.expect("Retry should succeed.");

	let waited = started.elapsed();

	assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31), "{waited:?}");
}

#[tokio::test(start_paused = true)]
async fn inverted_wait_bounds_wait_the_maximum() {
	let transport = ScriptedTransport::new([too_many_requests("req-1"), ok()]);
	let pipeline = pipeline(&transport).with_backoff(settings(10, 5, 3));
	let started = Instant::now();
	let response = get(&pipeline, &RequestContext::new()).await.expect("Retry should succeed.");
	let waited = started.elapsed();

	assert_eq!(response.status().as_u16(), 200);
	assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6), "{waited:?}");
	assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn rate_limit_without_reset_header_is_permanent() {
	let transport = ScriptedTransport::new([Scripted::respond(429, &[("date", DATE)], "")]);
	let pipeline = pipeline(&transport);
	let err = get(&pipeline, &RequestContext::new()).await.expect_err("Missing reset must fail.");

	assert!(matches!(err, Error::RateLimit(_)), "{err:?}");
	assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn internal_server_error_is_returned_without_retry() {
	let transport = ScriptedTransport::new([Scripted::respond(500, &[], "{}"), ok()]);
	let pipeline = pipeline(&transport);
	let response = get(&pipeline, &RequestContext::new()).await.expect("500 is a final response.");

	assert_eq!(response.status().as_u16(), 500);
	assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn request_scoped_statuses_are_retried() {
	let transport = ScriptedTransport::new([Scripted::respond(500, &[], "{}"), ok()]);
	let pipeline = pipeline(&transport);
	let cx = RequestContext::new().with_retry_on_status([500]);
	let response = get(&pipeline, &cx).await.expect("Opted-in 500 should be retried.");

	assert_eq!(response.status().as_u16(), 200);
	assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_report_attempts_and_last_failure() {
	let transport = ScriptedTransport::new([Scripted::respond(503, &[("x-okta-request-id", "req-503")], "")]);
	let pipeline = pipeline(&transport).with_backoff(settings(1, 5, 2));
	let err = get(&pipeline, &RequestContext::new()).await.expect_err("Persistent 503 must give up.");

	match err {
		Error::GaveUp { attempts, last } => {
			assert_eq!(attempts, 3);
			assert!(matches!(*last, Error::Api(ref api) if api.status == 503));
		},
		other => panic!("Unexpected error: {other:?}."),
	}

	assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn connection_resets_are_retried() {
	let transport = ScriptedTransport::new([Scripted::Reset, ok()]);
	let pipeline = pipeline(&transport);
	let response = get(&pipeline, &RequestContext::new()).await.expect("Reset should be retried.");
	let requests = transport.requests();

	assert_eq!(response.status().as_u16(), 200);
	assert_eq!(requests.len(), 2);
	assert_eq!(requests[1].header("x-okta-retry-for"), None);
	assert_eq!(requests[1].header("x-okta-retry-count"), Some("1"));
}

#[tokio::test]
async fn never_policy_and_disabled_backoff_return_first_response() {
	let never = ScriptedTransport::new([Scripted::respond(503, &[], ""), ok()]);
	let disabled = ScriptedTransport::new([too_many_requests("req-1"), ok()]);
	let cx = RequestContext::new();
	let first = get(&pipeline(&never).with_policy(RetryPolicy::Never), &cx)
		.await
		.expect("Never policy returns the response.");
	let second = get(&pipeline(&disabled).with_backoff(None), &cx)
		.await
		.expect("Disabled backoff returns the response.");

	assert_eq!(first.status().as_u16(), 503);
	assert_eq!(second.status().as_u16(), 429);
	assert_eq!(never.calls(), 1);
	assert_eq!(disabled.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_during_backoff_carries_the_last_failure() {
	let transport = ScriptedTransport::new([too_many_requests("req-1"), ok()]);
	let pipeline = pipeline(&transport).with_request_timeout(Some(Duration::from_secs(10)));
	let err = get(&pipeline, &RequestContext::new()).await.expect_err("Deadline must fire first.");

	match err {
		Error::Timeout { last: Some(last) } =>
			assert!(matches!(*last, Error::Api(ref api) if api.status == 429)),
		other => panic!("Unexpected error: {other:?}."),
	}

	assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn cancelled_request_is_never_dispatched() {
	let transport = ScriptedTransport::new([ok()]);
	let pipeline = pipeline(&transport);
	let cx = RequestContext::new();

	cx.cancel();

	assert!(matches!(get(&pipeline, &cx).await, Err(Error::Cancelled)));
	assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn unauthorized_static_credentials_fail_immediately() {
	let transport = ScriptedTransport::new([Scripted::respond(
		401,
		&[("content-type", "application/json"), ("x-okta-request-id", "req-401")],
		"{\"errorCode\":\"E0000011\",\"errorSummary\":\"Invalid token provided\"}",
	)]);
	let pipeline = pipeline(&transport);
	let err = get(&pipeline, &RequestContext::new()).await.expect_err("401 must fail.");

	assert!(err.is_authentication());
	assert_eq!(err.request_id(), Some("req-401"));
	assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn governor_feeds_the_table_and_holds_exhausted_classes() {
	let reset = (OffsetDateTime::now_utc().unix_timestamp() + 30).to_string();
	let transport = ScriptedTransport::new([Scripted::respond(
		200,
		&[
			("x-rate-limit-limit", "25"),
			("x-rate-limit-remaining", "1"),
			("x-rate-limit-reset", reset.as_str()),
		],
		"{}",
	)]);
	let pipeline = pipeline(&transport).with_governor(EndpointKeyer::default(), 10);

	get(&pipeline, &RequestContext::new()).await.expect("First request should pass.");

	assert_eq!(
		pipeline.rate_limits().get(&EndpointClass::USERS),
		RateLimitRecord::new(25, 1, reset.parse().expect("Reset should parse."))
	);

	let held = get(&pipeline, &RequestContext::new().with_timeout(Duration::from_secs(5))).await;

	assert!(matches!(held, Err(Error::Timeout { .. })), "{held:?}");
	assert_eq!(transport.calls(), 1);

	let apps = pipeline.request(Method::GET, "/api/v1/apps").expect("Request should build.");

	pipeline.execute(apps, &RequestContext::new()).await.expect("Other classes are unaffected.");

	assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn governor_outside_the_active_range_is_disabled() {
	let transport = ScriptedTransport::new([Scripted::respond(
		200,
		&[("x-rate-limit-limit", "25"), ("x-rate-limit-remaining", "0"), ("x-rate-limit-reset", "4102444800")],
		"{}",
	)]);
	let pipeline = pipeline(&transport).with_governor(EndpointKeyer::default(), 100);

	get(&pipeline, &RequestContext::new()).await.expect("First request should pass.");
	get(&pipeline, &RequestContext::new()).await.expect("Disabled governor never holds requests.");

	assert_eq!(transport.calls(), 2);
	assert!(pipeline.rate_limits().snapshot().is_empty());
}
