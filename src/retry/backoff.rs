//! Backoff scheduling: 429 delays derived from server headers, bounded retry counting, and the
//! diagnostic headers stamped on retried requests.

// crates.io
use oauth2::http::{HeaderMap, header::DATE};
use time::{PrimitiveDateTime, format_description::well_known::Rfc2822, macros::format_description};
// self
use crate::{
	_prelude::*,
	error::RateLimitError,
	retry::Attempt,
	transport::{self, RATE_LIMIT_RESET, REQUEST_ID, RETRY_COUNT, RETRY_FOR},
};

/// Tunables for [`BackoffController`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffSettings {
	/// Lower bound applied to rate-limit delays.
	pub min_wait: Duration,
	/// Upper bound applied to rate-limit delays.
	pub max_wait: Duration,
	/// Maximum number of retries after the first attempt.
	pub max_retries: u32,
	/// Delay between attempts that carry no rate-limit headers.
	pub default_delay: Duration,
}
impl BackoffSettings {
	/// Overrides the delay used for non-429 retries.
	pub fn with_default_delay(mut self, delay: Duration) -> Self {
		self.default_delay = delay;

		self
	}
}
impl Default for BackoffSettings {
	fn default() -> Self {
		Self {
			min_wait: Duration::from_secs(30),
			max_wait: Duration::from_secs(300),
			max_retries: 5,
			default_delay: Duration::from_secs(1),
		}
	}
}

/// Per-request retry bookkeeping.
#[derive(Clone, Debug)]
pub struct BackoffController {
	settings: BackoffSettings,
	retry_count: u32,
}
impl BackoffController {
	/// Starts a fresh controller for one logical request.
	pub fn new(settings: BackoffSettings) -> Self {
		Self { settings, retry_count: 0 }
	}

	/// Retries performed so far.
	pub fn retry_count(&self) -> u32 {
		self.retry_count
	}

	/// Dispatch attempts performed so far, counting the one in flight.
	pub fn attempts(&self) -> u32 {
		self.retry_count + 1
	}

	/// Delay to wait before retrying after `attempt`.
	///
	/// A `429` response yields `X-Rate-Limit-Reset − Date + 1` seconds clamped to
	/// `[min_wait, max_wait]`; a missing, unreadable, or out-of-range header is a permanent
	/// [`RateLimitError`]. Anything else waits the default delay.
	pub fn delay_for(&self, attempt: Attempt<'_>) -> Result<Duration, RateLimitError> {
		match attempt {
			Attempt::Response(response) if response.status().as_u16() == 429 =>
				self.rate_limit_delay(response.headers()),
			_ => Ok(self.settings.default_delay),
		}
	}

	/// Computes the 429 delay from `Date` and `X-Rate-Limit-Reset`.
	pub fn rate_limit_delay(&self, headers: &HeaderMap) -> Result<Duration, RateLimitError> {
		let request_id = transport::header_str(headers, REQUEST_ID).map(str::to_owned);
		let fail = |reason: &str| RateLimitError {
			reason: reason.to_owned(),
			request_id: request_id.clone(),
		};
		let date = transport::header_str(headers, DATE.as_str())
			.ok_or_else(|| fail("missing Date header"))?;
		let date = parse_http_date(date).ok_or_else(|| fail("unparseable Date header"))?;
		let reset = transport::header_str(headers, RATE_LIMIT_RESET)
			.ok_or_else(|| fail("missing X-Rate-Limit-Reset header"))?
			.parse::<i64>()
			.map_err(|_| fail("unparseable X-Rate-Limit-Reset header"))?;
		let secs = reset
			.checked_sub(date.unix_timestamp())
			.and_then(|delta| delta.checked_add(1))
			.ok_or_else(|| fail("X-Rate-Limit-Reset out of range"))?;
		let secs = u64::try_from(secs).unwrap_or(0);

		Ok(self.clamp(Duration::from_secs(secs)))
	}

	// `max_wait` wins when the bounds are inverted.
	fn clamp(&self, delay: Duration) -> Duration {
		delay.max(self.settings.min_wait).min(self.settings.max_wait)
	}

	/// Consumes one retry. Returns `false` once `max_retries` is exhausted.
	pub fn register_retry(&mut self) -> bool {
		if self.retry_count >= self.settings.max_retries {
			return false;
		}

		self.retry_count += 1;

		true
	}

	/// Stamps the retry diagnostics onto a reissued request.
	pub fn annotate(&self, headers: &mut HeaderMap, prior_request_id: Option<&str>) {
		if let Some(id) = prior_request_id {
			transport::set_header(headers, RETRY_FOR, id);
		}

		transport::set_header(headers, RETRY_COUNT, &self.retry_count.to_string());
	}
}

/// Parses an HTTP date, preferring the RFC 7231 IMF-fixdate form.
pub fn parse_http_date(raw: &str) -> Option<OffsetDateTime> {
	let imf_fixdate = format_description!(
		"[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
	);

	PrimitiveDateTime::parse(raw.trim(), &imf_fixdate)
		.map(PrimitiveDateTime::assume_utc)
		.or_else(|_| OffsetDateTime::parse(raw.trim(), &Rfc2822))
		.ok()
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{_preludet::*, transport::HttpResponse};

	fn too_many(headers: &[(&str, &str)]) -> HttpResponse {
		response(429, headers, "{\"errorCode\":\"E0000047\"}")
	}

	#[test]
	fn reset_minus_date_plus_fence() {
		let controller = BackoffController::new(BackoffSettings {
			min_wait: Duration::from_secs(1),
			..Default::default()
		});
		let response = too_many(&[
			("date", "Mon, 01 Jan 2024 00:00:00 GMT"),
			(RATE_LIMIT_RESET, "1704067210"),
		]);

		assert_eq!(
			controller.delay_for(Attempt::Response(&response)).expect("Headers are well formed."),
			Duration::from_secs(11)
		);
	}

	#[test]
	fn delay_is_clamped_to_wait_bounds() {
		let response = too_many(&[
			("date", "Mon, 01 Jan 2024 00:00:00 GMT"),
			(RATE_LIMIT_RESET, "1704067210"),
		]);
		let floor = BackoffController::new(BackoffSettings::default());
		let ceiling = BackoffController::new(BackoffSettings {
			min_wait: Duration::from_secs(1),
			max_wait: Duration::from_secs(5),
			..Default::default()
		});

		assert_eq!(floor.rate_limit_delay(response.headers()).ok(), Some(Duration::from_secs(30)));
		assert_eq!(ceiling.rate_limit_delay(response.headers()).ok(), Some(Duration::from_secs(5)));
	}

	#[test]
	fn extreme_resets_never_overflow() {
		let controller = BackoffController::new(BackoffSettings::default());
		let ancient = too_many(&[
			("date", "Mon, 01 Jan 2024 00:00:00 GMT"),
			(RATE_LIMIT_RESET, "-9223372036854775808"),
			(REQUEST_ID, "req-min"),
		]);
		let distant = too_many(&[
			("date", "Mon, 01 Jan 2024 00:00:00 GMT"),
			(RATE_LIMIT_RESET, "9223372036854775807"),
		]);
		let err = controller
			.delay_for(Attempt::Response(&ancient))
			.expect_err("An unrepresentable delay must fail permanently.");

		assert!(err.reason.contains("out of range"));
		assert_eq!(err.request_id.as_deref(), Some("req-min"));
		assert_eq!(
			controller.delay_for(Attempt::Response(&distant)).ok(),
			Some(Duration::from_secs(300))
		);
	}

	#[test]
	fn inverted_bounds_fall_back_to_max_wait() {
		let controller = BackoffController::new(BackoffSettings {
			min_wait: Duration::from_secs(10),
			max_wait: Duration::from_secs(5),
			..Default::default()
		});
		let response = too_many(&[
			("date", "Mon, 01 Jan 2024 00:00:00 GMT"),
			(RATE_LIMIT_RESET, "1704067201"),
		]);

		assert_eq!(controller.rate_limit_delay(response.headers()).ok(), Some(Duration::from_secs(5)));
	}

	#[test]
	fn missing_or_bad_headers_are_permanent() {
		let controller = BackoffController::new(BackoffSettings::default());
		let no_date = too_many(&[(RATE_LIMIT_RESET, "1704067210"), (REQUEST_ID, "req-9")]);
		let bad_reset =
			too_many(&[("date", "Mon, 01 Jan 2024 00:00:00 GMT"), (RATE_LIMIT_RESET, "soon")]);
		let err = controller
			.delay_for(Attempt::Response(&no_date))
			.expect_err("A missing Date header must not produce a guessed delay.");

		assert_eq!(err.request_id.as_deref(), Some("req-9"));
		assert!(err.reason.contains("Date"));
		assert!(controller.rate_limit_delay(bad_reset.headers()).is_err());
	}

	#[test]
	fn other_outcomes_use_default_delay() {
		let controller = BackoffController::new(
			BackoffSettings::default().with_default_delay(Duration::from_millis(250)),
		);
		let unavailable = response(503, &[], "");
		let reset = Error::Cancelled;

		assert_eq!(
			controller.delay_for(Attempt::Response(&unavailable)).ok(),
			Some(Duration::from_millis(250))
		);
		assert_eq!(
			controller.delay_for(Attempt::Failed(&reset)).ok(),
			Some(Duration::from_millis(250))
		);
	}

	#[test]
	fn retries_are_bounded() {
		let mut controller =
			BackoffController::new(BackoffSettings { max_retries: 2, ..Default::default() });

		assert!(controller.register_retry());
		assert!(controller.register_retry());
		assert!(!controller.register_retry());
		assert_eq!(controller.attempts(), 3);
	}

	#[test]
	fn annotate_sets_retry_headers() {
		let mut controller = BackoffController::new(BackoffSettings::default());
		let mut headers = HeaderMap::new();

		controller.register_retry();
		controller.annotate(&mut headers, Some("req-1"));

		assert_eq!(transport::header_str(&headers, RETRY_FOR), Some("req-1"));
		assert_eq!(transport::header_str(&headers, RETRY_COUNT), Some("1"));
	}

	#[test]
	fn http_dates_parse_in_both_forms() {
		let expected = OffsetDateTime::from_unix_timestamp(1_704_067_200).expect("Valid timestamp.");

		assert_eq!(parse_http_date("Mon, 01 Jan 2024 00:00:00 GMT"), Some(expected));
		assert_eq!(parse_http_date("Mon, 01 Jan 2024 00:00:00 +0000"), Some(expected));
		assert_eq!(parse_http_date("yesterday"), None);
	}
}
