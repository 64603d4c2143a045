//! Strategy deciding whether a completed attempt should be retried.

// self
use crate::{
	_prelude::*,
	transport::{HttpResponse, RequestContext},
};

/// Result of a single dispatch attempt, as seen by the retry layer.
#[derive(Clone, Copy, Debug)]
pub enum Attempt<'a> {
	/// The server answered.
	Response(&'a HttpResponse),
	/// The attempt failed before a response was available.
	Failed(&'a Error),
}
impl Attempt<'_> {
	/// HTTP status, when the server answered.
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::Response(response) => Some(response.status().as_u16()),
			Self::Failed(_) => None,
		}
	}
}

/// Retry strategy.
///
/// Every policy first honors cancellation, then the request-scoped status list carried by the
/// [`RequestContext`], then refuses to retry `500`. Only after those rules does the strategy
/// itself decide.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RetryPolicy {
	/// Retries transient transport errors, `429`, and `5xx` other than `500`/`501`.
	#[default]
	Default,
	/// Retries only the listed statuses.
	OnStatus(Vec<u16>),
	/// Never retries.
	Never,
	/// Retries when any member policy would.
	Compose(Vec<RetryPolicy>),
}
impl RetryPolicy {
	/// Shorthand for [`RetryPolicy::OnStatus`].
	pub fn on_status(codes: impl IntoIterator<Item = u16>) -> Self {
		Self::OnStatus(codes.into_iter().collect())
	}

	/// Returns `Ok(true)` when the caller should back off and try again.
	///
	/// Errors are terminal; the context error is returned when `cx` was cancelled or expired.
	pub fn should_retry(&self, cx: &RequestContext, attempt: Attempt<'_>) -> Result<bool> {
		cx.check()?;

		if let Some(status) = attempt.status() {
			if cx.retry_on_status().is_some_and(|codes| codes.contains(&status)) {
				return Ok(true);
			}
			if status == 500 {
				return Ok(false);
			}
		}

		Ok(self.decide(attempt))
	}

	fn decide(&self, attempt: Attempt<'_>) -> bool {
		match self {
			Self::Default => match attempt {
				Attempt::Response(response) => {
					let status = response.status().as_u16();

					status == 429 || (502..600).contains(&status)
				},
				Attempt::Failed(err) => err.is_transient(),
			},
			Self::OnStatus(codes) => attempt.status().is_some_and(|status| codes.contains(&status)),
			Self::Never => false,
			Self::Compose(policies) => policies.iter().any(|policy| policy.decide(attempt)),
		}
	}
}
