//! Client-side rate-limit governor for Okta management API traffic: endpoint-class budget
//! accounting, admission control, 429-aware retries, and DPoP-capable authorization behind a
//! single request pipeline.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod oauth;
pub mod obs;
pub mod pipeline;
pub mod ratelimit;
pub mod retry;
pub mod transport;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::collections::VecDeque;
	// self
	use crate::{
		http::ReqwestHttpClient,
		transport::{HttpRequest, HttpResponse, RequestContext, RoundTrip, RoundTripFuture},
	};

	/// Builds a reqwest HTTP client that accepts the self-signed certificates produced by
	/// `httpmock` during tests.
	pub fn test_reqwest_http_client() -> ReqwestHttpClient {
		let client = ReqwestClient::builder()
			.danger_accept_invalid_certs(true)
			.danger_accept_invalid_hostnames(true)
			.redirect(reqwest::redirect::Policy::none())
			.build()
			.expect("Failed to build insecure Reqwest client for tests.");

		ReqwestHttpClient::with_client(client)
	}

	/// Builds a buffered response with the provided status, headers, and body.
	pub fn response(status: u16, headers: &[(&str, &str)], body: &str) -> HttpResponse {
		let mut builder = oauth2::http::Response::builder().status(status);

		for (name, value) in headers {
			builder = builder.header(*name, *value);
		}

		builder.body(body.as_bytes().to_vec()).expect("Test response fixture should build.")
	}

	/// Scripted outcome replayed by [`ScriptedTransport`].
	#[derive(Clone, Debug)]
	pub enum Scripted {
		/// Respond with the given status, headers, and body.
		Respond {
			/// HTTP status code.
			status: u16,
			/// Response headers.
			headers: Vec<(String, String)>,
			/// Response body.
			body: String,
		},
		/// Fail with a transient connection reset.
		Reset,
	}
	impl Scripted {
		/// Convenience constructor for [`Scripted::Respond`].
		pub fn respond(status: u16, headers: &[(&str, &str)], body: &str) -> Self {
			Self::Respond {
				status,
				headers: headers.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect(),
				body: body.to_owned(),
			}
		}
	}

	/// Request snapshot recorded by [`ScriptedTransport`].
	#[derive(Clone, Debug)]
	pub struct RecordedRequest {
		/// HTTP method.
		pub method: String,
		/// Full request URI.
		pub uri: String,
		/// Request headers.
		pub headers: oauth2::http::HeaderMap,
		/// Buffered body.
		pub body: Vec<u8>,
	}
	impl RecordedRequest {
		/// Returns the header value as a string, if present.
		pub fn header(&self, name: &str) -> Option<&str> {
			self.headers.get(name).and_then(|value| value.to_str().ok())
		}
	}

	/// In-memory [`RoundTrip`] that replays scripted outcomes and records every request.
	///
	/// Once the script runs dry the last outcome is repeated.
	#[derive(Clone, Default)]
	pub struct ScriptedTransport {
		script: Arc<Mutex<VecDeque<Scripted>>>,
		last: Arc<Mutex<Option<Scripted>>>,
		requests: Arc<Mutex<Vec<RecordedRequest>>>,
	}
	impl ScriptedTransport {
		/// Creates a transport that replays the provided outcomes in order.
		pub fn new(outcomes: impl IntoIterator<Item = Scripted>) -> Self {
			let transport = Self::default();

			transport.script.lock().extend(outcomes);

			transport
		}

		/// Returns every request observed so far.
		pub fn requests(&self) -> Vec<RecordedRequest> {
			self.requests.lock().clone()
		}

		/// Number of dispatched requests.
		pub fn calls(&self) -> usize {
			self.requests.lock().len()
		}

		fn next(&self) -> Result<HttpResponse> {
			let outcome = match self.script.lock().pop_front() {
				Some(outcome) => {
					*self.last.lock() = Some(outcome.clone());

					outcome
				},
				None => self.last.lock().clone().expect("Scripted transport needs an outcome."),
			};

			match outcome {
				Scripted::Respond { status, headers, body } => {
					let headers =
						headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect::<Vec<_>>();

					Ok(response(status, &headers, &body))
				},
				Scripted::Reset => Err(crate::error::TransportError::Io(std::io::Error::from(
					std::io::ErrorKind::ConnectionReset,
				))
				.into()),
			}
		}
	}
	impl RoundTrip for ScriptedTransport {
		fn round_trip<'a>(
			&'a self,
			request: HttpRequest,
			_cx: &'a RequestContext,
		) -> RoundTripFuture<'a> {
			Box::pin(async move {
				self.requests.lock().push(RecordedRequest {
					method: request.method().to_string(),
					uri: request.uri().to_string(),
					headers: request.headers().clone(),
					body: request.body().clone(),
				});

				self.next()
			})
		}
	}

	/// Reads a PEM fixture from `tests/fixtures`.
	pub fn fixture(name: &str) -> String {
		let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);

		std::fs::read_to_string(&path).expect("Test fixture should be readable.")
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
		time::Duration,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::OffsetDateTime;
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

pub use reqwest;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _};
