//! HTTP transport primitives shared by token acquisition and API dispatch.
//!
//! [`TokenHttpClient`] hands the token exchange short-lived [`AsyncHttpClient`] handles that each
//! carry a [`ResponseMetadataSlot`] plus any extra request headers (the DPoP proof of the
//! current attempt). Implementations call [`ResponseMetadataSlot::take`] before dispatching and
//! [`ResponseMetadataSlot::store`] once a status is known, so error mapping and DPoP nonce
//! negotiation see the metadata of the attempt that just finished.
//!
//! [`ReqwestHttpClient`] is also the base [`RoundTrip`] of the request pipeline.

// std
use std::ops::Deref;
// crates.io
use oauth2::{
	AsyncHttpClient, HttpClientError, HttpRequest, HttpResponse,
	http::{HeaderMap, StatusCode},
};
// self
use crate::{
	_prelude::*,
	error::{ConfigError, TransportError},
	transport::{self, DPOP_NONCE, REQUEST_ID, RequestContext, RoundTrip, RoundTripFuture},
};

/// Abstraction over HTTP transports capable of executing token exchanges while publishing
/// response metadata.
///
/// Implementations must be `Send + Sync + 'static` and the handles they return must own
/// whatever state their request futures need, so those futures stay `Send`.
pub trait TokenHttpClient
where
	Self: 'static + Send + Sync,
{
	/// Concrete error emitted by the underlying transport.
	type TransportError: 'static + Send + Sync + StdError;

	/// [`AsyncHttpClient`] handle tied to a [`ResponseMetadataSlot`].
	type Handle: for<'c> AsyncHttpClient<
			'c,
			Error = HttpClientError<Self::TransportError>,
			Future: 'c + Send,
		>
		+ 'static
		+ Send
		+ Sync;

	/// Builds a handle that adds `headers` to every request and records outcomes in `slot`.
	///
	/// # Metadata Contract
	///
	/// - Call [`ResponseMetadataSlot::take`] before submitting the HTTP request so stale
	///   information never leaks across attempts.
	/// - Once an HTTP response (successful or erroneous) is available, save its metadata with
	///   [`ResponseMetadataSlot::store`].
	fn with_metadata(&self, slot: ResponseMetadataSlot, headers: HeaderMap) -> Self::Handle;
}

/// Metadata of the most recent token endpoint response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseMetadata {
	/// HTTP status code, if available.
	pub status: Option<u16>,
	/// `DPoP-Nonce` header value.
	pub dpop_nonce: Option<String>,
	/// `X-Okta-Request-Id` header value.
	pub request_id: Option<String>,
}
impl ResponseMetadata {
	/// Extracts metadata from a response status and headers.
	pub fn from_parts(status: StatusCode, headers: &HeaderMap) -> Self {
		Self {
			status: Some(status.as_u16()),
			dpop_nonce: transport::header_str(headers, DPOP_NONCE).map(str::to_owned),
			request_id: transport::header_str(headers, REQUEST_ID).map(str::to_owned),
		}
	}
}

/// Thread-safe slot for sharing [`ResponseMetadata`] between transport and error layers.
#[derive(Clone, Debug, Default)]
pub struct ResponseMetadataSlot(Arc<Mutex<Option<ResponseMetadata>>>);
impl ResponseMetadataSlot {
	/// Stores new metadata for the current request.
	pub fn store(&self, meta: ResponseMetadata) {
		*self.0.lock() = Some(meta);
	}

	/// Returns the captured metadata, if any, consuming it from the slot.
	pub fn take(&self) -> Option<ResponseMetadata> {
		self.0.lock().take()
	}
}

/// Thin wrapper around [`ReqwestClient`] so shared HTTP behavior lives in one place.
///
/// Configure any custom client to disable redirect following: token endpoints answer
/// directly, and API redirects are surfaced to the caller untouched.
#[derive(Clone, Default)]
pub struct ReqwestHttpClient(pub ReqwestClient);
impl ReqwestHttpClient {
	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}

	/// Builds an instrumented handle that captures response metadata.
	pub(crate) fn instrumented(
		&self,
		slot: ResponseMetadataSlot,
		headers: HeaderMap,
	) -> InstrumentedHandle {
		let client = InstrumentedHttpClient { client: self.0.clone(), slot, headers };

		InstrumentedHandle(Arc::new(client))
	}
}
impl AsRef<ReqwestClient> for ReqwestHttpClient {
	fn as_ref(&self) -> &ReqwestClient {
		&self.0
	}
}
impl Deref for ReqwestHttpClient {
	type Target = ReqwestClient;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
impl Debug for ReqwestHttpClient {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("ReqwestHttpClient(..)")
	}
}
impl TokenHttpClient for ReqwestHttpClient {
	type Handle = InstrumentedHandle;
	type TransportError = ReqwestError;

	fn with_metadata(&self, slot: ResponseMetadataSlot, headers: HeaderMap) -> Self::Handle {
		self.instrumented(slot, headers)
	}
}
impl RoundTrip for ReqwestHttpClient {
	fn round_trip<'a>(
		&'a self,
		request: HttpRequest,
		cx: &'a RequestContext,
	) -> RoundTripFuture<'a> {
		Box::pin(cx.run(async move {
			dispatch(&self.0, request).await.map_err(|e| {
				if e.is_builder() {
					Error::from(ConfigError::from(e))
				} else {
					Error::from(TransportError::from(e))
				}
			})
		}))
	}
}

/// Instrumented adapter that implements [`AsyncHttpClient`] for reqwest.
pub(crate) struct InstrumentedHttpClient {
	client: ReqwestClient,
	slot: ResponseMetadataSlot,
	headers: HeaderMap,
}

/// Handle returned by [`ReqwestHttpClient`] that satisfies [`TokenHttpClient`].
#[derive(Clone)]
pub struct InstrumentedHandle(Arc<InstrumentedHttpClient>);
impl<'c> AsyncHttpClient<'c> for InstrumentedHandle {
	type Error = HttpClientError<ReqwestError>;
	type Future =
		Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'c + Send + Sync>>;

	fn call(&'c self, mut request: HttpRequest) -> Self::Future {
		let client = Arc::clone(&self.0);

		Box::pin(async move {
			client.slot.take();

			for (name, value) in client.headers.iter() {
				request.headers_mut().insert(name.clone(), value.clone());
			}

			let response = dispatch(&client.client, request).await.map_err(Box::new)?;

			client.slot.store(ResponseMetadata::from_parts(response.status(), response.headers()));

			Ok(response)
		})
	}
}

/// Executes `request` and buffers the whole body.
async fn dispatch(
	client: &ReqwestClient,
	request: HttpRequest,
) -> Result<HttpResponse, ReqwestError> {
	let response = client.execute(request.try_into()?).await?;
	let status = response.status();
	let version = response.version();
	let headers = response.headers().to_owned();
	let mut buffered = HttpResponse::new(response.bytes().await?.to_vec());

	*buffered.status_mut() = status;
	*buffered.version_mut() = version;
	*buffered.headers_mut() = headers;

	Ok(buffered)
}
