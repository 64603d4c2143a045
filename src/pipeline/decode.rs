//! Content-type driven response decoding and management API error extraction.

// crates.io
use oauth2::http::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
// self
use crate::{
	_prelude::*,
	error::{ApiError, DecodeError},
	transport::{self, HttpResponse, REQUEST_ID},
};

/// Media families the decoder understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
	/// `application/json` and `*+json`.
	Json,
	/// `application/xml`, `text/xml`, and `*+xml`.
	Xml,
	/// `application/octet-stream`.
	OctetStream,
}
impl ContentKind {
	/// Classifies a `Content-Type` value, ignoring parameters and case.
	pub fn from_header(raw: &str) -> Option<Self> {
		let essence = raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();

		match essence.as_str() {
			"application/json" => Some(Self::Json),
			"application/xml" | "text/xml" => Some(Self::Xml),
			"application/octet-stream" => Some(Self::OctetStream),
			other if other.ends_with("+json") => Some(Self::Json),
			other if other.ends_with("+xml") => Some(Self::Xml),
			_ => None,
		}
	}
}

/// Decoded response body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded<T> {
	/// The body was empty.
	Empty,
	/// JSON or XML body decoded into `T`.
	Value(T),
	/// Raw octet-stream body, left to the caller.
	Bytes(Vec<u8>),
}
impl<T> Decoded<T> {
	/// Returns the decoded value, if any.
	pub fn into_value(self) -> Option<T> {
		match self {
			Self::Value(value) => Some(value),
			Self::Empty | Self::Bytes(_) => None,
		}
	}
}

/// Decodes `response` according to its `Content-Type`.
///
/// An absent `Content-Type` is read as JSON, the API's default representation.
pub fn decode<T>(response: &HttpResponse) -> Result<Decoded<T>, DecodeError>
where
	T: DeserializeOwned,
{
	let body = response.body();

	if body.is_empty() {
		return Ok(Decoded::Empty);
	}

	let kind = match transport::header_str(response.headers(), CONTENT_TYPE.as_str()) {
		None => ContentKind::Json,
		Some(raw) => ContentKind::from_header(raw)
			.ok_or_else(|| DecodeError::UnsupportedContentType { content_type: raw.to_owned() })?,
	};

	match kind {
		ContentKind::Json => decode_json(body).map(Decoded::Value),
		ContentKind::Xml => Ok(Decoded::Value(quick_xml::de::from_reader(body.as_slice())?)),
		ContentKind::OctetStream => Ok(Decoded::Bytes(body.clone())),
	}
}

/// Decodes a JSON body, reporting the failing path on mismatch.
pub fn decode_json<T>(body: &[u8]) -> Result<T, DecodeError>
where
	T: DeserializeOwned,
{
	let mut deserializer = serde_json::Deserializer::from_slice(body);

	Ok(serde_path_to_error::deserialize(&mut deserializer)?)
}

/// Builds an [`ApiError`] from a non-success response.
///
/// Understands the management API shape (`errorCode`, `errorSummary`, `errorCauses`) and the
/// OAuth shape (`error`, `error_description`); other bodies leave the fields empty.
pub fn api_error(response: &HttpResponse) -> ApiError {
	let body = serde_json::from_slice::<ErrorBody>(response.body()).unwrap_or_default();

	ApiError {
		status: response.status().as_u16(),
		code: body.error_code.or(body.error),
		summary: body.error_summary.or(body.error_description),
		causes: body.error_causes.into_iter().filter_map(|cause| cause.error_summary).collect(),
		request_id: transport::header_str(response.headers(), REQUEST_ID).map(str::to_owned),
	}
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ErrorBody {
	error_code: Option<String>,
	error_summary: Option<String>,
	error_causes: Vec<ErrorCause>,
	#[serde(rename = "error")]
	error: Option<String>,
	#[serde(rename = "error_description")]
	error_description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ErrorCause {
	error_summary: Option<String>,
}
