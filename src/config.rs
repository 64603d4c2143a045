//! Pipeline configuration: org location, credentials, backoff bounds, and governor settings.
//!
//! [`Config::load`] layers an optional TOML file under `OKTA_*` environment variables
//! (`OKTA_ORG_URL`, `OKTA_API_TOKEN`, `OKTA_MAX_RETRIES`, ...). Every option has a default, so
//! a bare `Config::default()` plus an org and a credential is a complete configuration.

// std
use std::path::Path;
// crates.io
use ::config::{Environment, File, FileFormat};
use reqwest::{Proxy, redirect::Policy};
// self
use crate::{
	_prelude::*,
	auth::{AuthMode, AuthModeKind, ClientAssertionSigner, ScopeSet, Secret},
	error::ConfigError,
	http::ReqwestHttpClient,
	ratelimit::{EndpointClass, EndpointKeyer},
	retry::BackoffSettings,
};

/// Prefix of the environment variables read by [`Config::load`].
pub const ENV_PREFIX: &str = "OKTA";
/// Path of the org authorization server's token endpoint.
pub const TOKEN_PATH: &str = "/oauth2/v1/token";

/// Recognized configuration options.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Org base URL, e.g. `https://example.okta.com`.
	pub org_url: Option<Url>,
	/// Org subdomain, combined with `domain` when `org_url` is unset.
	pub org_name: Option<String>,
	/// Org domain.
	pub domain: String,
	/// Forward proxy. An `http://` proxy disables certificate verification.
	pub http_proxy: Option<Url>,
	/// Authorization mode.
	pub auth_mode: AuthModeKind,
	/// API token for `SSWS`.
	pub api_token: Option<Secret>,
	/// Access token for `Bearer`.
	pub access_token: Option<Secret>,
	/// PEM private key, or a path to one, for `PrivateKey`.
	pub private_key: Option<Secret>,
	/// `kid` header of signed client assertions.
	pub private_key_id: Option<String>,
	/// OAuth client id for `PrivateKey` and `JWT`.
	pub client_id: Option<String>,
	/// Scopes requested with every token.
	pub scopes: ScopeSet,
	/// Pre-built client assertion for `JWT`.
	pub client_assertion: Option<Secret>,
	/// Enables the retry layer.
	pub backoff: bool,
	/// Lower backoff bound, seconds.
	pub min_wait: u64,
	/// Upper backoff bound, seconds.
	pub max_wait: u64,
	/// Retry cap per logical request.
	pub max_retries: u32,
	/// Total per-request timeout in seconds; `0` disables it.
	pub request_timeout: u64,
	/// Share of the advertised budget the client consumes voluntarily.
	pub max_api_capacity_percent: Option<u8>,
	/// Appended to the `User-Agent` header.
	pub user_agent_extra: Option<String>,
	/// Extra `path prefix -> endpoint class` mappings.
	pub endpoint_classes: BTreeMap<String, String>,
}
impl Config {
	/// Loads the optional TOML file at `path`, then `OKTA_*` environment overrides.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let mut builder = ::config::Config::builder();

		if let Some(path) = path {
			builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
		}

		let config = builder
			.add_source(Environment::with_prefix(ENV_PREFIX))
			.build()?
			.try_deserialize::<Self>()?;

		config.validate()?;

		Ok(config)
	}

	/// Checks option ranges and the credentials of the selected mode.
	pub fn validate(&self) -> Result<(), ConfigError> {
		self.base_url()?;

		if self.min_wait > self.max_wait {
			return Err(ConfigError::InvalidOption {
				option: "min_wait",
				reason: format!("{} exceeds max_wait ({})", self.min_wait, self.max_wait),
			});
		}
		if let Some(percent) = self.max_api_capacity_percent.filter(|percent| *percent > 100) {
			return Err(ConfigError::InvalidOption {
				option: "max_api_capacity_percent",
				reason: format!("{percent} is above 100"),
			});
		}
		if let Some(proxy) =
			self.http_proxy.as_ref().filter(|proxy| !matches!(proxy.scheme(), "http" | "https"))
		{
			return Err(ConfigError::InvalidOption {
				option: "http_proxy",
				reason: format!("unsupported scheme {}", proxy.scheme()),
			});
		}

		self.keyer()?;
		self.auth_mode()?;

		Ok(())
	}

	/// Base URL of API requests.
	pub fn base_url(&self) -> Result<Url, ConfigError> {
		if let Some(url) = &self.org_url {
			return Ok(url.clone());
		}

		let org_name = self
			.org_name
			.as_deref()
			.filter(|name| !name.is_empty())
			.ok_or(ConfigError::MissingOption { option: "org_url" })?;

		Url::parse(&format!("https://{org_name}.{}", self.domain))
			.map_err(|source| ConfigError::InvalidUrl { option: "org_name", source })
	}

	/// Token endpoint of the org authorization server.
	pub fn token_url(&self) -> Result<Url, ConfigError> {
		let base = self.base_url()?;

		Url::parse(&format!("{}{TOKEN_PATH}", base.as_str().trim_end_matches('/')))
			.map_err(|source| ConfigError::InvalidUrl { option: "org_url", source })
	}

	/// Resolves the credentials of the selected mode.
	pub fn auth_mode(&self) -> Result<AuthMode, ConfigError> {
		match self.auth_mode {
			AuthModeKind::Ssws =>
				Ok(AuthMode::Ssws { api_token: required(&self.api_token, "api_token")?.clone() }),
			AuthModeKind::Bearer => Ok(AuthMode::Bearer {
				access_token: required(&self.access_token, "access_token")?.clone(),
			}),
			AuthModeKind::PrivateKey => {
				let client_id = self.client_id()?;
				let pem = read_private_key(required(&self.private_key, "private_key")?)?;
				let mut signer = ClientAssertionSigner::from_pem(
					client_id,
					self.token_url()?.as_str(),
					pem.expose(),
				)?;

				if let Some(key_id) = &self.private_key_id {
					signer = signer.with_key_id(key_id);
				}

				Ok(AuthMode::PrivateKey { scopes: self.scopes.clone(), signer })
			},
			AuthModeKind::Jwt => Ok(AuthMode::Jwt {
				client_id: self.client_id()?.to_owned(),
				scopes: self.scopes.clone(),
				assertion: required(&self.client_assertion, "client_assertion")?.clone(),
			}),
		}
	}

	/// Endpoint keyer: the built-in table plus `endpoint_classes`.
	pub fn keyer(&self) -> Result<EndpointKeyer, ConfigError> {
		let extra = self
			.endpoint_classes
			.iter()
			.map(|(prefix, class)| Ok((prefix.clone(), EndpointClass::new(class)?)))
			.collect::<Result<Vec<_>, ConfigError>>()?;

		Ok(EndpointKeyer::default().extend(extra)?)
	}

	/// Backoff bounds.
	pub fn backoff_settings(&self) -> BackoffSettings {
		BackoffSettings {
			min_wait: Duration::from_secs(self.min_wait),
			max_wait: Duration::from_secs(self.max_wait),
			max_retries: self.max_retries,
			..Default::default()
		}
	}

	/// Per-request timeout, when enabled.
	pub fn request_timeout(&self) -> Option<Duration> {
		(self.request_timeout > 0).then(|| Duration::from_secs(self.request_timeout))
	}

	/// Capacity percent when the governor is active.
	pub fn governor_percent(&self) -> Option<u8> {
		self.max_api_capacity_percent.filter(|percent| (1..=99).contains(percent))
	}

	/// `User-Agent` value: crate version, platform, and `user_agent_extra`.
	pub fn user_agent(&self) -> String {
		let base = format!(
			"{}/{} {}/{}",
			env!("CARGO_PKG_NAME"),
			env!("CARGO_PKG_VERSION"),
			std::env::consts::OS,
			std::env::consts::ARCH
		);

		match self.user_agent_extra.as_deref().map(str::trim).filter(|extra| !extra.is_empty()) {
			Some(extra) => format!("{base} {extra}"),
			None => base,
		}
	}

	/// Builds the reqwest client used for API and token requests.
	///
	/// Redirects are never followed.
	pub fn http_client(&self) -> Result<ReqwestHttpClient, ConfigError> {
		let mut builder = ReqwestClient::builder().redirect(Policy::none());

		if let Some(proxy) = &self.http_proxy {
			builder = builder.proxy(Proxy::all(proxy.as_str())?);

			if proxy.scheme() == "http" {
				builder = builder.danger_accept_invalid_certs(true);
			}
		}

		Ok(ReqwestHttpClient::with_client(builder.build()?))
	}

	fn client_id(&self) -> Result<&str, ConfigError> {
		self.client_id
			.as_deref()
			.filter(|id| !id.is_empty())
			.ok_or(ConfigError::MissingOption { option: "client_id" })
	}
}
impl Default for Config {
	fn default() -> Self {
		Self {
			org_url: None,
			org_name: None,
			domain: "okta.com".into(),
			http_proxy: None,
			auth_mode: AuthModeKind::default(),
			api_token: None,
			access_token: None,
			private_key: None,
			private_key_id: None,
			client_id: None,
			scopes: ScopeSet::default(),
			client_assertion: None,
			backoff: true,
			min_wait: 30,
			max_wait: 300,
			max_retries: 5,
			request_timeout: 0,
			max_api_capacity_percent: None,
			user_agent_extra: None,
			endpoint_classes: BTreeMap::new(),
		}
	}
}

fn required<'a>(value: &'a Option<Secret>, option: &'static str) -> Result<&'a Secret, ConfigError> {
	value.as_ref().filter(|secret| !secret.is_empty()).ok_or(ConfigError::MissingOption { option })
}

// Accepts inline PEM or a path to a PEM file.
fn read_private_key(value: &Secret) -> Result<Secret, ConfigError> {
	if value.expose().contains("-----BEGIN") {
		return Ok(value.clone());
	}

	std::fs::read_to_string(value.expose())
		.map(Secret::from)
		.map_err(|e| ConfigError::invalid_key(format!("private_key file could not be read: {e}")))
}
