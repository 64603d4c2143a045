//! `Link` header parsing for cursor pagination.

// crates.io
use oauth2::http::{HeaderMap, header::LINK};
// self
use crate::_prelude::*;

/// One `<target>; rel="..."` entry of a `Link` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
	/// Absolute target URL.
	pub url: Url,
	/// Relation types, e.g. `next` or `self`.
	pub rel: Vec<String>,
}
impl Link {
	/// Returns `true` when `rel` lists `relation`.
	pub fn has_rel(&self, relation: &str) -> bool {
		self.rel.iter().any(|rel| rel.eq_ignore_ascii_case(relation))
	}
}

/// Parses every `Link` header in `headers`. Entries with unparseable targets are skipped.
pub fn parse(headers: &HeaderMap) -> Vec<Link> {
	let mut links = Vec::new();

	for value in headers.get_all(LINK) {
		if let Ok(raw) = value.to_str() {
			parse_value(raw, &mut links);
		}
	}

	links
}

/// Target of the `rel="next"` link, if the response has another page.
pub fn next_link(headers: &HeaderMap) -> Option<Url> {
	parse(headers).into_iter().find(|link| link.has_rel("next")).map(|link| link.url)
}

fn parse_value(raw: &str, links: &mut Vec<Link>) {
	let mut rest = raw;

	while let Some(open) = rest.find('<') {
		let Some(close) = rest[open..].find('>').map(|offset| open + offset) else {
			return;
		};
		let target = rest[open + 1..close].trim();

		rest = &rest[close + 1..];

		let params_end = rest.find('<').unwrap_or(rest.len());
		let rel: Vec<String> = rest[..params_end]
			.split(';')
			.filter_map(|param| param.trim().trim_end_matches(',').split_once('='))
			.find(|(name, _)| name.trim().eq_ignore_ascii_case("rel"))
			.map(|(_, value)| {
				value.trim().trim_matches('"').split_whitespace().map(str::to_owned).collect()
			})
			.unwrap_or_default();

		match Url::parse(target) {
			Ok(url) => links.push(Link { url, rel }),
			Err(e) => tracing::debug!(link = target, error = %e, "Skipping unparseable Link target."),
		}
	}
}
