//! Endpoint classes and the path keyer that buckets requests into them.

// std
use std::{borrow::Borrow, borrow::Cow, ops::Deref};
// self
use crate::_prelude::*;

const CLASS_MAX_LEN: usize = 64;

/// Error returned when an endpoint class name fails validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ThisError)]
pub enum EndpointClassError {
	/// The class was empty.
	#[error("Endpoint class cannot be empty.")]
	Empty,
	/// The class contains whitespace characters.
	#[error("Endpoint class `{class}` contains whitespace.")]
	ContainsWhitespace {
		/// Offending class name.
		class: String,
	},
	/// The class exceeded the allowed character count.
	#[error("Endpoint class exceeds {max} characters.")]
	TooLong {
		/// Maximum permitted character count.
		max: usize,
	},
	/// Prefixes must be absolute paths.
	#[error("Endpoint prefix `{prefix}` must start with `/`.")]
	RelativePrefix {
		/// Offending prefix.
		prefix: String,
	},
}

/// Bucket under which the service advertises one shared rate limit.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointClass(Cow<'static, str>);
impl EndpointClass {
	/// `/api/v1/apps*`.
	pub const APPS: Self = Self(Cow::Borrowed("apps"));
	/// Everything without a dedicated bucket.
	pub const OTHER: Self = Self(Cow::Borrowed("other"));
	/// `/api/v1/users*`.
	pub const USERS: Self = Self(Cow::Borrowed("users"));

	/// Creates a class after validation.
	pub fn new(value: impl AsRef<str>) -> Result<Self, EndpointClassError> {
		let view = value.as_ref();

		validate(view)?;

		Ok(Self(Cow::Owned(view.to_owned())))
	}

	/// Class name.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl Deref for EndpointClass {
	type Target = str;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
impl AsRef<str> for EndpointClass {
	fn as_ref(&self) -> &str {
		&self.0
	}
}
impl Borrow<str> for EndpointClass {
	fn borrow(&self) -> &str {
		&self.0
	}
}
impl From<EndpointClass> for String {
	fn from(value: EndpointClass) -> Self {
		value.0.into_owned()
	}
}
impl TryFrom<String> for EndpointClass {
	type Error = EndpointClassError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		validate(&value)?;

		Ok(Self(Cow::Owned(value)))
	}
}
impl FromStr for EndpointClass {
	type Err = EndpointClassError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s)
	}
}
impl Debug for EndpointClass {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "EndpointClass({})", self.0)
	}
}
impl Display for EndpointClass {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0)
	}
}

/// Maps request paths to endpoint classes via exact prefix comparison.
///
/// When several prefixes match, the longest one wins, so `/api/v1/users/me/factors` can be
/// split out of `/api/v1/users` by configuration. Unmatched paths fall into
/// [`EndpointClass::OTHER`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointKeyer {
	// Sorted by descending prefix length.
	prefixes: Vec<(String, EndpointClass)>,
}
impl EndpointKeyer {
	/// Creates a keyer from `(prefix, class)` pairs.
	pub fn new<I, P>(prefixes: I) -> Result<Self, EndpointClassError>
	where
		I: IntoIterator<Item = (P, EndpointClass)>,
		P: Into<String>,
	{
		let mut table = Vec::new();

		for (prefix, class) in prefixes {
			let prefix = prefix.into();

			if !prefix.starts_with('/') {
				return Err(EndpointClassError::RelativePrefix { prefix });
			}

			table.retain(|(existing, _): &(String, EndpointClass)| existing != &prefix);
			table.push((prefix, class));
		}

		table.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

		Ok(Self { prefixes: table })
	}

	/// Default table recognizing the apps and users buckets.
	pub fn okta_default() -> Self {
		Self {
			prefixes: vec![
				("/api/v1/users".into(), EndpointClass::USERS),
				("/api/v1/apps".into(), EndpointClass::APPS),
			],
		}
	}

	/// Returns a keyer with the extra `(prefix, class)` pairs layered over this one.
	pub fn extend<I, P>(&self, extra: I) -> Result<Self, EndpointClassError>
	where
		I: IntoIterator<Item = (P, EndpointClass)>,
		P: Into<String>,
	{
		let merged = self
			.prefixes
			.iter()
			.cloned()
			.chain(extra.into_iter().map(|(prefix, class)| (prefix.into(), class)))
			.collect::<Vec<_>>();

		Self::new(merged)
	}

	/// Buckets `path` into its endpoint class.
	pub fn classify(&self, path: &str) -> EndpointClass {
		self.prefixes
			.iter()
			.find(|(prefix, _)| path.starts_with(prefix.as_str()))
			.map(|(_, class)| class.clone())
			.unwrap_or(EndpointClass::OTHER)
	}
}
impl Default for EndpointKeyer {
	fn default() -> Self {
		Self::okta_default()
	}
}

fn validate(view: &str) -> Result<(), EndpointClassError> {
	if view.is_empty() {
		return Err(EndpointClassError::Empty);
	}
	if view.chars().any(char::is_whitespace) {
		return Err(EndpointClassError::ContainsWhitespace { class: view.to_owned() });
	}
	if view.len() > CLASS_MAX_LEN {
		return Err(EndpointClassError::TooLong { max: CLASS_MAX_LEN });
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn default_table_buckets_users_and_apps() {
		let keyer = EndpointKeyer::default();

		assert_eq!(keyer.classify("/api/v1/users"), EndpointClass::USERS);
		assert_eq!(keyer.classify("/api/v1/users/00u1/lifecycle/activate"), EndpointClass::USERS);
		assert_eq!(keyer.classify("/api/v1/apps/0oa1/groups"), EndpointClass::APPS);
		assert_eq!(keyer.classify("/api/v1/groups"), EndpointClass::OTHER);
		assert_eq!(keyer.classify("/API/v1/users"), EndpointClass::OTHER);
		assert_eq!(keyer.classify(""), EndpointClass::OTHER);
	}

	#[test]
	fn classify_is_pure() {
		let keyer = EndpointKeyer::default();
		let paths = ["/api/v1/apps", "/api/v1/groups", "/api/v1/users/me"];
		let forward = paths.iter().map(|p| keyer.classify(p)).collect::<Vec<_>>();
		let backward = paths.iter().rev().map(|p| keyer.classify(p)).collect::<Vec<_>>();

		assert_eq!(forward, backward.into_iter().rev().collect::<Vec<_>>());
	}

	#[test]
	fn longest_configured_prefix_wins() {
		let factors = EndpointClass::new("factors").expect("Class fixture should be valid.");
		let keyer = EndpointKeyer::default()
			.extend([("/api/v1/users/me/factors", factors.clone())])
			.expect("Extension should succeed.");

		assert_eq!(keyer.classify("/api/v1/users/me/factors/ost1"), factors);
		assert_eq!(keyer.classify("/api/v1/users/me"), EndpointClass::USERS);
	}

	#[test]
	fn classes_and_prefixes_are_validated() {
		assert!(EndpointClass::new("").is_err());
		assert!(EndpointClass::new("two words").is_err());
		assert!(EndpointClass::new("x".repeat(CLASS_MAX_LEN + 1)).is_err());
		assert!(serde_json::from_str::<EndpointClass>("\"groups\"").is_ok());
		assert!(matches!(
			EndpointKeyer::new([("api/v1/groups", EndpointClass::OTHER)]),
			Err(EndpointClassError::RelativePrefix { .. })
		));
	}

	#[test]
	fn borrow_supports_lookup_by_name() {
		let map = HashMap::from([(EndpointClass::USERS, 1_u8)]);

		assert_eq!(map.get("users"), Some(&1));
	}
}
