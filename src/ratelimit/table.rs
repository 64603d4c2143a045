//! Concurrent per-class rate-limit records with a monotonic update rule.

// self
use crate::{_prelude::*, ratelimit::EndpointClass};

/// Responses whose window ended this many seconds before the stored one are stale.
pub const STALE_WINDOW_SECS: i64 = 60;

/// Last observed rate-limit budget for one endpoint class.
///
/// The three fields always move together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
	/// Total budget for the current window.
	pub limit: u64,
	/// Budget left in the current window.
	pub remaining: u64,
	/// Unix epoch second at which the window ends.
	pub reset: i64,
}
impl RateLimitRecord {
	/// Creates a record from a header triple.
	pub const fn new(limit: u64, remaining: u64, reset: i64) -> Self {
		Self { limit, remaining, reset }
	}

	/// Returns `true` when the client may still spend budget in this window.
	///
	/// A zero `limit` means nothing is known yet and always has capacity. Otherwise the class has
	/// capacity iff `remaining > limit * (1 - percent / 100)`, evaluated in integers.
	pub fn has_capacity(&self, percent: u8) -> bool {
		if self.limit == 0 {
			return true;
		}

		let reserved = u128::from(self.limit) * u128::from(100_u8.saturating_sub(percent.min(100)));

		u128::from(self.remaining) * 100 > reserved
	}

	/// Seconds until the window resets, never negative.
	pub fn seconds_until_reset(&self, now: OffsetDateTime) -> u64 {
		u64::try_from(self.reset - now.unix_timestamp()).unwrap_or(0)
	}
}

/// Effect of a [`RateLimitTable::update`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
	/// A newer window replaced the whole record.
	Replaced,
	/// Same window; the higher remaining count was kept.
	Raised,
	/// Same window; nothing changed.
	Unchanged,
	/// The update belongs to an expired window and was discarded.
	Stale,
}

/// Process-local table of [`RateLimitRecord`]s keyed by [`EndpointClass`].
///
/// Every operation takes a short critical section with no I/O under the lock.
#[derive(Debug, Default)]
pub struct RateLimitTable(Mutex<HashMap<EndpointClass, RateLimitRecord>>);
impl RateLimitTable {
	/// Returns a snapshot for `class`, creating a zeroed record on first reference.
	pub fn get(&self, class: &EndpointClass) -> RateLimitRecord {
		*self.0.lock().entry(class.clone()).or_default()
	}

	/// Applies an observed header triple.
	///
	/// - `reset <= stored.reset - 60`: stale, discarded.
	/// - `reset > stored.reset`: the whole triple is replaced.
	/// - otherwise the observation belongs to the current window and only a higher `remaining`
	///   is written, since concurrent responses report counts taken before competing requests
	///   landed.
	pub fn update(&self, class: &EndpointClass, observed: RateLimitRecord) -> UpdateOutcome {
		let mut guard = self.0.lock();
		let current = guard.entry(class.clone()).or_default();

		if observed.reset <= current.reset.saturating_sub(STALE_WINDOW_SECS) {
			return UpdateOutcome::Stale;
		}
		if observed.reset > current.reset {
			*current = observed;

			return UpdateOutcome::Replaced;
		}
		if observed.remaining > current.remaining {
			current.remaining = observed.remaining;

			return UpdateOutcome::Raised;
		}

		UpdateOutcome::Unchanged
	}

	/// Returns `true` when `class` still has capacity under `percent`.
	pub fn has_capacity(&self, class: &EndpointClass, percent: u8) -> bool {
		self.get(class).has_capacity(percent)
	}

	/// Snapshot of every known class.
	pub fn snapshot(&self) -> BTreeMap<EndpointClass, RateLimitRecord> {
		self.0.lock().iter().map(|(class, record)| (class.clone(), *record)).collect()
	}
}
