//! Freshness and cacheability rules.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use axum::http::{HeaderMap, StatusCode, header};

/// Validity used when neither the status nor 200 has a configured duration.
pub const FALLBACK_VALIDITY: Duration = Duration::from_secs(10 * 60);

const DEFAULT_VALIDITY: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_STATUSES: [u16; 3] = [200, 301, 302];

/// Per-status validity table checked against an entry's modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshnessPolicy {
    validity: BTreeMap<u16, Duration>,
}

impl FreshnessPolicy {
    /// An empty table; every lookup resolves to [`FALLBACK_VALIDITY`].
    pub fn empty() -> Self {
        Self {
            validity: BTreeMap::new(),
        }
    }

    /// Set `duration` for each status; an empty list applies it to 200.
    pub fn with_validity(mut self, duration: Duration, statuses: &[u16]) -> Self {
        if statuses.is_empty() {
            self.validity.insert(200, duration);
        } else {
            for status in statuses {
                self.validity.insert(*status, duration);
            }
        }
        self
    }

    /// How long an entry with `status` stays fresh.
    pub fn validity(&self, status: u16) -> Duration {
        self.validity
            .get(&status)
            .or_else(|| self.validity.get(&200))
            .copied()
            .unwrap_or(FALLBACK_VALIDITY)
    }

    /// Whether an entry last modified at `modified` is still fresh at `now`.
    ///
    /// A modification time ahead of `now` (clock skew) counts as fresh.
    pub fn is_fresh(&self, status: u16, modified: SystemTime, now: SystemTime) -> bool {
        match now.duration_since(modified) {
            Ok(age) => age <= self.validity(status),
            Err(_) => true,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (u16, Duration)> + '_ {
        self.validity.iter().map(|(status, duration)| (*status, *duration))
    }
}

impl Default for FreshnessPolicy {
    /// Seven days for 200, 301 and 302.
    fn default() -> Self {
        Self::empty().with_validity(DEFAULT_VALIDITY, &DEFAULT_STATUSES)
    }
}

/// Outcome of inspecting a response head before its first byte goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheability {
    /// Persist the response; advertise `max_age_secs` to the client.
    Store { max_age_secs: u64 },
    Bypass(BypassReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    SetCookie,
    Expired,
    NoStore,
    NoCache,
    Private,
    InvalidMaxAge,
}

impl BypassReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetCookie => "set_cookie",
            Self::Expired => "expired",
            Self::NoStore => "no_store",
            Self::NoCache => "no_cache",
            Self::Private => "private",
            Self::InvalidMaxAge => "invalid_max_age",
        }
    }
}

/// Decide whether a response with these headers and status may be cached.
pub fn decide(
    headers: &HeaderMap,
    status: StatusCode,
    policy: &FreshnessPolicy,
    now: SystemTime,
) -> Cacheability {
    if headers.contains_key(header::SET_COOKIE) {
        return Cacheability::Bypass(BypassReason::SetCookie);
    }

    if let Some(expires) = headers.get(header::EXPIRES) {
        let still_valid = expires
            .to_str()
            .ok()
            .and_then(|value| httpdate::parse_http_date(value.trim()).ok())
            .is_some_and(|at| at > now);
        if !still_valid {
            return Cacheability::Bypass(BypassReason::Expired);
        }
    }

    let mut max_age: Option<&str> = None;
    let directives = headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(|c: char| c == ',' || c.is_ascii_whitespace()))
        .filter(|token| !token.is_empty());

    for directive in directives {
        let lowered = directive.to_ascii_lowercase();
        if lowered == "no-store" {
            return Cacheability::Bypass(BypassReason::NoStore);
        }
        if lowered.starts_with("no-cache") {
            return Cacheability::Bypass(BypassReason::NoCache);
        }
        if lowered.starts_with("private") {
            return Cacheability::Bypass(BypassReason::Private);
        }
        if lowered.starts_with("max-age=") && max_age.is_none() {
            max_age = Some(&directive["max-age=".len()..]);
        }
    }

    if let Some(age) = max_age {
        return match age.trim_matches('"').parse::<i64>() {
            Ok(age) if age > 0 => Cacheability::Store {
                max_age_secs: age as u64,
            },
            _ => Cacheability::Bypass(BypassReason::InvalidMaxAge),
        };
    }

    Cacheability::Store {
        max_age_secs: policy.validity(status.as_u16()).as_secs(),
    }
}
