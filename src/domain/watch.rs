use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Platform, SortOrder, UserId, WatchId};

/// A persisted request to be told about listings matching some criteria.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Watch {
    pub id: WatchId,
    pub user: UserId,
    pub platform: Platform,
    pub query: String,
    /// Inclusive upper bound in JPY.
    pub max_price: Option<f64>,
    /// Set for ending-soon watches: only auctions ending within this many minutes match.
    pub max_minutes: Option<u32>,
    pub sort: SortOrder,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Watch {
    pub fn is_ending_soon(&self) -> bool {
        self.max_minutes.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    /// Key under which identical upstream requests are coalesced.
    pub fn fetch_key(&self) -> FetchKey {
        FetchKey {
            platform: self.platform,
            query: self.query.clone(),
            sort: self.sort,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FetchKey {
    pub platform: Platform,
    pub query: String,
    pub sort: SortOrder,
}

/// Input for creating a watch; validated before the store assigns an id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewWatch {
    pub user: UserId,
    pub platform: Platform,
    pub query: String,
    pub max_price: Option<f64>,
    pub max_minutes: Option<u32>,
    pub sort: SortOrder,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum WatchValidationError {
    #[error("query cannot be empty")]
    EmptyQuery,
    #[error("max price must be a non-negative number, got {0}")]
    InvalidMaxPrice(f64),
    #[error("max minutes must be positive")]
    InvalidMaxMinutes,
    #[error("{0} listings have no end time; ending-soon watches need yahoo")]
    NoEndTimes(Platform),
}

impl NewWatch {
    /// Standard watch: notify on anything at or below `max_price`.
    pub fn standard(user: UserId, platform: Platform, query: &str, max_price: Option<f64>) -> Self {
        Self {
            user,
            platform,
            query: query.trim().to_string(),
            max_price,
            max_minutes: None,
            sort: platform.default_sort(),
            expires_at: None,
        }
    }

    /// Ending-soon watch: additionally bounded by auction time remaining.
    pub fn ending_soon(
        user: UserId,
        platform: Platform,
        query: &str,
        max_price: Option<f64>,
        max_minutes: u32,
    ) -> Self {
        Self {
            user,
            platform,
            query: query.trim().to_string(),
            max_price,
            max_minutes: Some(max_minutes),
            sort: SortOrder::EndingSoonest,
            expires_at: None,
        }
    }

    /// The watch is retired once `at` passes.
    pub fn with_expiry(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = at;
        self
    }

    pub fn validate(&self) -> Result<(), WatchValidationError> {
        if self.query.trim().is_empty() {
            return Err(WatchValidationError::EmptyQuery);
        }
        if let Some(p) = self.max_price {
            if !p.is_finite() || p < 0.0 {
                return Err(WatchValidationError::InvalidMaxPrice(p));
            }
        }
        if let Some(m) = self.max_minutes {
            if m == 0 {
                return Err(WatchValidationError::InvalidMaxMinutes);
            }
            if !self.platform.has_end_times() {
                return Err(WatchValidationError::NoEndTimes(self.platform));
            }
        }
        Ok(())
    }

    pub fn into_watch(self, id: WatchId, created_at: DateTime<Utc>) -> Watch {
        Watch {
            id,
            user: self.user,
            platform: self.platform,
            query: self.query,
            max_price: self.max_price,
            max_minutes: self.max_minutes,
            sort: self.sort,
            created_at,
            expires_at: self.expires_at,
            active: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_price_is_rejected() {
        let w = NewWatch::standard(UserId(1), Platform::Mercari, "plush", Some(-1.0));
        assert_eq!(
            w.validate(),
            Err(WatchValidationError::InvalidMaxPrice(-1.0))
        );
    }

    #[test]
    fn zero_price_is_allowed() {
        let w = NewWatch::standard(UserId(1), Platform::Mercari, "plush", Some(0.0));
        assert!(w.validate().is_ok());
    }

    #[test]
    fn blank_query_is_rejected() {
        let w = NewWatch::standard(UserId(1), Platform::Rakuten, "   ", None);
        assert_eq!(w.validate(), Err(WatchValidationError::EmptyQuery));
    }

    #[test]
    fn ending_soon_requires_auction_platform() {
        let w = NewWatch::ending_soon(UserId(1), Platform::Mercari, "figure", None, 30);
        assert_eq!(
            w.validate(),
            Err(WatchValidationError::NoEndTimes(Platform::Mercari))
        );

        let w = NewWatch::ending_soon(UserId(1), Platform::Yahoo, "figure", None, 0);
        assert_eq!(w.validate(), Err(WatchValidationError::InvalidMaxMinutes));
    }

    #[test]
    fn default_sorts_follow_platform() {
        let m = NewWatch::standard(UserId(1), Platform::Mercari, "a", None);
        assert_eq!(m.sort, SortOrder::Newest);
        let r = NewWatch::standard(UserId(1), Platform::Rakuten, "a", None);
        assert_eq!(r.sort, SortOrder::SourceDefault);
        let e = NewWatch::ending_soon(UserId(1), Platform::Yahoo, "a", None, 10);
        assert_eq!(e.sort, SortOrder::EndingSoonest);
    }
}
