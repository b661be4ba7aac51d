use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Chat/user identifier that owns watches and receives notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned watch identifier. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchId(pub u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marketplace sources reachable through the proxy aggregator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Mercari,
    Rakuten,
    Yahoo,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Mercari, Platform::Rakuten, Platform::Yahoo];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Mercari => "mercari",
            Platform::Rakuten => "rakuten",
            Platform::Yahoo => "yahoo",
        }
    }

    /// Only auction listings carry an end time.
    pub fn has_end_times(&self) -> bool {
        matches!(self, Platform::Yahoo)
    }

    pub fn default_sort(&self) -> SortOrder {
        match self {
            Platform::Mercari | Platform::Yahoo => SortOrder::Newest,
            Platform::Rakuten => SortOrder::SourceDefault,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Mercari => "Mercari",
            Platform::Rakuten => "Rakuten",
            Platform::Yahoo => "Yahoo",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("unsupported platform: {0} (expected mercari, rakuten or yahoo)")]
    Unsupported(String),
}

impl FromStr for Platform {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mercari" => Ok(Platform::Mercari),
            "rakuten" => Ok(Platform::Rakuten),
            "yahoo" => Ok(Platform::Yahoo),
            other => Err(PlatformError::Unsupported(other.to_string())),
        }
    }
}

/// Result ordering, both for the upstream query and for notification order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Whatever order the source returns.
    SourceDefault,
    Newest,
    PriceAsc,
    EndingSoonest,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::SourceDefault => "source_default",
            SortOrder::Newest => "newest",
            SortOrder::PriceAsc => "price_asc",
            SortOrder::EndingSoonest => "ending_soonest",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source_default" => Ok(SortOrder::SourceDefault),
            "newest" => Ok(SortOrder::Newest),
            "price_asc" => Ok(SortOrder::PriceAsc),
            "ending_soonest" => Ok(SortOrder::EndingSoonest),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}
