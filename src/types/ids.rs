use uuid::Uuid;
use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{Error, Result};

macro_rules! define_id_type {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id_type!(RequestId);

const MAX_SYMBOL_LEN: usize = 12;

/// Asset pair identifier in `ASSET-QUOTE` form, e.g. `ETH-USD`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedId(String);

impl FeedId {
    /// Parses and upper-cases a feed id. Both halves must be 1..=12
    /// ASCII alphanumerics.
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        let mut parts = normalized.split('-');
        let (Some(asset), Some(quote), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::InvalidRequest(format!(
                "feed id '{}' must have the form ASSET-QUOTE", raw
            )));
        };

        for symbol in [asset, quote] {
            if symbol.is_empty()
                || symbol.len() > MAX_SYMBOL_LEN
                || !symbol.chars().all(|c| c.is_ascii_alphanumeric())
            {
                return Err(Error::InvalidRequest(format!(
                    "feed id '{}' has an invalid symbol '{}'", raw, symbol
                )));
            }
        }

        Ok(FeedId(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn asset(&self) -> &str {
        self.0.split('-').next().unwrap_or_default()
    }

    pub fn quote(&self) -> &str {
        self.0.split('-').nth(1).unwrap_or_default()
    }
}

impl TryFrom<String> for FeedId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        FeedId::parse(&value)
    }
}

impl From<FeedId> for String {
    fn from(id: FeedId) -> Self {
        id.0
    }
}

impl std::str::FromStr for FeedId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FeedId::parse(s)
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one circuit breaker: a single source serving a single feed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BreakerKey {
    pub feed_id: FeedId,
    pub source_name: String,
}

impl BreakerKey {
    pub fn new(feed_id: FeedId, source_name: impl Into<String>) -> Self {
        BreakerKey {
            feed_id,
            source_name: source_name.into(),
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feed_id, self.source_name)
    }
}
