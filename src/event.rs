//! Event and namespace types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum namespace name length.
pub const MAX_NAMESPACE_LEN: usize = 64;

/// An immutable event: a timestamp, string metadata, numeric dimensions and an
/// optional opaque payload.
///
/// Keys are kept in `BTreeMap`s so an event's schema key and its column order are
/// stable without extra sorting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp_ms: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub dimensions: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
}

impl Event {
    pub fn new(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            metadata: BTreeMap::new(),
            dimensions: BTreeMap::new(),
            payload: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_dimension(mut self, key: impl Into<String>, value: f64) -> Self {
        self.dimensions.insert(key.into(), value);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Reject values the backend cannot round-trip.
    pub fn validate(&self) -> Result<()> {
        if let Some((key, _)) = self.dimensions.iter().find(|(_, v)| v.is_nan()) {
            return Err(Error::InvalidEvent(format!(
                "dimension '{}' at {} is NaN",
                key, self.timestamp_ms
            )));
        }
        Ok(())
    }
}

/// A validated namespace name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_NAMESPACE_LEN {
            return Err(Error::InvalidNamespace(format!(
                "'{}' must be 1..={} characters",
                name, MAX_NAMESPACE_LEN
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::InvalidNamespace(format!(
                "'{}' may only contain [A-Za-z0-9_-]",
                name
            )));
        }
        // Reserved for the registry catalog.
        if name.starts_with('_') {
            return Err(Error::InvalidNamespace(format!(
                "'{}' must not start with '_'",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Namespace {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Namespace::new(value)
    }
}

impl TryFrom<&str> for Namespace {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Namespace::new(value)
    }
}

impl From<Namespace> for String {
    fn from(value: Namespace) -> Self {
        value.0
    }
}
