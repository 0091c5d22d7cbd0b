//! Query requests, predicate translation and chunk planning.

mod planner;
mod predicate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use planner::{find_chunks, ChunkQuery};
pub use predicate::{
    DimensionOp, DimensionPredicate, Filter, MetadataOp, MetadataPredicate, SqlFragment,
};

use crate::Result;

fn default_ascending() -> bool {
    true
}

/// A read request: inclusive time range, predicates and result shaping.
///
/// ```no_run
/// use strata::EventQuery;
///
/// let query = EventQuery::new(0, 3_600_000)
///     .metadata("host", "~^web-")
///     .dimension("cpu", ">=25")
///     .include_payloads(true)
///     .ascending(false)
///     .limit(100);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventQuery {
    pub start_ms: i64,
    pub end_ms: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    #[serde(default)]
    pub include_payloads: bool,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self {
            start_ms,
            end_ms,
            metadata: BTreeMap::new(),
            dimensions: BTreeMap::new(),
            include_payloads: false,
            ascending: true,
            limit: None,
        }
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata_query(mut self, query: BTreeMap<String, String>) -> Self {
        self.metadata = query;
        self
    }

    pub fn with_dimensions_query(mut self, query: BTreeMap<String, String>) -> Self {
        self.dimensions = query;
        self
    }

    pub fn include_payloads(mut self, include: bool) -> Self {
        self.include_payloads = include;
        self
    }

    pub fn ascending(mut self, ascending: bool) -> Self {
        self.ascending = ascending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filter(&self) -> Result<Filter> {
        Filter::parse(&self.metadata, &self.dimensions)
    }
}
