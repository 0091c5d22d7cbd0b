//! Chunk identity and layout.
//!
//! A chunk table holds the events of exactly one time window and one schema key.
//! Its name and its column names are pure functions of those two inputs, so every
//! process derives the same physical layout for the same events without any
//! coordination.

use std::collections::BTreeMap;
use std::fmt;

use time::OffsetDateTime;

use crate::config::DAY_MS;
use crate::event::Event;

/// Physical timestamp column of every chunk table.
pub const TIMESTAMP_COLUMN: &str = "ts";
/// Physical payload column of every chunk table.
pub const PAYLOAD_COLUMN: &str = "payload";

const KEY_SEPARATOR: &str = "\u{1f}";
const SCHEMA_HASH_LEN: usize = 16;
const COLUMN_HASH_LEN: usize = 8;
const COLUMN_STEM_LEN: usize = 24;

/// Start of the window containing `timestamp_ms`.
///
/// Floors towards negative infinity and saturates at the `i64` bounds.
pub fn window_start(timestamp_ms: i64, window_ms: i64) -> i64 {
    timestamp_ms.div_euclid(window_ms).saturating_mul(window_ms)
}

/// Human readable window label used in chunk table names.
///
/// Day-sized windows render as `YYYYMMDD`, second-aligned windows as
/// `YYYYMMDDHHMMSS`. Anything the calendar cannot express falls back to the raw
/// millisecond value.
pub fn window_label(window_start: i64, window_ms: i64) -> String {
    let raw = || {
        if window_start < 0 {
            format!("n{}", window_start.unsigned_abs())
        } else {
            format!("p{}", window_start)
        }
    };
    if window_ms % 1_000 != 0 {
        return raw();
    }
    let nanos = i128::from(window_start) * 1_000_000;
    let Ok(dt) = OffsetDateTime::from_unix_timestamp_nanos(nanos) else {
        return raw();
    };
    if dt.year() < 0 {
        return raw();
    }
    if window_ms % DAY_MS == 0 {
        format!("{:04}{:02}{:02}", dt.year(), u8::from(dt.month()), dt.day())
    } else {
        format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}",
            dt.year(),
            u8::from(dt.month()),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        )
    }
}

fn hex_digest(input: &str, len: usize) -> String {
    let hash = blake3::hash(input.as_bytes());
    let mut hex = hash.to_hex().to_string();
    hex.truncate(len);
    hex
}

/// Role of a logical key inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyKind {
    Timestamp,
    Metadata,
    Dimension,
}

impl KeyKind {
    /// Single character stored in the lookup table.
    pub fn code(self) -> &'static str {
        match self {
            KeyKind::Timestamp => "t",
            KeyKind::Metadata => "m",
            KeyKind::Dimension => "d",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "t" => Some(KeyKind::Timestamp),
            "m" => Some(KeyKind::Metadata),
            "d" => Some(KeyKind::Dimension),
            _ => None,
        }
    }
}

/// Stable physical column name for a logical key.
///
/// The key is lowercased, reduced to `[a-z0-9_]` and truncated, then suffixed with
/// a hash of the original key so that keys which normalize to the same stem still
/// get distinct columns.
pub fn column_name(kind: KeyKind, key: &str) -> String {
    if kind == KeyKind::Timestamp {
        return TIMESTAMP_COLUMN.to_string();
    }
    let stem: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(COLUMN_STEM_LEN)
        .collect();
    format!(
        "{}_{}_{}",
        kind.code(),
        stem,
        hex_digest(key, COLUMN_HASH_LEN)
    )
}

/// The sorted metadata and dimension key sets of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaKey {
    metadata: Vec<String>,
    dimensions: Vec<String>,
}

impl SchemaKey {
    pub fn new<M, D>(metadata: M, dimensions: D) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let mut metadata: Vec<String> = metadata.into_iter().map(Into::into).collect();
        let mut dimensions: Vec<String> = dimensions.into_iter().map(Into::into).collect();
        metadata.sort();
        metadata.dedup();
        dimensions.sort();
        dimensions.dedup();
        Self {
            metadata,
            dimensions,
        }
    }

    pub fn of(event: &Event) -> Self {
        // BTreeMap keys are already sorted and unique.
        Self {
            metadata: event.metadata.keys().cloned().collect(),
            dimensions: event.dimensions.keys().cloned().collect(),
        }
    }

    pub fn metadata(&self) -> &[String] {
        &self.metadata
    }

    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    /// `hash(metadata keys) + "_" + hash(dimension keys)`.
    pub fn hash(&self) -> String {
        format!(
            "{}_{}",
            hex_digest(&self.metadata.join(KEY_SEPARATOR), SCHEMA_HASH_LEN),
            hex_digest(&self.dimensions.join(KEY_SEPARATOR), SCHEMA_HASH_LEN)
        )
    }
}

/// Identity of one chunk: a window and a schema key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId {
    pub window_start: i64,
    pub schema: SchemaKey,
}

impl ChunkId {
    pub fn of(event: &Event, window_ms: i64) -> Self {
        Self {
            window_start: window_start(event.timestamp_ms, window_ms),
            schema: SchemaKey::of(event),
        }
    }

    pub fn table_name(&self, prefix: &str, window_ms: i64) -> String {
        format!(
            "{}{}_{}",
            prefix,
            window_label(self.window_start, window_ms),
            self.schema.hash()
        )
    }
}

/// One physical column of a chunk and the logical key it stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub kind: KeyKind,
    pub key: String,
    pub column: String,
}

/// Physical layout of a chunk table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub table: String,
    pub window_start: i64,
    /// Timestamp column first, then metadata and dimension columns sorted by key.
    pub columns: Vec<ColumnSpec>,
}

impl ChunkDescriptor {
    /// Derive the layout of a chunk from its identity.
    pub fn for_chunk(id: &ChunkId, prefix: &str, window_ms: i64) -> Self {
        let mut columns = Vec::with_capacity(1 + id.schema.metadata.len() + id.schema.dimensions.len());
        columns.push(ColumnSpec {
            kind: KeyKind::Timestamp,
            key: String::new(),
            column: TIMESTAMP_COLUMN.to_string(),
        });
        for key in &id.schema.metadata {
            columns.push(ColumnSpec {
                kind: KeyKind::Metadata,
                key: key.clone(),
                column: column_name(KeyKind::Metadata, key),
            });
        }
        for key in &id.schema.dimensions {
            columns.push(ColumnSpec {
                kind: KeyKind::Dimension,
                key: key.clone(),
                column: column_name(KeyKind::Dimension, key),
            });
        }
        Self {
            table: id.table_name(prefix, window_ms),
            window_start: id.window_start,
            columns,
        }
    }

    /// Rebuild a descriptor from lookup rows, sorting columns into canonical order.
    pub fn from_columns(table: String, window_start: i64, mut columns: Vec<ColumnSpec>) -> Self {
        columns.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.key.cmp(&b.key)));
        Self {
            table,
            window_start,
            columns,
        }
    }

    pub fn column_for(&self, kind: KeyKind, key: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.kind == kind && c.key == key)
            .map(|c| c.column.as_str())
    }

    /// Metadata and dimension columns, without the timestamp.
    pub fn value_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| c.kind != KeyKind::Timestamp)
    }

    pub fn schema(&self) -> SchemaKey {
        SchemaKey::new(
            self.columns
                .iter()
                .filter(|c| c.kind == KeyKind::Metadata)
                .map(|c| c.key.clone()),
            self.columns
                .iter()
                .filter(|c| c.kind == KeyKind::Dimension)
                .map(|c| c.key.clone()),
        )
    }
}

impl fmt::Display for ChunkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let schema = self.schema();
        write!(
            f,
            "{} window={} metadata=[{}] dimensions=[{}]",
            self.table,
            self.window_start,
            schema.metadata.join(","),
            schema.dimensions.join(",")
        )
    }
}

/// Group events by chunk identity, keeping batch order inside each group.
pub fn partition_events(events: &[Event], window_ms: i64) -> BTreeMap<ChunkId, Vec<&Event>> {
    let mut groups: BTreeMap<ChunkId, Vec<&Event>> = BTreeMap::new();
    for event in events {
        groups
            .entry(ChunkId::of(event, window_ms))
            .or_default()
            .push(event);
    }
    groups
}
