//! Partitioned multi-dimensional time-series event store.
//!
//! Events carry a timestamp, string metadata, numeric dimensions and an optional
//! payload. They are sharded into relational "chunk" tables, one per time window
//! and distinct key set, and a per-namespace lookup table records which chunks
//! exist and which physical column holds each logical key. Reads plan candidate
//! chunks from the lookup table, run one statement per chunk on a shared worker
//! pool and merge the results.

pub mod aggregate;
pub mod backend;
pub mod chunk;
pub mod config;
pub mod error;
pub mod event;
pub mod expire;
pub mod fanout;
pub mod lookup;
pub mod query;
pub mod schema;
pub mod store;
pub mod write;

pub use aggregate::AggregateFunction;
pub use chunk::ChunkDescriptor;
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use event::{Event, Namespace};
pub use fanout::FailurePolicy;
pub use query::EventQuery;
pub use store::EventStore;
