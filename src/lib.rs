//! # StrataDB
//!
//! A temporal, versioned key/value state store for a blockchain execution
//! engine. Hot data lives in RocksDB; completed aggregation steps are
//! compacted into immutable file triples (data, key-to-offset index,
//! optional locality bitmap) and merged up a bounded ladder in the
//! background.
//!
//! Three read paths, one per storage tier:
//! - latest value of a key (`Domain`),
//! - value of a key as of a txnum (`History`),
//! - sorted txnums at which a key was touched (`InvertedIndex`).
//!
//! The `Aggregator` ties the domains (accounts, storage, code,
//! commitment) and the four inverted indices (log addresses, log topics,
//! trace-from, trace-to) together as one atomic whole, and drives the
//! commitment trie over every state touch.

pub mod aggregator;
pub mod commitment;
pub mod config;
pub mod domain;
pub mod ef;
pub mod error;
pub mod etl;
pub mod files;
pub mod history;
pub mod inverted_index;
pub mod kv;
pub mod locality;
pub mod logging;

pub use aggregator::{Aggregator, AggregatorContext, AggregatorStep};
pub use commitment::CommitmentMode;
pub use config::StoreConfig;
pub use error::{Result, StrataError};
