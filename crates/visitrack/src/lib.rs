// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A sharded, in-memory session tracker with incremental per-domain statistics.
//!
//! This crate provides [`Sessions`], a store that ingests a stream of timestamped hits keyed by
//! `(domain, uid)` and groups them into sessions. It keeps a bounded, recency-ordered window of
//! live sessions per shard, evicts sessions that outlive a time-to-live or overflow a capacity
//! bound, and maintains per-domain hit, session, bounce, and duration counters without ever
//! rescanning the session set.
//!
//! # Architecture
//!
//! Sessions are partitioned across a fixed array of [`Storage`] shards. Each shard owns:
//!
//! - a recency-ordered session map, most recently touched session first;
//! - a domain rollup implementing [`Domains`], by default a [`DomainTable`];
//! - one mutex guarding both, held for the duration of every operation on the shard.
//!
//! Shards are selected by a [`Route`]: either the hash of the domain, which keeps every session
//! of a domain and its statistics on one shard, or an explicit caller-supplied shard key.
//! Shards never contend with each other and are cache-line aligned to prevent false sharing.
//!
//! # Sessions and windows
//!
//! A session covers the window `[left_ts, right_ts]` of the hits it has received. A hit after
//! the window extends it to the right, a hit before it extends it to the left, and a hit inside
//! it only counts. Hits may therefore arrive out of order. A session expires once the current
//! time is more than the TTL away from either side of its window.
//!
//! # Eviction
//!
//! Every update first sweeps the least recently touched end of its shard, evicting sessions while
//! the shard is over capacity or while the oldest session has expired. With
//! [deferred eviction](SessionsBuilder::deferred), sweeps only enforce capacity and expiry is
//! detected when a session's own key is next updated; the stale session is then evicted and a
//! fresh one started. Evicted sessions are handed to an [`Evict`] observer.
//!
//! # Domain statistics
//!
//! | Counter | Meaning |
//! | :--- | :--- |
//! | `hits` | Hits across the domain's live sessions. |
//! | `sessions` | Live sessions of the domain. |
//! | `bounces` | Live sessions with exactly one hit. |
//! | `duration` | Sum of the window widths of live sessions. |
//!
//! Counters are adjusted on every create, hit, and removal, so they always equal a recount over
//! the domain's live sessions. A domain has no statistics entry once its last session is gone.
//!
//! # Example
//!
//! ```
//! use visitrack::{DomainStat, Sessions};
//!
//! let sessions = Sessions::<&str, u64, ()>::builder()
//!     .shards(4)
//!     .ttl(15)
//!     .capacity_per_shard(10)
//!     .build();
//!
//! let mut evicted = Vec::new();
//! sessions.update(1, "example.com", 1, || (), &mut evicted);
//! let update = sessions.update(2, "example.com", 1, || (), &mut evicted);
//! assert_eq!(update.diff, 1);
//! assert_eq!(
//!     sessions.stat(&"example.com"),
//!     DomainStat { hits: 2, sessions: 1, bounces: 0, duration: 1 }
//! );
//!
//! // Twenty time units later the session has expired and is swept before a new one starts.
//! sessions.update(22, "example.com", 1, || (), &mut evicted);
//! assert_eq!(evicted.len(), 1);
//! assert_eq!(sessions.stat(&"example.com").bounces, 1);
//! ```
//!
//! # Logging
//!
//! The crate emits [`tracing`] events: `DEBUG` when a store is built, cleared, or flushed, and
//! `TRACE` for every evicted session. No subscriber is installed.

mod config;
mod domains;
mod error;
pub mod evict;
mod order;
mod session;
mod sessions;
mod storage;

pub use config::{DEFAULT_SHARDS, InsideHits, SessionsConfig, ShardSettings};
pub use domains::{DomainStat, DomainTable, Domains, NoDomains, StatRow};
pub use error::ConfigError;
pub use evict::{Discard, Evict};
pub use order::{Iter, NodeIndex, OrderedMap};
pub use session::{Entry, Extension, Session, SessionKey, Update};
pub use sessions::{Route, Sessions, SessionsBuilder, SizeReport};
pub use storage::Storage;

#[cfg(test)]
mod tests;
