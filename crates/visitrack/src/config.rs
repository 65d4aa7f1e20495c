// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Store configuration.

/// Default number of shards used by [`SessionsBuilder`](crate::SessionsBuilder).
pub const DEFAULT_SHARDS: usize = 16;

/// Whether hits strictly inside a session window are passed to the payload touch callback.
///
/// Such hits never move a window boundary; some payloads still want to observe them (for
/// example to record the latest data seen), others only care about boundary moves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum InsideHits {
    /// Touch the payload on every hit.
    #[default]
    Touch,
    /// Touch the payload only when the hit moves a window boundary.
    Skip,
}

/// Eviction limits and policies of a single shard.
///
/// Limits are stored normalized: a non-positive TTL or capacity means unbounded and is kept as
/// the maximum representable value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShardSettings {
    ttl: i64,
    capacity: usize,
    deferred: bool,
    inside_hits: InsideHits,
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl ShardSettings {
    /// Creates settings with the given TTL and capacity, eager TTL eviction, and
    /// [`InsideHits::Touch`].
    #[must_use]
    pub fn new(ttl: i64, capacity: i64) -> Self {
        Self {
            ttl: normalize_ttl(ttl),
            capacity: normalize_capacity(capacity),
            deferred: false,
            inside_hits: InsideHits::Touch,
        }
    }

    /// Enables or disables deferred TTL eviction.
    ///
    /// When deferred, sweeps only enforce capacity; an expired session is detected when its key
    /// is next updated, at which point it is evicted and started afresh. A session that is never
    /// updated again lingers until capacity pressure pushes it out.
    #[must_use]
    pub const fn deferred(mut self, deferred: bool) -> Self {
        self.deferred = deferred;
        self
    }

    /// Sets the inside-hit policy.
    #[must_use]
    pub const fn inside_hits(mut self, inside_hits: InsideHits) -> Self {
        self.inside_hits = inside_hits;
        self
    }

    /// The TTL, `i64::MAX` when unbounded.
    #[must_use]
    pub const fn ttl(&self) -> i64 {
        self.ttl
    }

    /// The capacity, `usize::MAX` when unbounded.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether TTL eviction is deferred.
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// The inside-hit policy.
    #[must_use]
    pub const fn inside_hit_policy(&self) -> InsideHits {
        self.inside_hits
    }
}

/// Plain-data configuration of a session store, suitable for loading from configuration files.
///
/// ```
/// use visitrack::{Sessions, SessionsConfig};
///
/// let config = SessionsConfig {
///     shards: 4,
///     ttl: 1800,
///     capacity_per_shard: 100_000,
///     ..SessionsConfig::default()
/// };
/// let sessions = Sessions::<u64, u64, ()>::builder().config(&config).try_build()?;
/// assert_eq!(sessions.num_shards(), 4);
/// # Ok::<(), visitrack::ConfigError>(())
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionsConfig {
    /// Number of shards.
    pub shards: usize,
    /// Session time-to-live; non-positive means unbounded.
    pub ttl: i64,
    /// Session capacity of each shard; non-positive means unbounded.
    pub capacity_per_shard: i64,
    /// Whether TTL eviction is deferred until a key is touched.
    pub deferred: bool,
    /// Whether inside hits touch the payload.
    pub inside_hits: InsideHits,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            shards: DEFAULT_SHARDS,
            ttl: 0,
            capacity_per_shard: 0,
            deferred: false,
            inside_hits: InsideHits::Touch,
        }
    }
}

impl SessionsConfig {
    /// The per-shard settings described by this configuration.
    #[must_use]
    pub fn shard_settings(&self) -> ShardSettings {
        ShardSettings::new(self.ttl, self.capacity_per_shard)
            .deferred(self.deferred)
            .inside_hits(self.inside_hits)
    }
}

fn normalize_ttl(ttl: i64) -> i64 {
    if ttl <= 0 { i64::MAX } else { ttl }
}

fn normalize_capacity(capacity: i64) -> usize {
    if capacity <= 0 {
        usize::MAX
    } else {
        usize::try_from(capacity).unwrap_or(usize::MAX)
    }
}
