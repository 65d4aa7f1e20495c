// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sharded session store.
//!
//! This module provides the main [`Sessions`] type and its builder.

use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::Arc;

use hashbrown::DefaultHashBuilder;
use tracing::{Level, event};

use crate::config::{DEFAULT_SHARDS, InsideHits, ShardSettings, SessionsConfig};
use crate::domains::{DomainStat, DomainTable, Domains, StatRow};
use crate::error::ConfigError;
use crate::evict::{Evict, Notifier};
use crate::session::{Entry, Extension, Update};
use crate::storage::Storage;

/// Selects the shard an operation is routed to.
#[derive(Debug, PartialEq, Eq)]
pub enum Route<'a, D> {
    /// Route by the hash of the domain.
    ///
    /// All sessions of a domain land on the same shard, so per-domain statistics are always
    /// complete within that shard.
    Domain(&'a D),

    /// Route by a caller-supplied shard key, reduced modulo the shard count.
    ///
    /// Decouples placement from the domain. Domain statistics stay coherent only if the caller
    /// uses the same shard key for every session of a domain.
    Key(u64),
}

impl<D> Clone for Route<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for Route<'_, D> {}

/// Counts of shards, sessions, and tracked domains.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SizeReport {
    /// Number of shards covered by the report.
    pub shards: usize,
    /// Number of live sessions.
    pub sessions: usize,
    /// Number of domains with live sessions.
    pub domains: usize,
}

/// A sharded, in-memory session store with per-domain statistics.
///
/// The store partitions sessions across a fixed array of [`Storage`] shards, each with its own
/// lock, recency list, and domain rollup. Every operation on a single session locks exactly one
/// shard. Operations spanning all shards lock them one after another, so their result is a union
/// of per-shard snapshots rather than one atomic snapshot.
///
/// Cloning a `Sessions` is cheap and shares the shards.
///
/// # Type Parameters
///
/// * `D` - The domain type, must implement `Eq + Hash + Clone`.
/// * `U` - The visitor id type, must implement `Eq + Hash + Clone`.
/// * `P` - The session payload, must implement `Clone`. Payloads are handed out as clones taken
///   under the shard lock; payloads mutated after being handed out need their own
///   synchronization, such as `Arc<Mutex<_>>`.
/// * `A` - The domain rollup, defaults to [`DomainTable`]; use [`NoDomains`](crate::NoDomains)
///   to skip per-domain statistics.
/// * `S` - The hash builder used for routing and session maps, defaults to `DefaultHashBuilder`.
///
/// # Examples
///
/// ```
/// use visitrack::{Discard, DomainStat, Sessions};
///
/// let sessions = Sessions::<&str, u64, ()>::builder()
///     .shards(4)
///     .ttl(1800)
///     .capacity_per_shard(10_000)
///     .build();
///
/// sessions.update(100, "example.com", 1, || (), &mut Discard);
/// sessions.update(160, "example.com", 1, || (), &mut Discard);
/// sessions.update(170, "example.com", 2, || (), &mut Discard);
///
/// assert_eq!(
///     sessions.stat(&"example.com"),
///     DomainStat { hits: 3, sessions: 2, bounces: 1, duration: 60 }
/// );
/// ```
pub struct Sessions<D, U, P, A = DomainTable<D>, S = DefaultHashBuilder> {
    /// The shards.
    shards: Arc<[Storage<D, U, P, A, S>]>,
    /// Hashes domains for routing.
    hasher: S,
}

impl<D, U, P, A, S> std::fmt::Debug for Sessions<D, U, P, A, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sessions")
            .field("num_shards", &self.shards.len())
            .field("shards", &self.shards)
            .finish_non_exhaustive()
    }
}

impl<D, U, P, A, S: Clone> Clone for Sessions<D, U, P, A, S> {
    fn clone(&self) -> Self {
        Self {
            shards: Arc::clone(&self.shards),
            hasher: self.hasher.clone(),
        }
    }
}

impl<D, U, P> Sessions<D, U, P, DomainTable<D>, DefaultHashBuilder> {
    /// Creates a new builder for configuring a `Sessions` store.
    #[must_use]
    pub fn builder() -> SessionsBuilder<D, U, P, DomainTable<D>, DefaultHashBuilder> {
        SessionsBuilder::new()
    }
}

impl<D, U, P, A, S> Sessions<D, U, P, A, S> {
    /// Returns the number of shards.
    #[must_use]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// The session TTL applied by every shard, `i64::MAX` when unbounded.
    #[must_use]
    pub fn ttl(&self) -> i64 {
        self.settings().ttl()
    }

    /// The session capacity of each shard, `usize::MAX` when unbounded.
    #[must_use]
    pub fn capacity_per_shard(&self) -> usize {
        self.settings().capacity()
    }

    /// Whether TTL eviction is deferred until a key is touched.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.settings().is_deferred()
    }

    /// Gets a reference to a specific shard by index.
    ///
    /// # Panics
    ///
    /// Panics if `index >= num_shards()`.
    #[must_use]
    pub fn shard_at(&self, index: usize) -> &Storage<D, U, P, A, S> {
        &self.shards[index]
    }

    fn settings(&self) -> ShardSettings {
        self.shards[0].settings()
    }
}

impl<D, U, P, A, S> Sessions<D, U, P, A, S>
where
    D: Eq + Hash + Clone,
    U: Eq + Hash + Clone,
    P: Clone,
    A: Domains<D>,
    S: BuildHasher,
{
    /// Returns the index of the shard `route` selects.
    ///
    /// The mapping is stable for the lifetime of the store.
    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "remainder is below the shard count")]
    pub fn shard_index(&self, route: Route<'_, D>) -> usize {
        let key = match route {
            Route::Domain(domain) => self.hasher.hash_one(domain),
            Route::Key(key) => key,
        };
        (key % self.shards.len() as u64) as usize
    }

    /// Returns the shard `route` selects.
    ///
    /// Every single-shard operation is available on the returned [`Storage`], which is how
    /// explicit shard-key routing is used:
    ///
    /// ```
    /// use visitrack::{Discard, Route, Sessions};
    ///
    /// let sessions = Sessions::<&str, u64, ()>::builder().shards(8).build();
    /// let tenant = 42;
    ///
    /// sessions.shard(Route::Key(tenant)).update(1, "example.com", 7, || (), &mut Discard);
    /// assert_eq!(sessions.shard(Route::Key(tenant)).stat(&"example.com").hits, 1);
    /// assert_eq!(sessions.shard_index(Route::Key(tenant)), 2);
    /// ```
    #[must_use]
    pub fn shard(&self, route: Route<'_, D>) -> &Storage<D, U, P, A, S> {
        &self.shards[self.shard_index(route)]
    }

    /// Records a hit on the session `(domain, uid)` in the domain's shard.
    ///
    /// See [`Storage::update`].
    pub fn update<E>(&self, ts: i64, domain: D, uid: U, payload: impl FnOnce() -> P, evicted: &mut E) -> Update<P>
    where
        E: Evict<D, U, P> + ?Sized,
    {
        let index = self.shard_index(Route::Domain(&domain));
        self.shards[index].update(ts, domain, uid, payload, evicted)
    }

    /// Records a hit and touches the payload of an existing session.
    ///
    /// See [`Storage::update_with`].
    pub fn update_with<E>(
        &self,
        ts: i64,
        domain: D,
        uid: U,
        payload: impl FnOnce() -> P,
        touch: impl FnOnce(&mut P, Extension),
        evicted: &mut E,
    ) -> Update<P>
    where
        E: Evict<D, U, P> + ?Sized,
    {
        let index = self.shard_index(Route::Domain(&domain));
        self.shards[index].update_with(ts, domain, uid, payload, touch, evicted)
    }

    /// Removes the session `(domain, uid)` from the domain's shard.
    ///
    /// Returns `false` if no such session exists.
    pub fn remove<E>(&self, domain: &D, uid: &U, evicted: &mut E) -> bool
    where
        E: Evict<D, U, P> + ?Sized,
    {
        self.shard(Route::Domain(domain)).remove(domain, uid, evicted)
    }

    /// Returns a snapshot of the session `(domain, uid)` from the domain's shard.
    #[must_use]
    pub fn find(&self, domain: &D, uid: &U) -> Option<Entry<P>> {
        self.shard(Route::Domain(domain)).find(domain, uid)
    }

    /// Statistics of `domain`, or zeroes if it has no live sessions.
    ///
    /// Reads the shard selected by [`Route::Domain`]. Sessions placed with [`Route::Key`] live
    /// on the shard of their key; read them with [`stat_on`](Self::stat_on).
    #[must_use]
    pub fn stat(&self, domain: &D) -> DomainStat {
        self.stat_on(Route::Domain(domain), domain)
    }

    /// Statistics of `domain` in the shard `route` selects, or zeroes if it has no live sessions
    /// there.
    #[must_use]
    pub fn stat_on(&self, route: Route<'_, D>, domain: &D) -> DomainStat {
        self.shard(route).stat(domain)
    }

    /// Sweeps every shard, see [`Storage::flush`].
    ///
    /// Once `evicted` returns `false` it receives no further sessions from any shard, while
    /// eviction still runs to completion everywhere.
    pub fn flush<E>(&self, ts: i64, keep: usize, evicted: &mut E)
    where
        E: Evict<D, U, P> + ?Sized,
    {
        let mut notifier = Notifier::new(evicted);
        for shard in self.shards.iter() {
            shard.flush_with(ts, keep, &mut notifier);
        }
    }

    /// Passes every session to `observer`, shard by shard, most recently touched first within
    /// each shard.
    ///
    /// Stops as soon as `observer` returns `false`, skipping the remaining shards.
    pub fn list_front<E>(&self, observer: &mut E) -> bool
    where
        E: Evict<D, U, P> + ?Sized,
    {
        self.shards.iter().all(|shard| shard.list_front(observer))
    }

    /// Passes every session to `observer`, shard by shard, least recently touched first within
    /// each shard.
    ///
    /// Stops as soon as `observer` returns `false`, skipping the remaining shards.
    pub fn list_back<E>(&self, observer: &mut E) -> bool
    where
        E: Evict<D, U, P> + ?Sized,
    {
        self.shards.iter().all(|shard| shard.list_back(observer))
    }

    /// Drops every session and statistic in every shard.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
        event!(Level::DEBUG, message = "sessions cleared", shards = self.shards.len());
    }

    /// Statistics of every domain with live sessions, concatenated across shards.
    ///
    /// With explicit shard-key routing a domain may appear once per shard it was routed to.
    #[must_use]
    pub fn stat_list(&self) -> Vec<StatRow<D>> {
        self.shards.iter().flat_map(Storage::stat_list).collect()
    }

    /// Statistics of every domain with live sessions, one list per shard.
    #[must_use]
    pub fn stat_buckets(&self) -> Vec<Vec<StatRow<D>>> {
        self.shards.iter().map(Storage::stat_list).collect()
    }

    /// Returns the total number of live sessions across all shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(Storage::len).sum()
    }

    /// Returns `true` if no shard holds a session.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(Storage::is_empty)
    }

    /// Totals of sessions and domains across all shards.
    #[must_use]
    pub fn size(&self) -> SizeReport {
        self.size_buckets().into_iter().fold(SizeReport::default(), |total, shard| SizeReport {
            shards: total.shards + shard.shards,
            sessions: total.sessions + shard.sessions,
            domains: total.domains + shard.domains,
        })
    }

    /// Sessions and domains of each shard.
    #[must_use]
    pub fn size_buckets(&self) -> Vec<SizeReport> {
        self.shards
            .iter()
            .map(|shard| {
                let (sessions, domains) = shard.sizes();
                SizeReport {
                    shards: 1,
                    sessions,
                    domains,
                }
            })
            .collect()
    }
}

impl<D, U, P> TryFrom<&SessionsConfig> for Sessions<D, U, P> {
    type Error = ConfigError;

    fn try_from(config: &SessionsConfig) -> Result<Self, Self::Error> {
        Self::builder().config(config).try_build()
    }
}

/// Builder for configuring a [`Sessions`] store.
///
/// # Examples
///
/// ```
/// use visitrack::{InsideHits, NoDomains, Sessions};
///
/// let sessions = Sessions::<u64, u64, ()>::builder()
///     .shards(8)
///     .ttl(900)
///     .capacity_per_shard(50_000)
///     .deferred(true)
///     .inside_hits(InsideHits::Skip)
///     .domains::<NoDomains>()
///     .build();
///
/// assert_eq!(sessions.num_shards(), 8);
/// assert!(sessions.is_deferred());
/// ```
#[derive(Debug)]
pub struct SessionsBuilder<D, U, P, A = DomainTable<D>, S = DefaultHashBuilder> {
    shards: usize,
    ttl: i64,
    capacity_per_shard: i64,
    deferred: bool,
    inside_hits: InsideHits,
    hasher: S,
    _marker: PhantomData<fn() -> (D, U, P, A)>,
}

impl<D, U, P, A, S: Default> Default for SessionsBuilder<D, U, P, A, S> {
    fn default() -> Self {
        Self {
            shards: DEFAULT_SHARDS,
            ttl: 0,
            capacity_per_shard: 0,
            deferred: false,
            inside_hits: InsideHits::Touch,
            hasher: S::default(),
            _marker: PhantomData,
        }
    }
}

impl<D, U, P, A, S: Default> SessionsBuilder<D, U, P, A, S> {
    /// Creates a new builder with default settings.
    ///
    /// Defaults:
    /// - `shards`: [`DEFAULT_SHARDS`]
    /// - `ttl`: unbounded
    /// - `capacity_per_shard`: unbounded
    /// - `deferred`: `false`
    /// - `inside_hits`: [`InsideHits::Touch`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D, U, P, A, S> SessionsBuilder<D, U, P, A, S> {
    /// Sets the number of shards.
    #[must_use]
    pub const fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Sets the session TTL. Non-positive values mean unbounded.
    #[must_use]
    pub const fn ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the session capacity of each shard. Non-positive values mean unbounded.
    #[must_use]
    pub const fn capacity_per_shard(mut self, capacity: i64) -> Self {
        self.capacity_per_shard = capacity;
        self
    }

    /// Enables or disables deferred TTL eviction, see [`ShardSettings::deferred`].
    #[must_use]
    pub const fn deferred(mut self, deferred: bool) -> Self {
        self.deferred = deferred;
        self
    }

    /// Sets whether inside hits reach the payload touch callback.
    #[must_use]
    pub const fn inside_hits(mut self, inside_hits: InsideHits) -> Self {
        self.inside_hits = inside_hits;
        self
    }

    /// Applies every setting of `config`.
    #[must_use]
    pub fn config(self, config: &SessionsConfig) -> Self {
        self.shards(config.shards)
            .ttl(config.ttl)
            .capacity_per_shard(config.capacity_per_shard)
            .deferred(config.deferred)
            .inside_hits(config.inside_hits)
    }

    /// Replaces the hash builder used for routing and session maps.
    #[must_use]
    pub fn hasher<S2>(self, hasher: S2) -> SessionsBuilder<D, U, P, A, S2> {
        SessionsBuilder {
            shards: self.shards,
            ttl: self.ttl,
            capacity_per_shard: self.capacity_per_shard,
            deferred: self.deferred,
            inside_hits: self.inside_hits,
            hasher,
            _marker: PhantomData,
        }
    }

    /// Replaces the domain rollup kept by every shard.
    #[must_use]
    pub fn domains<A2>(self) -> SessionsBuilder<D, U, P, A2, S> {
        SessionsBuilder {
            shards: self.shards,
            ttl: self.ttl,
            capacity_per_shard: self.capacity_per_shard,
            deferred: self.deferred,
            inside_hits: self.inside_hits,
            hasher: self.hasher,
            _marker: PhantomData,
        }
    }
}

impl<D, U, P, A, S> SessionsBuilder<D, U, P, A, S>
where
    A: Default,
    S: BuildHasher + Clone,
{
    /// Builds the store, or reports why the configuration is unusable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoShards`] if the shard count is zero.
    pub fn try_build(self) -> Result<Sessions<D, U, P, A, S>, ConfigError> {
        if self.shards == 0 {
            return Err(ConfigError::NoShards);
        }

        let settings = ShardSettings::new(self.ttl, self.capacity_per_shard)
            .deferred(self.deferred)
            .inside_hits(self.inside_hits);
        let shards: Vec<Storage<D, U, P, A, S>> = (0..self.shards)
            .map(|_| Storage::with_settings(settings, self.hasher.clone()))
            .collect();

        event!(
            Level::DEBUG,
            message = "sessions built",
            shards = self.shards,
            ttl = settings.ttl(),
            capacity_per_shard = settings.capacity(),
            deferred = settings.is_deferred(),
        );

        Ok(Sessions {
            shards: shards.into(),
            hasher: self.hasher,
        })
    }

    /// Builds the store.
    ///
    /// # Panics
    ///
    /// Panics if the shard count is zero.
    #[must_use]
    pub fn build(self) -> Sessions<D, U, P, A, S> {
        assert!(self.shards > 0, "shard count must be at least 1");
        match self.try_build() {
            Ok(sessions) => sessions,
            Err(error) => unreachable!("validated configuration failed to build: {error}"),
        }
    }
}
