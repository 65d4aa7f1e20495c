// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single-shard session storage.
//!
//! A [`Storage`] owns a recency-ordered session map and a domain rollup behind one mutex. All
//! operations hold the mutex for their whole duration, which is bounded by the eviction sweep
//! plus a constant number of map operations. Shards are cache-line aligned so that the locks of
//! neighboring shards in an array never share a line.

use std::hash::{BuildHasher, Hash};

use hashbrown::DefaultHashBuilder;
use parking_lot::Mutex;
use tracing::{Level, event};

use crate::config::{InsideHits, ShardSettings};
use crate::domains::{DomainStat, DomainTable, Domains, StatRow};
use crate::evict::{Evict, Notifier};
use crate::order::{NodeIndex, OrderedMap};
use crate::session::{Entry, Extension, Session, SessionKey, Update};

/// Cache line size for alignment to prevent false sharing.
const CACHE_LINE_SIZE: usize = 64;

/// Why a session left the store.
#[derive(Clone, Copy, Debug)]
enum Reason {
    /// The shard held more sessions than allowed.
    Capacity,
    /// A sweep found the session outside the TTL window.
    Ttl,
    /// A deferred-mode update found its own session outside the TTL window.
    Expired,
    /// The caller removed the session.
    Removed,
}

impl Reason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Capacity => "capacity",
            Self::Ttl => "ttl",
            Self::Expired => "expired",
            Self::Removed => "removed",
        }
    }
}

/// One shard of the session store.
///
/// `D` is the domain type, `U` the visitor id type, `P` the session payload, `A` the domain
/// rollup and `S` the hasher of the session map.
///
/// # Examples
///
/// ```
/// use visitrack::{Discard, DomainStat, Storage};
///
/// let storage = Storage::<&str, u32, ()>::new(15, 10);
/// storage.update(1, "example.com", 7, || (), &mut Discard);
/// let update = storage.update(3, "example.com", 7, || (), &mut Discard);
///
/// assert_eq!(update.diff, 2);
/// assert_eq!(
///     storage.stat(&"example.com"),
///     DomainStat { hits: 2, sessions: 1, bounces: 0, duration: 2 }
/// );
/// ```
#[repr(align(64))]
pub struct Storage<D, U, P, A = DomainTable<D>, S = DefaultHashBuilder> {
    /// The protected inner state.
    inner: Mutex<StorageInner<D, U, P, A, S>>,
    /// Limits and policies, fixed at construction.
    settings: ShardSettings,
    /// Explicit padding to ensure the lock of the next shard resides on a different cache line.
    _pad: [u8; CACHE_LINE_SIZE],
}

impl<D, U, P> Storage<D, U, P> {
    /// Creates a shard with the given TTL and capacity and default policies.
    ///
    /// Non-positive limits mean unbounded.
    #[must_use]
    pub fn new(ttl: i64, capacity: i64) -> Self {
        Self::with_settings(ShardSettings::new(ttl, capacity), DefaultHashBuilder::default())
    }
}

impl<D, U, P, A: Default, S> Storage<D, U, P, A, S> {
    /// Creates a shard with explicit settings and session map hasher.
    #[must_use]
    pub fn with_settings(settings: ShardSettings, hasher: S) -> Self {
        Self {
            inner: Mutex::new(StorageInner {
                sessions: OrderedMap::with_hasher(hasher),
                domains: A::default(),
            }),
            settings,
            _pad: [0; CACHE_LINE_SIZE],
        }
    }
}

impl<D, U, P, A, S> Storage<D, U, P, A, S> {
    /// The shard's limits and policies.
    #[must_use]
    pub const fn settings(&self) -> ShardSettings {
        self.settings
    }

    /// The session TTL, `i64::MAX` when unbounded.
    #[must_use]
    pub const fn ttl(&self) -> i64 {
        self.settings.ttl()
    }

    /// The session capacity, `usize::MAX` when unbounded.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.settings.capacity()
    }

    /// Whether TTL eviction is deferred until a key is touched.
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        self.settings.is_deferred()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Returns `true` if the shard holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D, U, P, A, S> Storage<D, U, P, A, S>
where
    D: Eq + Hash + Clone,
    U: Eq + Hash + Clone,
    P: Clone,
    A: Domains<D>,
    S: BuildHasher,
{
    /// Records a hit at `ts` for the session `(domain, uid)`.
    ///
    /// Sweeps the shard first: least recently touched sessions are evicted while the shard is
    /// full or, unless eviction is deferred, while they fall outside the TTL window of `ts`.
    /// Evicted sessions are reported to `evicted`.
    ///
    /// A new session starts with one hit and a payload built by `payload`, after the least
    /// recently touched session is evicted if the shard is full. An existing session
    /// gets its window widened to include `ts`, its hit count incremented, and is moved to the
    /// front of the recency order. In deferred mode an existing session already outside the TTL
    /// window of `ts` is evicted and started afresh instead.
    pub fn update<E>(&self, ts: i64, domain: D, uid: U, payload: impl FnOnce() -> P, evicted: &mut E) -> Update<P>
    where
        E: Evict<D, U, P> + ?Sized,
    {
        self.update_with(ts, domain, uid, payload, |_, _| {}, evicted)
    }

    /// Like [`update`](Self::update), and calls `touch` with the payload and the hit's
    /// [`Extension`] whenever an existing session is hit.
    ///
    /// Inside hits reach `touch` only under [`InsideHits::Touch`]. The call runs under the shard
    /// lock; keep it short.
    ///
    /// # Panics
    ///
    /// Panics if the widened session window or a domain counter no longer fits in an `i64`;
    /// the session and its domain statistics are left as they were. A panic from `payload` or
    /// `touch` also leaves them consistent.
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
        let mut notifier = Notifier::new(evicted);
        let mut inner = self.inner.lock();

        while inner.evict_last(ts, self.capacity(), self.settings, &mut notifier) {}

        let key = SessionKey::new(domain, uid);
        if let Some(idx) = inner.sessions.find(&key) {
            let expired = self.is_deferred()
                && inner
                    .sessions
                    .get(idx)
                    .is_some_and(|(_, entry)| entry.is_expired(ts, self.ttl()));
            if !expired {
                return inner.extend(idx, ts, touch, self.settings.inside_hit_policy());
            }
            inner.remove_at(idx, Reason::Expired, &mut notifier);
        }

        // Make room so the new session never pushes the shard past capacity.
        while inner.evict_last(ts, self.capacity() - 1, self.settings, &mut notifier) {}
        inner.create(key, ts, payload)
    }

    /// Evicts least recently touched sessions until at most `keep` remain and, unless eviction
    /// is deferred, none of the remaining tail lies outside the TTL window of `ts`.
    pub fn flush<E>(&self, ts: i64, keep: usize, evicted: &mut E)
    where
        E: Evict<D, U, P> + ?Sized,
    {
        self.flush_with(ts, keep, &mut Notifier::new(evicted));
    }

    /// [`flush`](Self::flush) reporting through a notifier that may span several shards.
    pub(crate) fn flush_with<E>(&self, ts: i64, keep: usize, notifier: &mut Notifier<'_, E>)
    where
        E: Evict<D, U, P> + ?Sized,
    {
        let mut inner = self.inner.lock();
        let before = inner.sessions.len();
        while inner.evict_last(ts, keep, self.settings, notifier) {}
        let flushed = before - inner.sessions.len();
        if flushed > 0 {
            event!(Level::DEBUG, message = "flushed sessions", ts, keep, flushed);
        }
    }

    /// Removes the session `(domain, uid)`, reporting it to `evicted`.
    ///
    /// Returns `false` if no such session exists.
    pub fn remove<E>(&self, domain: &D, uid: &U, evicted: &mut E) -> bool
    where
        E: Evict<D, U, P> + ?Sized,
    {
        let mut notifier = Notifier::new(evicted);
        let mut inner = self.inner.lock();
        let key = SessionKey::new(domain.clone(), uid.clone());
        match inner.sessions.find(&key) {
            Some(idx) => {
                inner.remove_at(idx, Reason::Removed, &mut notifier);
                true
            }
            None => false,
        }
    }

    /// Returns a snapshot of the session `(domain, uid)` without touching its recency.
    #[must_use]
    pub fn find(&self, domain: &D, uid: &U) -> Option<Entry<P>> {
        let inner = self.inner.lock();
        let key = SessionKey::new(domain.clone(), uid.clone());
        let idx = inner.sessions.find(&key)?;
        inner.sessions.get(idx).map(|(_, entry)| entry.clone())
    }

    /// Passes every session to `observer`, most recently touched first.
    ///
    /// Stops as soon as `observer` returns `false`, in which case this returns `false`.
    pub fn list_front<E>(&self, observer: &mut E) -> bool
    where
        E: Evict<D, U, P> + ?Sized,
    {
        let inner = self.inner.lock();
        list(inner.sessions.iter(), observer)
    }

    /// Passes every session to `observer`, least recently touched first.
    ///
    /// Stops as soon as `observer` returns `false`, in which case this returns `false`.
    pub fn list_back<E>(&self, observer: &mut E) -> bool
    where
        E: Evict<D, U, P> + ?Sized,
    {
        let inner = self.inner.lock();
        list(inner.sessions.iter().rev(), observer)
    }

    /// Drops every session and domain statistic without reporting them.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.sessions.clear();
        inner.domains.clear();
    }

    /// Statistics of `domain`, or zeroes if it has no live sessions in this shard.
    #[must_use]
    pub fn stat(&self, domain: &D) -> DomainStat {
        self.inner.lock().domains.stat(domain)
    }

    /// Statistics of every domain with live sessions in this shard.
    #[must_use]
    pub fn stat_list(&self) -> Vec<StatRow<D>> {
        self.inner.lock().domains.stat_list()
    }

    /// Number of domains with live sessions in this shard.
    #[must_use]
    pub fn domains_len(&self) -> usize {
        self.inner.lock().domains.len()
    }

    /// Number of live sessions and of domains, read under a single lock acquisition.
    pub(crate) fn sizes(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.sessions.len(), inner.domains.len())
    }
}

impl<D, U, P, A, S> std::fmt::Debug for Storage<D, U, P, A, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("len", &self.inner.try_lock().map(|inner| inner.sessions.len()))
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn list<'a, D, U, P, E>(sessions: impl Iterator<Item = (&'a SessionKey<D, U>, &'a Entry<P>)>, observer: &mut E) -> bool
where
    D: Clone + 'a,
    U: Clone + 'a,
    P: Clone + 'a,
    E: Evict<D, U, P> + ?Sized,
{
    for (key, entry) in sessions {
        let session = Session {
            key: key.clone(),
            entry: entry.clone(),
        };
        if !observer.evict(session) {
            return false;
        }
    }
    true
}

/// State guarded by the shard lock.
struct StorageInner<D, U, P, A, S> {
    sessions: OrderedMap<SessionKey<D, U>, Entry<P>, S>,
    domains: A,
}

impl<D, U, P, A, S> StorageInner<D, U, P, A, S>
where
    D: Eq + Hash + Clone,
    U: Eq + Hash + Clone,
    A: Domains<D>,
    S: BuildHasher,
{
    /// Evicts the least recently touched session if it is over `keep` or, in eager mode,
    /// outside the TTL window of `ts`. Returns whether a session was evicted.
    fn evict_last<E>(&mut self, ts: i64, keep: usize, settings: ShardSettings, notifier: &mut Notifier<'_, E>) -> bool
    where
        E: Evict<D, U, P> + ?Sized,
    {
        let Some(idx) = self.sessions.back() else {
            return false;
        };

        let reason = if self.sessions.len() > keep {
            Reason::Capacity
        } else if !settings.is_deferred()
            && self
                .sessions
                .get(idx)
                .is_some_and(|(_, entry)| entry.is_expired(ts, settings.ttl()))
        {
            Reason::Ttl
        } else {
            return false;
        };

        self.remove_at(idx, reason, notifier);
        true
    }

    /// Removes a session, retracts it from the domain rollup, and reports it.
    fn remove_at<E>(&mut self, idx: NodeIndex, reason: Reason, notifier: &mut Notifier<'_, E>)
    where
        E: Evict<D, U, P> + ?Sized,
    {
        let Some((key, entry)) = self.sessions.remove_at(idx) else {
            return;
        };
        self.domains.remove_session(&key.domain, entry.hits, entry.duration);
        event!(
            Level::TRACE,
            message = "session evicted",
            reason = reason.as_str(),
            hits = entry.hits,
            left_ts = entry.left_ts,
            right_ts = entry.right_ts,
        );
        notifier.notify(Session { key, entry });
    }

    /// Starts a new single-hit session at the front.
    ///
    /// The payload is built before any bookkeeping, so a panicking factory leaves the shard as
    /// it was.
    fn create(&mut self, key: SessionKey<D, U>, ts: i64, payload: impl FnOnce() -> P) -> Update<P>
    where
        P: Clone,
    {
        let entry = Entry::new(ts, payload());
        self.domains.add_session(&key.domain);
        let (idx, created) = self.sessions.push_front(key, entry);
        debug_assert!(created, "create called for a live session");
        let entry = self
            .sessions
            .get(idx)
            .map(|(_, entry)| entry.clone())
            .expect("session was just inserted");

        Update {
            diff: 0,
            created: true,
            entry,
        }
    }

    /// Records a hit on a live session and moves it to the front.
    ///
    /// The entry and the rollup are both updated before `touch` runs, so a panicking `touch`
    /// cannot leave them out of step.
    fn extend(&mut self, idx: NodeIndex, ts: i64, touch: impl FnOnce(&mut P, Extension), inside_hits: InsideHits) -> Update<P>
    where
        P: Clone,
    {
        let (key, entry) = self.sessions.get_mut(idx).expect("handle of a live session");
        let (_, diff) = entry.growth(ts);
        self.domains.update_session(&key.domain, entry.hits + 1, diff);
        let (extension, diff) = entry.hit(ts);
        self.sessions.move_to_front(idx);

        let (_, entry) = self.sessions.get_mut(idx).expect("handle of a live session");
        if extension != Extension::Inside || inside_hits == InsideHits::Touch {
            touch(&mut entry.payload, extension);
        }

        Update {
            diff,
            created: false,
            entry: entry.clone(),
        }
    }
}
