// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-domain aggregate statistics.
//!
//! A shard reports every session creation, hit, and removal to its [`Domains`] implementation,
//! which folds them into running counters. The counters never require a rescan: each rule below
//! is the exact inverse of another, so the totals always equal a recount over the live sessions
//! of the domain.
//!
//! | Event | `hits` | `sessions` | `bounces` | `duration` |
//! | :--- | :--- | :--- | :--- | :--- |
//! | session created | +1 | +1 | +1 | |
//! | hit on a session | +1 | | -1 on its second hit | +growth |
//! | session removed | -its hits | -1 | -1 if single-hit | -its duration |

use std::hash::{BuildHasher, Hash};

use hashbrown::DefaultHashBuilder;
use hashbrown::HashMap;

/// Aggregate counters of the live sessions of one domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DomainStat {
    /// Sum of hits across live sessions.
    pub hits: i64,
    /// Number of live sessions.
    pub sessions: i64,
    /// Number of live sessions with exactly one hit.
    pub bounces: i64,
    /// Sum of session window widths.
    pub duration: i64,
}

/// A domain paired with its statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatRow<D> {
    /// The domain.
    pub domain: D,
    /// Its statistics at the time of the query.
    pub stat: DomainStat,
}

impl<D> StatRow<D> {
    /// Sorts rows by ascending hit count.
    pub fn sort_by_hits(rows: &mut [Self]) {
        rows.sort_by_key(|row| row.stat.hits);
    }
}

/// Domain-level rollup consulted by a shard on every session change.
///
/// Implementations must keep their counters exactly consistent with the calls they receive;
/// a call that would drive a counter negative or past `i64::MAX` is a bookkeeping defect and
/// panics, leaving the counters as they were.
pub trait Domains<D> {
    /// Accounts for a new single-hit session.
    fn add_session(&mut self, domain: &D);

    /// Accounts for a hit on an existing session.
    ///
    /// `hits` is the session's hit count including this hit, `diff` how far its window grew.
    fn update_session(&mut self, domain: &D, hits: i64, diff: i64);

    /// Retracts a session with the given final `hits` and `duration`.
    fn remove_session(&mut self, domain: &D, hits: i64, duration: i64);

    /// Drops every counter.
    fn clear(&mut self);

    /// Statistics of `domain`, or zeroes if it has no live sessions.
    fn stat(&self, domain: &D) -> DomainStat;

    /// Statistics of every domain with live sessions, in no particular order.
    fn stat_list(&self) -> Vec<StatRow<D>>;

    /// Number of domains with live sessions.
    fn len(&self) -> usize;

    /// Returns `true` if no domain has live sessions.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hash table of [`DomainStat`] keyed by domain.
#[derive(Debug)]
pub struct DomainTable<D, S = DefaultHashBuilder> {
    stats: HashMap<D, DomainStat, S>,
}

impl<D, S: Default> Default for DomainTable<D, S> {
    fn default() -> Self {
        Self {
            stats: HashMap::with_hasher(S::default()),
        }
    }
}

impl<D> DomainTable<D> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D, S> Domains<D> for DomainTable<D, S>
where
    D: Eq + Hash + Clone,
    S: BuildHasher,
{
    fn add_session(&mut self, domain: &D) {
        if let Some(stat) = self.stats.get_mut(domain) {
            stat.hits = accrue(stat.hits, 1, "hits");
            stat.sessions += 1;
            stat.bounces += 1;
        } else {
            self.stats.insert(
                domain.clone(),
                DomainStat {
                    hits: 1,
                    sessions: 1,
                    bounces: 1,
                    duration: 0,
                },
            );
        }
    }

    fn update_session(&mut self, domain: &D, hits: i64, diff: i64) {
        let stat = self.stats.get_mut(domain).expect("hit on a session of an untracked domain");
        let total_hits = accrue(stat.hits, 1, "hits");
        let duration = accrue(stat.duration, diff, "duration");
        if hits == 2 {
            retract(&mut stat.bounces, 1, "bounces");
        }
        stat.hits = total_hits;
        stat.duration = duration;
    }

    fn remove_session(&mut self, domain: &D, hits: i64, duration: i64) {
        let stat = self.stats.get_mut(domain).expect("removal of a session of an untracked domain");
        if stat.sessions > 1 {
            stat.sessions -= 1;
            if hits == 1 {
                retract(&mut stat.bounces, 1, "bounces");
            }
            retract(&mut stat.hits, hits, "hits");
            retract(&mut stat.duration, duration, "duration");
        } else {
            debug_assert_eq!(
                (stat.hits, stat.bounces, stat.duration),
                (hits, i64::from(hits == 1), duration),
                "last session of a domain must account for all of its counters"
            );
            self.stats.remove(domain);
        }
    }

    fn clear(&mut self) {
        self.stats.clear();
    }

    fn stat(&self, domain: &D) -> DomainStat {
        self.stats.get(domain).copied().unwrap_or_default()
    }

    fn stat_list(&self) -> Vec<StatRow<D>> {
        self.stats
            .iter()
            .map(|(domain, stat)| StatRow {
                domain: domain.clone(),
                stat: *stat,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.stats.len()
    }
}

/// Adds `by` to a counter, panicking instead of overflowing.
#[expect(clippy::panic, reason = "an overflowing counter is a bookkeeping defect")]
fn accrue(counter: i64, by: i64, name: &str) -> i64 {
    counter
        .checked_add(by)
        .unwrap_or_else(|| panic!("domain {name} would overflow: {counter} + {by}"))
}

/// Subtracts `by` from a counter, panicking instead of going negative.
fn retract(counter: &mut i64, by: i64, name: &str) {
    assert!(*counter >= by, "domain {name} would underflow: {} - {by}", *counter);
    *counter -= by;
}

/// A rollup that tracks nothing, for callers without per-domain reporting needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoDomains;

impl<D> Domains<D> for NoDomains {
    fn add_session(&mut self, _domain: &D) {}

    fn update_session(&mut self, _domain: &D, _hits: i64, _diff: i64) {}

    fn remove_session(&mut self, _domain: &D, _hits: i64, _duration: i64) {}

    fn clear(&mut self) {}

    fn stat(&self, _domain: &D) -> DomainStat {
        DomainStat::default()
    }

    fn stat_list(&self) -> Vec<StatRow<D>> {
        Vec::new()
    }

    fn len(&self) -> usize {
        0
    }
}
