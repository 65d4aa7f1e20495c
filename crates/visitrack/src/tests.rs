// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for the session store.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

use crate::{
    Discard, DomainStat, Entry, Evict, NoDomains, Route, Session, SessionKey, Sessions, SizeReport, StatRow, Storage, evict,
};

fn stat(hits: i64, sessions: i64, bounces: i64, duration: i64) -> DomainStat {
    DomainStat {
        hits,
        sessions,
        bounces,
        duration,
    }
}

fn single_shard(ttl: i64, count: i64) -> Sessions<u64, u64, ()> {
    Sessions::builder().shards(1).ttl(ttl).capacity_per_shard(count).build()
}

fn uids(sessions: &[Session<u64, u64, ()>]) -> Vec<u64> {
    sessions.iter().map(|session| session.key.uid).collect()
}

/// Recomputes domain statistics from the live sessions and compares them with the rollup.
fn assert_consistent<P: Clone>(sessions: &Sessions<u64, u64, P>) {
    let mut live: Vec<Session<u64, u64, P>> = Vec::new();
    assert!(sessions.list_front(&mut live));

    let mut expected: BTreeMap<u64, DomainStat> = BTreeMap::new();
    for session in &live {
        let entry = &session.entry;
        assert!(entry.left_ts <= entry.right_ts);
        assert_eq!(entry.duration, entry.right_ts - entry.left_ts);

        let stat = expected.entry(session.key.domain).or_default();
        stat.hits += entry.hits;
        stat.sessions += 1;
        stat.bounces += i64::from(entry.is_bounce());
        stat.duration += entry.duration;
    }

    let actual: BTreeMap<u64, DomainStat> = sessions.stat_list().into_iter().map(|row| (row.domain, row.stat)).collect();
    assert_eq!(actual, expected);
    assert_eq!(sessions.size().domains, expected.len());
    assert_eq!(sessions.len(), live.len());
}

#[test]
fn test_update_then_remove_scenario() {
    let sessions = single_shard(15, 10);

    let update = sessions.update(1, 1, 1, || (), &mut Discard);
    assert_eq!(update.entry, Entry::new(1, ()));
    assert_eq!(sessions.stat(&1), stat(1, 1, 1, 0));

    let update = sessions.update(2, 1, 1, || (), &mut Discard);
    assert_eq!(update.diff, 1);
    assert_eq!((update.entry.hits, update.entry.left_ts, update.entry.right_ts), (2, 1, 2));
    assert_eq!(sessions.stat(&1), stat(2, 1, 0, 1));

    assert!(sessions.remove(&1, &1, &mut Discard));
    assert_eq!(sessions.stat(&1), DomainStat::default());
    assert!(sessions.stat_list().is_empty());
    assert_eq!(sessions.len(), 0);
}

#[test]
fn test_ttl_gap_restarts_session() {
    let sessions = single_shard(15, 10);
    sessions.update(0, 1, 1, || (), &mut Discard);

    let mut evicted = Vec::new();
    let update = sessions.update(20, 1, 1, || (), &mut evicted);

    assert!(update.created);
    assert_eq!(update.diff, 0);
    assert_eq!(uids(&evicted), [1]);
    assert_eq!(evicted[0].entry.right_ts, 0);
    assert_eq!(sessions.stat(&1), stat(1, 1, 1, 0));
}

#[test]
fn test_ttl_boundary_is_inclusive() {
    let sessions = single_shard(15, 10);
    sessions.update(0, 1, 1, || (), &mut Discard);

    let update = sessions.update(15, 1, 1, || (), &mut Discard);
    assert!(!update.created);
    assert_eq!(update.diff, 15);
}

#[test]
fn test_capacity_evicts_least_recent() {
    let sessions = single_shard(0, 3);
    let mut evicted = Vec::new();
    for uid in 1..=3 {
        sessions.update(0, 1, uid, || (), &mut evicted);
    }
    assert!(evicted.is_empty());
    assert_eq!(sessions.len(), 3);

    sessions.update(0, 1, 4, || (), &mut evicted);
    assert_eq!(uids(&evicted), [1]);
    assert_eq!(sessions.len(), 3);

    // Hits on live sessions never evict.
    evicted.clear();
    sessions.update(1, 1, 2, || (), &mut evicted);
    assert!(evicted.is_empty());
    assert_consistent(&sessions);
}

#[test]
fn test_capacity_respects_recency() {
    let sessions = single_shard(0, 3);
    for uid in 1..=3 {
        sessions.update(0, 1, uid, || (), &mut Discard);
    }

    // Touch the oldest session so that 2 becomes least recent.
    sessions.update(1, 1, 1, || (), &mut Discard);

    let mut evicted = Vec::new();
    sessions.update(1, 1, 4, || (), &mut evicted);
    assert_eq!(uids(&evicted), [2]);

    let mut live = Vec::new();
    sessions.list_front(&mut live);
    assert_eq!(uids(&live), [4, 1, 3]);
    assert_consistent(&sessions);
}

#[test]
fn test_inside_hit_changes_hits_only() {
    let sessions = single_shard(100, 0);
    sessions.update(10, 1, 1, || (), &mut Discard);
    sessions.update(20, 1, 1, || (), &mut Discard);
    let before = sessions.stat(&1);

    let update = sessions.update(15, 1, 1, || (), &mut Discard);
    assert_eq!(update.diff, 0);
    assert_eq!((update.entry.left_ts, update.entry.right_ts, update.entry.duration), (10, 20, 10));
    assert_eq!(update.entry.hits, 3);

    let after = sessions.stat(&1);
    assert_eq!(after.hits, before.hits + 1);
    assert_eq!(after.duration, before.duration);
    assert_eq!(after.bounces, before.bounces);
}

#[test]
fn test_out_of_order_hit_extends_left() {
    let sessions = single_shard(100, 0);
    sessions.update(50, 1, 1, || (), &mut Discard);

    let update = sessions.update(40, 1, 1, || (), &mut Discard);
    assert_eq!(update.diff, 10);
    assert_eq!((update.entry.left_ts, update.entry.right_ts), (40, 50));
    assert_eq!(sessions.stat(&1), stat(2, 1, 0, 10));
}

#[test]
fn test_ttl_applies_to_left_edge() {
    let sessions = single_shard(15, 0);
    sessions.update(100, 1, 1, || (), &mut Discard);

    let mut evicted = Vec::new();
    sessions.update(80, 1, 1, || (), &mut evicted);
    assert_eq!(uids(&evicted), [1]);
    assert_eq!(sessions.find(&1, &1).map(|entry| entry.left_ts), Some(80));
}

#[test]
fn test_bounce_transition() {
    let sessions = single_shard(0, 0);
    sessions.update(0, 1, 1, || (), &mut Discard);
    sessions.update(0, 1, 2, || (), &mut Discard);
    assert_eq!(sessions.stat(&1).bounces, 2);

    sessions.update(1, 1, 1, || (), &mut Discard);
    assert_eq!(sessions.stat(&1).bounces, 1);

    for ts in 2..10 {
        sessions.update(ts, 1, 1, || (), &mut Discard);
        assert_eq!(sessions.stat(&1).bounces, 1);
    }
    assert_consistent(&sessions);
}

#[test]
fn test_no_orphan_stats() {
    let sessions = single_shard(10, 0);
    sessions.update(0, 1, 1, || (), &mut Discard);
    sessions.update(0, 1, 2, || (), &mut Discard);
    sessions.update(0, 2, 1, || (), &mut Discard);

    assert!(sessions.remove(&1, &1, &mut Discard));
    assert_eq!(sessions.stat(&1), stat(1, 1, 1, 0));

    assert!(sessions.remove(&1, &2, &mut Discard));
    assert!(!sessions.remove(&1, &2, &mut Discard));
    assert_eq!(sessions.stat_list().len(), 1);
    assert_eq!(sessions.stat_list()[0].domain, 2);

    // Expiry removes the last domain too.
    sessions.flush(100, usize::MAX, &mut Discard);
    assert!(sessions.stat_list().is_empty());
    assert!(sessions.is_empty());
}

#[test]
fn test_deferred_expiry_is_lazy() {
    let sessions = Sessions::<u64, u64, ()>::builder()
        .shards(1)
        .ttl(15)
        .capacity_per_shard(10)
        .deferred(true)
        .build();
    sessions.update(0, 1, 1, || (), &mut Discard);
    sessions.update(1, 1, 1, || (), &mut Discard);
    sessions.update(0, 1, 2, || (), &mut Discard);

    // Other keys do not sweep expired sessions in deferred mode.
    let mut evicted = Vec::new();
    sessions.update(100, 1, 3, || (), &mut evicted);
    assert!(evicted.is_empty());
    assert_eq!(sessions.len(), 3);

    // Touching the stale key restarts it.
    let update = sessions.update(100, 1, 1, || (), &mut evicted);
    assert!(update.created);
    assert_eq!(uids(&evicted), [1]);
    assert_eq!(evicted[0].entry.hits, 2);

    // Session 2 lingers untouched.
    assert!(sessions.find(&1, &2).is_some());
    assert_eq!(sessions.stat(&1), stat(3, 3, 3, 0));
    assert_consistent(&sessions);
}

#[test]
fn test_deferred_within_ttl_extends() {
    let sessions = Sessions::<u64, u64, ()>::builder().shards(1).ttl(15).deferred(true).build();
    sessions.update(10, 1, 1, || (), &mut Discard);

    let update = sessions.update(25, 1, 1, || (), &mut Discard);
    assert!(!update.created);
    assert_eq!(update.diff, 15);

    let update = sessions.update(-6, 1, 1, || (), &mut Discard);
    assert!(update.created);
}

#[test]
fn test_deferred_capacity_is_eager() {
    let sessions = Sessions::<u64, u64, ()>::builder()
        .shards(1)
        .ttl(15)
        .capacity_per_shard(1)
        .deferred(true)
        .build();
    sessions.update(0, 1, 1, || (), &mut Discard);

    let mut evicted = Vec::new();
    sessions.update(0, 1, 2, || (), &mut evicted);
    assert_eq!(uids(&evicted), [1]);
    assert_eq!(sessions.len(), 1);
}

#[test]
fn test_flush_by_ttl_and_keep() {
    let sessions = single_shard(10, 0);
    for (ts, uid) in [(0, 1), (5, 2), (8, 3), (10, 4)] {
        sessions.update(ts, 1, uid, || (), &mut Discard);
    }
    assert_eq!(sessions.len(), 4);

    let mut evicted = Vec::new();
    sessions.flush(11, usize::MAX, &mut evicted);
    assert_eq!(uids(&evicted), [1]);

    evicted.clear();
    sessions.flush(11, 1, &mut evicted);
    assert_eq!(uids(&evicted), [2, 3]);
    assert_eq!(sessions.len(), 1);
    assert_consistent(&sessions);
}

#[test]
fn test_flush_deferred_ignores_ttl() {
    let sessions = Sessions::<u64, u64, ()>::builder().shards(2).ttl(10).deferred(true).build();
    for uid in 0..4 {
        sessions.update(0, uid, uid, || (), &mut Discard);
    }

    sessions.flush(1_000, usize::MAX, &mut Discard);
    assert_eq!(sessions.len(), 4);

    sessions.flush(1_000, 0, &mut Discard);
    assert!(sessions.is_empty());
}

#[test]
fn test_refusing_observer_does_not_stop_eviction() {
    let sessions = single_shard(0, 0);
    for uid in 0..5 {
        sessions.update(0, 1, uid, || (), &mut Discard);
    }

    let mut reported = 0;
    sessions.flush(
        0,
        1,
        &mut evict::from_fn(|_: Session<u64, u64, ()>| {
            reported += 1;
            false
        }),
    );
    assert_eq!(reported, 1);
    assert_eq!(sessions.len(), 1);
    assert_consistent(&sessions);
}

#[test]
fn test_refusing_observer_is_not_asked_again_by_other_shards() {
    let sessions = Sessions::<u64, u64, ()>::builder().shards(4).build();
    for domain in 0..40 {
        sessions.update(0, domain, 1, || (), &mut Discard);
    }
    assert!(sessions.size_buckets().iter().filter(|bucket| bucket.sessions > 0).count() > 1);

    let mut reported = 0;
    sessions.flush(
        0,
        0,
        &mut evict::from_fn(|_: Session<u64, u64, ()>| {
            reported += 1;
            false
        }),
    );
    assert_eq!(reported, 1);
    assert!(sessions.is_empty());
    assert!(sessions.stat_list().is_empty());
}

#[test]
fn test_panicking_payload_factory_leaves_no_stats() {
    let sessions = single_shard(0, 0);
    sessions.update(0, 1, 1, || (), &mut Discard);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        sessions.update(0, 1, 2, || panic!("payload factory failed"), &mut Discard);
    }));
    assert!(result.is_err());

    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions.stat(&1), stat(1, 1, 1, 0));
    assert_consistent(&sessions);

    // The shard stays usable.
    sessions.update(1, 1, 2, || (), &mut Discard);
    assert_consistent(&sessions);
}

#[test]
fn test_panicking_touch_keeps_stats_in_step() {
    let sessions = single_shard(0, 0);
    sessions.update(0, 1, 1, || (), &mut Discard);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        sessions.update_with(5, 1, 1, || (), |_, _| panic!("touch failed"), &mut Discard);
    }));
    assert!(result.is_err());

    let entry = sessions.find(&1, &1).expect("session is still live");
    assert_eq!((entry.hits, entry.right_ts), (2, 5));
    assert_eq!(sessions.stat(&1), stat(2, 1, 0, 5));
    assert_consistent(&sessions);
}

#[test]
fn test_extreme_timestamps() {
    let sessions = single_shard(0, 0);

    // The widest representable window is accepted.
    sessions.update(0, 1, 1, || (), &mut Discard);
    let update = sessions.update(i64::MAX, 1, 1, || (), &mut Discard);
    assert_eq!(update.diff, i64::MAX);
    assert_eq!(sessions.stat(&1).duration, i64::MAX);

    // A window wider than that is rejected without touching the session.
    sessions.update(i64::MIN, 2, 1, || (), &mut Discard);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        sessions.update(i64::MAX, 2, 1, || (), &mut Discard);
    }));
    assert!(result.is_err());
    assert_eq!(sessions.find(&2, &1), Some(Entry::new(i64::MIN, ())));

    // So is a hit that would overflow the domain's total duration.
    sessions.update(0, 1, 2, || (), &mut Discard);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        sessions.update(1, 1, 2, || (), &mut Discard);
    }));
    assert!(result.is_err());
    assert_eq!(sessions.find(&1, &2), Some(Entry::new(0, ())));
    assert_eq!(sessions.stat(&1), stat(3, 2, 1, i64::MAX));
    assert_consistent(&sessions);
}

#[test]
fn test_debug_inside_observer_does_not_deadlock() {
    let sessions = single_shard(0, 0);
    sessions.update(0, 1, 1, || (), &mut Discard);
    sessions.update(0, 1, 2, || (), &mut Discard);

    let mut formatted = Vec::new();
    sessions.flush(
        0,
        0,
        &mut evict::from_fn(|_: Session<u64, u64, ()>| {
            formatted.push(format!("{sessions:?}"));
            true
        }),
    );

    assert_eq!(formatted.len(), 2);
    assert!(formatted.iter().all(|text| text.contains("len: None")), "got: {formatted:?}");
    assert!(format!("{sessions:?}").contains("len: Some(0)"));
}

#[test]
fn test_listing_stops_across_shards() {
    let sessions = Sessions::<u64, u64, ()>::builder().shards(4).build();
    for domain in 0..40 {
        sessions.update(0, domain, 1, || (), &mut Discard);
    }

    let mut seen = 0;
    let completed = sessions.list_back(&mut evict::from_fn(|_: Session<u64, u64, ()>| {
        seen += 1;
        seen < 3
    }));
    assert!(!completed);
    assert_eq!(seen, 3);

    let mut all = Vec::new();
    assert!(sessions.list_front(&mut all));
    assert_eq!(all.len(), 40);
}

#[test]
fn test_clear_resets_every_shard() {
    let sessions = Sessions::<u64, u64, ()>::builder().shards(3).build();
    for domain in 0..9 {
        sessions.update(0, domain, 1, || (), &mut Discard);
    }
    sessions.clear();

    assert!(sessions.is_empty());
    assert_eq!(
        sessions.size(),
        SizeReport {
            shards: 3,
            sessions: 0,
            domains: 0
        }
    );
}

#[test]
fn test_explicit_keys_split_domain_stats() {
    let sessions = Sessions::<u64, u64, ()>::builder().shards(2).build();
    sessions.shard(Route::Key(0)).update(0, 7, 1, || (), &mut Discard);
    sessions.shard(Route::Key(1)).update(0, 7, 2, || (), &mut Discard);

    // The domain was spread over two shards, so it shows up in each.
    let mut rows = sessions.stat_list();
    StatRow::sort_by_hits(&mut rows);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.domain == 7 && row.stat == stat(1, 1, 1, 0)));

    let buckets = sessions.stat_buckets();
    assert_eq!(buckets[0].len(), 1);
    assert_eq!(buckets[1].len(), 1);
}

#[test]
fn test_randomized_stats_stay_consistent() {
    let mut rng = fastrand::Rng::with_seed(7);
    for deferred in [false, true] {
        let sessions = Sessions::<u64, u64, ()>::builder()
            .shards(3)
            .ttl(20)
            .capacity_per_shard(25)
            .deferred(deferred)
            .build();

        let mut ts = 0_i64;
        for step in 0..2_000 {
            ts += rng.i64(-3..=5);
            let domain = rng.u64(0..6);
            let uid = rng.u64(0..40);
            match rng.u8(0..10) {
                0 => {
                    sessions.remove(&domain, &uid, &mut Discard);
                }
                1 => sessions.flush(ts, rng.usize(10..30), &mut Discard),
                _ => {
                    sessions.update(ts, domain, uid, || (), &mut Discard);
                }
            }
            if step % 50 == 0 {
                assert_consistent(&sessions);
            }
        }
        assert_consistent(&sessions);
        assert!(sessions.size_buckets().iter().all(|bucket| bucket.sessions <= 25));
    }
}

#[test]
fn test_concurrent_updates() {
    use std::thread;

    let sessions = Arc::new(Sessions::<u64, u64, ()>::builder().shards(4).ttl(1_000).build());

    let handles: Vec<_> = (0..4_u64)
        .map(|t| {
            let sessions = Arc::clone(&sessions);
            thread::spawn(move || {
                for i in 0..500_u64 {
                    let ts = i64::try_from(i).expect("fits in i64");
                    let uid = t * 1_000 + i % 50;
                    sessions.update(ts, uid % 8, uid, || (), &mut Discard);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread should not panic");
    }

    assert_eq!(sessions.len(), 4 * 50);
    let total_hits: i64 = sessions.stat_list().iter().map(|row| row.stat.hits).sum();
    assert_eq!(total_hits, 4 * 500);
    assert_consistent(&sessions);
}

#[test]
fn test_shared_payload_outlives_lock() {
    let sessions = Sessions::<u64, u64, Arc<Mutex<Vec<i64>>>>::builder().shards(1).build();
    for ts in [1, 5, 3] {
        sessions.update_with(
            ts,
            1,
            1,
            Arc::default,
            |log, _| log.lock().expect("not poisoned").push(ts),
            &mut Discard,
        );
    }

    let payload = sessions.find(&1, &1).map(|entry| entry.payload).expect("session exists");
    payload.lock().expect("not poisoned").push(99);
    assert_eq!(*payload.lock().expect("not poisoned"), [5, 3, 99]);
}

#[test]
fn test_no_domains_store_still_evicts() {
    let sessions = Sessions::<u64, u64, ()>::builder()
        .shards(1)
        .capacity_per_shard(1)
        .domains::<NoDomains>()
        .build();
    let mut evicted = Vec::new();
    for uid in 0..4 {
        sessions.update(0, 1, uid, || (), &mut evicted);
    }

    assert_eq!(evicted.len(), 3);
    assert_eq!(sessions.len(), 1);
    assert!(sessions.stat_list().is_empty());
}

#[test]
fn test_standalone_storage() {
    let storage = Storage::<&str, &str, ()>::new(15, 10);
    storage.update(1, "a.example", "u1", || (), &mut Discard);
    storage.update(2, "a.example", "u2", || (), &mut Discard);

    let mut back: Vec<Session<&str, &str, ()>> = Vec::new();
    storage.list_back(&mut back);
    assert_eq!(back[0].key, SessionKey::new("a.example", "u1"));
    assert_eq!(storage.stat(&"a.example"), stat(2, 2, 2, 0));
}

/// Collects formatted log output.
#[derive(Clone, Debug, Default)]
struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().expect("not poisoned")).to_string()
    }

    fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        use tracing_subscriber::layer::SubscriberExt;
        tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_writer(self.clone()).with_ansi(false))
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().expect("not poisoned").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_evictions_are_logged() {
    let capture = LogCapture::default();
    tracing::subscriber::with_default(capture.subscriber(), || {
        let sessions = single_shard(15, 1);
        sessions.update(0, 1, 1, || (), &mut Discard);
        sessions.update(40, 1, 2, || (), &mut Discard);
        sessions.flush(40, 0, &mut Discard);
    });

    let output = capture.output();
    assert!(output.contains("sessions built"), "got:\n{output}");
    assert!(output.contains("reason=\"ttl\""), "got:\n{output}");
    assert!(output.contains("flushed sessions"), "got:\n{output}");
}

#[test]
fn test_evict_trait_object() {
    let sessions = single_shard(0, 0);
    sessions.update(0, 1, 1, || (), &mut Discard);

    let mut collected: Vec<Session<u64, u64, ()>> = Vec::new();
    let observer: &mut dyn Evict<u64, u64, ()> = &mut collected;
    assert!(sessions.remove(&1, &1, observer));
    assert_eq!(collected.len(), 1);
}
