// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Session records tracked by a shard.

/// Identity of a session: the domain it belongs to and the visitor within that domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey<D, U> {
    /// The domain the session is aggregated under.
    pub domain: D,
    /// The visitor identifier, unique within the domain.
    pub uid: U,
}

impl<D, U> SessionKey<D, U> {
    /// Creates a key from its parts.
    #[must_use]
    pub const fn new(domain: D, uid: U) -> Self {
        Self { domain, uid }
    }
}

/// The live state of one session.
///
/// The window `[left_ts, right_ts]` only ever widens while the session is live, and
/// `duration` always equals its width.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry<P> {
    /// Number of hits received, starting at 1.
    pub hits: i64,
    /// Earliest hit timestamp seen.
    pub left_ts: i64,
    /// Latest hit timestamp seen.
    pub right_ts: i64,
    /// Accumulated window extensions.
    pub duration: i64,
    /// Caller-supplied value created with the session.
    pub payload: P,
}

impl<P> Entry<P> {
    /// A single-hit session at `ts`.
    #[must_use]
    pub const fn new(ts: i64, payload: P) -> Self {
        Self {
            hits: 1,
            left_ts: ts,
            right_ts: ts,
            duration: 0,
            payload,
        }
    }

    /// Returns `true` while the session has seen exactly one hit.
    #[must_use]
    pub const fn is_bounce(&self) -> bool {
        self.hits == 1
    }

    /// Returns `true` if either window boundary is more than `ttl` away from `ts`.
    #[must_use]
    pub const fn is_expired(&self, ts: i64, ttl: i64) -> bool {
        ts.saturating_sub(self.right_ts) > ttl || self.left_ts.saturating_sub(ts) > ttl
    }

    /// Where a hit at `ts` would land and how far it would widen the window, without
    /// recording it.
    ///
    /// # Panics
    ///
    /// Panics if the widened window or the hit count no longer fits in an `i64`.
    #[must_use]
    pub(crate) fn growth(&self, ts: i64) -> (Extension, i64) {
        let (extension, diff) = if ts >= self.right_ts {
            (Extension::Right, ts.checked_sub(self.right_ts))
        } else if ts <= self.left_ts {
            (Extension::Left, self.left_ts.checked_sub(ts))
        } else {
            (Extension::Inside, Some(0))
        };

        let diff = diff
            .filter(|diff| self.duration.checked_add(*diff).is_some())
            .expect("session window no longer fits in i64");
        assert!(self.hits < i64::MAX, "session hit count overflows i64");
        (extension, diff)
    }

    /// Records a hit at `ts`, widening the window if `ts` falls outside it.
    ///
    /// Returns the side the hit landed on and how far the window grew. The entry is left
    /// untouched if this panics.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`growth`](Self::growth).
    pub(crate) fn hit(&mut self, ts: i64) -> (Extension, i64) {
        let (extension, diff) = self.growth(ts);
        match extension {
            Extension::Right => self.right_ts = ts,
            Extension::Left => self.left_ts = ts,
            Extension::Inside => {}
        }

        self.hits += 1;
        self.duration += diff;
        (extension, diff)
    }
}

/// Where a hit landed relative to the session window it extended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Extension {
    /// At or after the latest hit; the right boundary moved to it.
    Right,
    /// At or before the earliest hit; the left boundary moved to it.
    Left,
    /// Strictly inside the window; no boundary moved.
    Inside,
}

/// A session together with its key, as handed to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session<D, U, P> {
    /// The session identity.
    pub key: SessionKey<D, U>,
    /// The session state at the time it was observed.
    pub entry: Entry<P>,
}

/// Outcome of recording a hit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update<P> {
    /// How far the session window grew. Zero for new sessions and inside hits.
    pub diff: i64,
    /// Whether the hit started a new session.
    pub created: bool,
    /// Snapshot of the session after the hit.
    pub entry: Entry<P>,
}
