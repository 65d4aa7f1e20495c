// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Observers notified of evicted, removed, or listed sessions.

use crate::session::Session;

/// Receives sessions as they are evicted, removed, or listed.
///
/// Returning `false` asks the producing call to stop notifying for the rest of that call.
/// Listing stops walking; eviction keeps evicting but stops reporting.
pub trait Evict<D, U, P> {
    /// Observes one session. Returns `true` to keep receiving sessions.
    fn evict(&mut self, session: Session<D, U, P>) -> bool;
}

/// Collects every session in notification order.
impl<D, U, P> Evict<D, U, P> for Vec<Session<D, U, P>> {
    fn evict(&mut self, session: Session<D, U, P>) -> bool {
        self.push(session);
        true
    }
}

/// Discards every session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Discard;

impl<D, U, P> Evict<D, U, P> for Discard {
    fn evict(&mut self, _session: Session<D, U, P>) -> bool {
        true
    }
}

/// An observer backed by a closure, created with [`from_fn`].
#[derive(Clone, Copy, Debug)]
pub struct FromFn<F>(F);

/// Wraps a closure as an [`Evict`] observer.
///
/// # Examples
///
/// ```
/// use visitrack::{Discard, Session, Sessions, evict};
///
/// let sessions = Sessions::<u64, u64, ()>::builder().shards(1).build();
/// sessions.update(1, 7, 1, || (), &mut Discard);
/// sessions.update(2, 7, 2, || (), &mut Discard);
///
/// let mut seen = 0;
/// sessions.list_front(&mut evict::from_fn(|_session: Session<u64, u64, ()>| {
///     seen += 1;
///     false
/// }));
/// assert_eq!(seen, 1);
/// ```
pub fn from_fn<D, U, P, F>(f: F) -> FromFn<F>
where
    F: FnMut(Session<D, U, P>) -> bool,
{
    FromFn(f)
}

impl<D, U, P, F> Evict<D, U, P> for FromFn<F>
where
    F: FnMut(Session<D, U, P>) -> bool,
{
    fn evict(&mut self, session: Session<D, U, P>) -> bool {
        (self.0)(session)
    }
}

/// Forwards evictions to an observer until it asks to stop, then swallows the rest.
pub(crate) struct Notifier<'a, E: ?Sized> {
    observer: &'a mut E,
    open: bool,
}

impl<'a, E: ?Sized> Notifier<'a, E> {
    pub(crate) fn new(observer: &'a mut E) -> Self {
        Self { observer, open: true }
    }

    pub(crate) fn notify<D, U, P>(&mut self, session: Session<D, U, P>)
    where
        E: Evict<D, U, P>,
    {
        if self.open {
            self.open = self.observer.evict(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Entry, SessionKey};

    fn session(uid: u32) -> Session<u32, u32, ()> {
        Session {
            key: SessionKey::new(1, uid),
            entry: Entry::new(0, ()),
        }
    }

    #[test]
    fn test_vec_collects_in_order() {
        let mut collected = Vec::new();
        assert!(collected.evict(session(1)));
        assert!(collected.evict(session(2)));
        assert_eq!(collected.iter().map(|s| s.key.uid).collect::<Vec<_>>(), [1, 2]);
    }

    #[test]
    fn test_discard_always_continues() {
        assert!(Discard.evict(session(1)));
    }

    #[test]
    fn test_notifier_stops_after_refusal() {
        let mut calls = 0;
        let mut observer = from_fn(|_: Session<u32, u32, ()>| {
            calls += 1;
            false
        });
        let mut notifier = Notifier::new(&mut observer);
        notifier.notify(session(1));
        notifier.notify(session(2));
        drop(notifier);
        assert_eq!(calls, 1);
    }
}
