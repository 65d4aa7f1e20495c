// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Recency-ordered associative container.
//!
//! [`OrderedMap`] pairs a Swiss Table index (`hashbrown::HashMap`) with a slab-allocated doubly
//! linked list. The table maps each key to the slab slot of its node, while the list keeps the
//! nodes in recency order, front (most recently touched) to back (least recently touched).
//!
//! Every keyed operation is O(1) amortized: lookups go through the table, reordering only
//! rewires list links, and freed slots are recycled through an intrusive free list.

#![expect(
    clippy::cast_possible_truncation,
    reason = "NodeIndex is u32 and slab growth is bounded below NULL_INDEX"
)]

use std::hash::{BuildHasher, Hash};

use hashbrown::DefaultHashBuilder;
use hashbrown::HashMap;

/// Stable handle to an entry of an [`OrderedMap`].
///
/// A handle stays valid until its entry is removed; removed slots are recycled, so a stale
/// handle may later refer to an unrelated entry.
pub type NodeIndex = u32;

/// Sentinel value indicating no node (null pointer equivalent).
const NULL_INDEX: NodeIndex = NodeIndex::MAX;

/// A slab slot. Vacant slots keep their `next` link to thread the free list.
#[derive(Debug)]
struct Node<K, V> {
    entry: Option<(K, V)>,
    next: NodeIndex,
    prev: NodeIndex,
}

impl<K, V> Node<K, V> {
    const fn vacant(next: NodeIndex) -> Self {
        Self {
            entry: None,
            next,
            prev: NULL_INDEX,
        }
    }
}

/// A hash map that remembers the order in which its entries were last touched.
#[derive(Debug)]
pub struct OrderedMap<K, V, S = DefaultHashBuilder> {
    /// Key to slab slot.
    index: HashMap<K, NodeIndex, S>,

    /// Slab of list nodes, occupied and vacant.
    nodes: Vec<Node<K, V>>,

    /// Most recently touched entry.
    head: Option<NodeIndex>,

    /// Least recently touched entry.
    tail: Option<NodeIndex>,

    /// Free list head for recycling node slots.
    free_head: Option<NodeIndex>,
}

impl<K, V, S: Default> Default for OrderedMap<K, V, S> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V> OrderedMap<K, V, DefaultHashBuilder> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K, V, S> OrderedMap<K, V, S> {
    /// Creates an empty map that hashes keys with `hasher`.
    #[must_use]
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            index: HashMap::with_hasher(hasher),
            nodes: Vec::new(),
            head: None,
            tail: None,
            free_head: None,
        }
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns `true` if the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Handle of the most recently touched entry.
    #[must_use]
    pub const fn front(&self) -> Option<NodeIndex> {
        self.head
    }

    /// Handle of the least recently touched entry.
    #[must_use]
    pub const fn back(&self) -> Option<NodeIndex> {
        self.tail
    }

    /// Handle of the entry touched just before `idx`, walking towards the back.
    #[must_use]
    pub fn next(&self, idx: NodeIndex) -> Option<NodeIndex> {
        let node = self.occupied(idx)?;
        (node.next != NULL_INDEX).then_some(node.next)
    }

    /// Handle of the entry touched just after `idx`, walking towards the front.
    #[must_use]
    pub fn prev(&self, idx: NodeIndex) -> Option<NodeIndex> {
        let node = self.occupied(idx)?;
        (node.prev != NULL_INDEX).then_some(node.prev)
    }

    /// Returns the key and value stored at `idx`.
    #[must_use]
    pub fn get(&self, idx: NodeIndex) -> Option<(&K, &V)> {
        self.occupied(idx)?.entry.as_ref().map(|(k, v)| (k, v))
    }

    /// Returns the key and a mutable value stored at `idx`. Does not reorder.
    pub fn get_mut(&mut self, idx: NodeIndex) -> Option<(&K, &mut V)> {
        self.nodes.get_mut(idx as usize)?.entry.as_mut().map(|(k, v)| (&*k, v))
    }

    /// Replaces the value stored at `idx` without reordering, returning the old value.
    pub fn update(&mut self, idx: NodeIndex, value: V) -> Option<V> {
        self.get_mut(idx).map(|(_, slot)| std::mem::replace(slot, value))
    }

    /// Moves the entry at `idx` to the front.
    pub fn move_to_front(&mut self, idx: NodeIndex) {
        if self.occupied(idx).is_none() || self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }

    /// Iterates entries from front (most recent) to back (least recent).
    ///
    /// The iterator is double-ended; `.rev()` walks from back to front.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            map: self,
            front: self.head,
            back: self.tail,
            remaining: self.len(),
        }
    }

    /// Removes every entry, releasing the slab.
    pub fn clear(&mut self) {
        self.index.clear();
        self.nodes.clear();
        self.head = None;
        self.tail = None;
        self.free_head = None;
    }

    fn occupied(&self, idx: NodeIndex) -> Option<&Node<K, V>> {
        self.nodes.get(idx as usize).filter(|node| node.entry.is_some())
    }

    /// Allocates a slot from the free list, growing the slab when the list is empty.
    fn alloc_node(&mut self) -> NodeIndex {
        if let Some(idx) = self.free_head {
            let next_free = self.nodes[idx as usize].next;
            self.free_head = (next_free != NULL_INDEX).then_some(next_free);
            return idx;
        }

        assert!(self.nodes.len() < NULL_INDEX as usize, "ordered map slab exhausted");
        let idx = self.nodes.len() as NodeIndex;
        self.nodes.push(Node::vacant(NULL_INDEX));
        idx
    }

    /// Returns a slot to the free list.
    fn free_node(&mut self, idx: NodeIndex) {
        self.nodes[idx as usize] = Node::vacant(self.free_head.unwrap_or(NULL_INDEX));
        self.free_head = Some(idx);
    }

    /// Inserts an already-occupied node at the head of the list.
    fn link_front(&mut self, idx: NodeIndex) {
        let old_head = self.head;
        {
            let node = &mut self.nodes[idx as usize];
            node.prev = NULL_INDEX;
            node.next = old_head.unwrap_or(NULL_INDEX);
        }
        if let Some(old_head) = old_head {
            self.nodes[old_head as usize].prev = idx;
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    /// Detaches a node from its neighbors, leaving it in the slab.
    fn unlink(&mut self, idx: NodeIndex) {
        let (prev, next) = {
            let node = &self.nodes[idx as usize];
            (node.prev, node.next)
        };

        if prev == NULL_INDEX {
            self.head = (next != NULL_INDEX).then_some(next);
        } else {
            self.nodes[prev as usize].next = next;
        }

        if next == NULL_INDEX {
            self.tail = (prev != NULL_INDEX).then_some(prev);
        } else {
            self.nodes[next as usize].prev = prev;
        }
    }
}

impl<K, V, S> OrderedMap<K, V, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
{
    /// Inserts `key` at the front unless it is already present.
    ///
    /// Returns the entry's handle and whether it was created. An existing entry is neither
    /// modified nor reordered.
    pub fn push_front(&mut self, key: K, value: V) -> (NodeIndex, bool) {
        self.push_front_with(key, || value)
    }

    /// Like [`push_front`](Self::push_front), but only builds the value when the key is absent.
    pub fn push_front_with(&mut self, key: K, value: impl FnOnce() -> V) -> (NodeIndex, bool) {
        if let Some(&idx) = self.index.get(&key) {
            return (idx, false);
        }

        let idx = self.alloc_node();
        self.nodes[idx as usize].entry = Some((key.clone(), value()));
        self.link_front(idx);
        self.index.insert(key, idx);
        (idx, true)
    }

    /// Looks up the handle for `key`.
    #[must_use]
    pub fn find(&self, key: &K) -> Option<NodeIndex> {
        self.index.get(key).copied()
    }

    /// Removes `key`, returning its stored key and value.
    pub fn remove(&mut self, key: &K) -> Option<(K, V)> {
        let idx = self.find(key)?;
        self.remove_at(idx)
    }

    /// Removes the entry at `idx`, returning its stored key and value.
    pub fn remove_at(&mut self, idx: NodeIndex) -> Option<(K, V)> {
        self.occupied(idx)?;
        self.unlink(idx);
        let (key, value) = self.nodes[idx as usize].entry.take()?;
        self.index.remove(&key);
        self.free_node(idx);
        Some((key, value))
    }
}

/// Iterator over an [`OrderedMap`] in recency order.
#[derive(Debug)]
pub struct Iter<'a, K, V, S> {
    map: &'a OrderedMap<K, V, S>,
    front: Option<NodeIndex>,
    back: Option<NodeIndex>,
    remaining: usize,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let idx = self.front?;
        self.remaining -= 1;
        self.front = self.map.next(idx);
        self.map.get(idx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V, S> DoubleEndedIterator for Iter<'_, K, V, S> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let idx = self.back?;
        self.remaining -= 1;
        self.back = self.map.prev(idx);
        self.map.get(idx)
    }
}

impl<K, V, S> ExactSizeIterator for Iter<'_, K, V, S> {}
