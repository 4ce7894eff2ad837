//! Bucketed range lists.
//!
//! A [`RangeTable`] is a fixed array of buckets, one per major number modulo
//! the bucket count. Each bucket is a singly linked list of range nodes kept
//! in ascending span order, so the first node covering a device number is the
//! narrowest one. Nodes live in a single arena and are linked by 32-bit
//! indices; freed nodes are chained onto a free list and reused.
//!
//! The table itself is not synchronised. [`crate::Registry`] wraps it in a
//! lock.

use std::num::NonZeroUsize;

use smallvec::SmallVec;

use crate::dev::{DevId, RangeKey};
use crate::error::RegistryError;

// =============================================================================
// Links
// =============================================================================

/// Index of a node in the arena. `NIL` terminates a list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Link(u32);

impl Link {
    const NIL: Link = Link(u32::MAX);

    #[inline]
    fn is_nil(self) -> bool {
        self == Self::NIL
    }

    #[inline]
    fn index(self) -> usize {
        debug_assert!(!self.is_nil());
        self.0 as usize
    }
}

struct Node<T> {
    key: RangeKey,
    next: Link,
    /// `None` while the node sits on the free list.
    value: Option<T>,
}

/// Bucket indices touched by one range, starting at the bucket of its low end.
pub type BucketSet = SmallVec<[usize; 4]>;

// =============================================================================
// Table
// =============================================================================

pub struct RangeTable<T> {
    heads: Box<[Link]>,
    nodes: Vec<Node<T>>,
    free: Link,
    free_len: usize,
    /// Linked (live) nodes across all buckets.
    len: usize,
}

impl<T> RangeTable<T> {
    pub fn new(buckets: NonZeroUsize) -> Self {
        Self {
            heads: vec![Link::NIL; buckets.get()].into_boxed_slice(),
            nodes: Vec::new(),
            free: Link::NIL,
            free_len: 0,
            len: 0,
        }
    }

    /// Number of buckets.
    #[inline]
    pub fn buckets(&self) -> usize {
        self.heads.len()
    }

    /// Number of linked nodes. A range straddling several buckets counts once
    /// per bucket.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn bucket_index(&self, id: DevId) -> usize {
        id.major() as usize % self.heads.len()
    }

    /// Buckets a range is installed into: one per major number it touches,
    /// wrapping modulo the bucket count and capped at the bucket count.
    pub fn buckets_for(&self, key: RangeKey) -> BucketSet {
        let n = self.heads.len();
        let first = self.bucket_index(key.low());
        let touched = (key.last().major() - key.low().major()) as usize + 1;
        (0..touched.min(n)).map(|i| (first + i) % n).collect()
    }

    /// Nodes of one bucket in list order.
    pub fn bucket(&self, index: usize) -> Bucket<'_, T> {
        Bucket {
            table: self,
            cur: self.heads[index],
        }
    }

    /// Nodes covering `id`, narrowest first.
    pub fn covering(&self, id: DevId) -> impl Iterator<Item = (RangeKey, &T)> + '_ {
        self.bucket(self.bucket_index(id))
            .filter(move |(key, _)| key.contains(id))
    }

    /// Length of the longest bucket list.
    pub fn longest_chain(&self) -> usize {
        (0..self.heads.len())
            .map(|b| self.bucket(b).count())
            .max()
            .unwrap_or(0)
    }

    /// Whether a bucket's spans are non-decreasing from head to tail.
    pub fn is_ordered(&self, index: usize) -> bool {
        let mut prev = 0u32;
        self.bucket(index).all(|(key, _)| {
            let ok = key.span() >= prev;
            prev = key.span();
            ok
        })
    }

    /// Unlink the first node matching `key` exactly from every bucket the
    /// range touches. At most one node per bucket is removed.
    ///
    /// Returns the value of the first node unlinked, or `None` if no bucket
    /// held a match.
    pub fn remove(&mut self, key: RangeKey) -> Option<T> {
        let mut removed = None;
        for bucket in self.buckets_for(key) {
            if let Some(value) = self.unlink_first(bucket, key) {
                removed.get_or_insert(value);
            }
        }
        removed
    }

    fn unlink_first(&mut self, bucket: usize, key: RangeKey) -> Option<T> {
        let mut prev = Link::NIL;
        let mut cur = self.heads[bucket];
        while !cur.is_nil() {
            let node = &self.nodes[cur.index()];
            let next = node.next;
            if node.key == key {
                if prev.is_nil() {
                    self.heads[bucket] = next;
                } else {
                    self.nodes[prev.index()].next = next;
                }
                self.len -= 1;
                return self.release(cur);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Make sure `count` nodes can be allocated without touching the global
    /// allocator.
    fn reserve(&mut self, count: usize) -> Result<(), RegistryError> {
        let short = count.saturating_sub(self.free_len);
        if short == 0 {
            return Ok(());
        }
        if self.nodes.len() + short > Link::NIL.0 as usize {
            return Err(RegistryError::OutOfMemory);
        }
        self.nodes
            .try_reserve(short)
            .map_err(|_| RegistryError::OutOfMemory)
    }

    fn alloc(&mut self, key: RangeKey, value: T) -> Link {
        if self.free.is_nil() {
            let link = Link(self.nodes.len() as u32);
            self.nodes.push(Node {
                key,
                next: Link::NIL,
                value: Some(value),
            });
            return link;
        }

        let link = self.free;
        let node = &mut self.nodes[link.index()];
        self.free = node.next;
        self.free_len -= 1;
        node.key = key;
        node.next = Link::NIL;
        node.value = Some(value);
        link
    }

    fn release(&mut self, link: Link) -> Option<T> {
        let node = &mut self.nodes[link.index()];
        let value = node.value.take();
        node.next = self.free;
        self.free = link;
        self.free_len += 1;
        value
    }

    /// Link a freshly allocated node before the first node of strictly
    /// greater span. Equal spans keep registration order.
    fn link_ordered(&mut self, bucket: usize, link: Link) {
        let span = self.nodes[link.index()].key.span();
        let mut prev = Link::NIL;
        let mut cur = self.heads[bucket];
        while !cur.is_nil() {
            let node = &self.nodes[cur.index()];
            if node.key.span() > span {
                break;
            }
            prev = cur;
            cur = node.next;
        }

        self.nodes[link.index()].next = cur;
        if prev.is_nil() {
            self.heads[bucket] = link;
        } else {
            self.nodes[prev.index()].next = link;
        }
        self.len += 1;

        debug_assert!(
            self.is_ordered(bucket),
            "bucket {bucket} lost ascending span order"
        );
    }
}

impl<T: Clone> RangeTable<T> {
    /// Install `value` under `key` in every bucket the range touches.
    ///
    /// Storage for all nodes is reserved up front, so on error no bucket has
    /// been modified. Returns the number of buckets written.
    pub fn insert(&mut self, key: RangeKey, value: T) -> Result<usize, RegistryError> {
        let buckets = self.buckets_for(key);
        self.reserve(buckets.len())?;
        for &bucket in &buckets {
            let link = self.alloc(key, value.clone());
            self.link_ordered(bucket, link);
        }
        Ok(buckets.len())
    }
}

/// Iterator over one bucket list.
pub struct Bucket<'a, T> {
    table: &'a RangeTable<T>,
    cur: Link,
}

impl<'a, T> Iterator for Bucket<'a, T> {
    type Item = (RangeKey, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_nil() {
            return None;
        }
        let node = &self.table.nodes[self.cur.index()];
        self.cur = node.next;
        node.value.as_ref().map(|v| (node.key, v))
    }
}
