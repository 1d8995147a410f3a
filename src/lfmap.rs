//! Lock-free hash map/set with hazard-pointer reclamation.
//!
//! Ported from `lockfree_hash_map.h` / `lockfree_hash_set.h`: a fixed
//! bucket array of singly linked chains, each chain kept sorted by
//! `(hash, key)` so a walk can tell "not present" from "not here yet"
//! without scanning the whole bucket. Deletion is Harris-style: `remove`
//! marks a node's `next` pointer with the low bit before it is physically
//! unlinked, and any thread's `find` that later walks over a marked
//! successor helps finish the unlink before continuing past it.
//!
//! Unlike [`crate::nwf`] and [`crate::mpsc_fifo`], which retire through a
//! shared [`crate::gc::Collector`], this map owns a private
//! [`HazardDomain`] — the same structure `lockfree_hash_map.h` uses, which
//! carries its own `hazard_ptrs<node, 3>` member rather than sharing
//! reclamation with other structures.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::hazard::{HazardDomain, HazardRecord};

const DELETED: usize = 1;

fn strip<K, V>(raw: usize) -> *mut Node<K, V> {
    (raw & !DELETED) as *mut Node<K, V>
}

fn is_deleted(raw: usize) -> bool {
    raw & DELETED != 0
}

fn mark_deleted(raw: usize) -> usize {
    raw | DELETED
}

fn unmark_deleted(raw: usize) -> usize {
    raw & !DELETED
}

struct Node<K, V> {
    hash: u64,
    key: K,
    value: V,
    next: AtomicUsize,
}

fn hash_of<K: std::hash::Hash>(key: &K) -> u64 {
    use std::hash::Hasher;
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    finalize_hash(hasher.finish())
}

/// Same avalanche finalizer as [`crate::nwf`]'s `finalize_hash` — both
/// exist to give `DefaultHasher`'s output the probe-sequence quality the
/// original's custom hash functions provided.
fn finalize_hash(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// A lock-free hash map over a fixed `1 << magnitude` buckets.
pub struct LfMap<K, V> {
    hazards: HazardDomain<Node<K, V>>,
    table: Box<[AtomicUsize]>,
    mask: u64,
}

unsafe impl<K: Send, V: Send> Send for LfMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for LfMap<K, V> {}

impl<K, V> LfMap<K, V>
where
    K: Ord + Clone + std::hash::Hash,
    V: Clone,
{
    /// `magnitude = 5` gives the original's default 32 buckets.
    pub fn new(magnitude: u16) -> Self {
        let size = 1usize << magnitude;
        let table: Vec<AtomicUsize> = (0..size).map(|_| AtomicUsize::new(0)).collect();
        Self {
            hazards: HazardDomain::new(),
            table: table.into_boxed_slice(),
            mask: (size - 1) as u64,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }

    pub fn lookup(&self, key: &K) -> Option<V> {
        let hptr = self.hazards.acquire();
        let hash = hash_of(key);
        let (_prev, cur, found) = self.find(&hptr, hash, key);

        if found {
            Some(unsafe { &*strip::<K, V>(cur) }.value.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, key: K, value: V) -> bool {
        let hptr = self.hazards.acquire();
        let hash = hash_of(&key);

        loop {
            let (prev, cur, found) = self.find(&hptr, hash, &key);

            if found {
                return false;
            }

            let node = Box::into_raw(Box::new(Node {
                hash,
                key: key.clone(),
                value: value.clone(),
                next: AtomicUsize::new(cur),
            }));

            if unsafe { &*prev }
                .compare_exchange(cur, node as usize, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }

            unsafe { drop(Box::from_raw(node)) };
        }
    }

    pub fn remove(&self, key: &K) -> bool {
        let hptr = self.hazards.acquire();
        let hash = hash_of(key);

        loop {
            let (prev, cur, found) = self.find(&hptr, hash, key);

            if !found {
                return false;
            }

            let cur_stripped = strip::<K, V>(cur);
            let cur_node = unsafe { &*cur_stripped };
            let next_old = cur_node.next.load(Ordering::Acquire);

            if is_deleted(next_old) {
                continue;
            }

            let next_new = mark_deleted(next_old);

            if cur_node
                .next
                .compare_exchange(next_old, next_new, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let next_clean = unmark_deleted(next_new);
            let cur_clean = unmark_deleted(cur);

            if unsafe { &*prev }
                .compare_exchange(cur_clean, next_clean, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                hptr.retire(cur_stripped);
            } else {
                // Someone else changed `prev` first (an insert, or another
                // thread's cooperative unlink); one more `find` finishes
                // physically unlinking this node on our behalf.
                let _ = self.find(&hptr, hash, key);
            }

            return true;
        }
    }

    /// Locate `key`'s chain position. Returns `(prev, cur, found)` where
    /// `prev` is the slot (a bucket head or some node's `next` field) whose
    /// target is `cur`. Restarts from the bucket head on any race it can't
    /// resolve locally, exactly as `lockfree_hash_map.h`'s `find` does with
    /// its nested `while (true)` loops.
    fn find(
        &self,
        hptr: &HazardRecord<'_, Node<K, V>>,
        hash: u64,
        key: &K,
    ) -> (*const AtomicUsize, usize, bool) {
        let offset = (hash & self.mask) as usize;

        'restart: loop {
            let mut prev: *const AtomicUsize = &self.table[offset];
            let mut cur = unsafe { &*prev }.load(Ordering::Acquire);
            hptr.set(1, strip::<K, V>(cur));

            if unsafe { &*prev }.load(Ordering::Acquire) != cur || is_deleted(cur) {
                continue 'restart;
            }

            loop {
                if is_deleted(cur) {
                    continue 'restart;
                }

                let cur_stripped = strip::<K, V>(cur);
                if cur_stripped.is_null() {
                    return (prev, cur, false);
                }

                let cur_node = unsafe { &*cur_stripped };
                let next = cur_node.next.load(Ordering::Acquire);
                let cmark = is_deleted(next);
                hptr.set(0, strip::<K, V>(next));

                if cur_node.next.load(Ordering::Acquire) != next {
                    continue 'restart;
                }

                let chash = cur_node.hash;

                if unsafe { &*prev }.load(Ordering::Acquire) != cur || is_deleted(cur) {
                    continue 'restart;
                }

                if !cmark {
                    if (hash == chash && cur_node.key <= *key) || hash > chash {
                        return (prev, cur, cur_node.key == *key);
                    }
                    prev = &cur_node.next as *const AtomicUsize;
                    hptr.set(2, cur_stripped);
                } else {
                    let a = unmark_deleted(cur);
                    let b = unmark_deleted(next);
                    match unsafe { &*prev }.compare_exchange(
                        a,
                        b,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => hptr.retire(cur_stripped),
                        Err(_) => continue 'restart,
                    }
                }

                cur = next;
                hptr.set(1, strip::<K, V>(cur));
            }
        }
    }

    /// A sloppy snapshot iterator: may miss concurrent inserts and may
    /// yield a key twice across a resize of nothing here (this map never
    /// resizes its bucket count), but never yields a logically-removed
    /// entry and never walks through a partially unlinked node — a restart
    /// always unwinds to the bucket head, never forward from mid-chain.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let hptr = self.hazards.acquire();
        let mut it = Iter {
            map: self,
            hptr,
            offset: 0,
            elem: ptr::null_mut(),
        };
        it.prime();
        it
    }
}

impl<K, V> Drop for LfMap<K, V> {
    fn drop(&mut self) {
        for slot in self.table.iter_mut() {
            let mut cur = strip::<K, V>(*slot.get_mut());
            while !cur.is_null() {
                let node = unsafe { Box::from_raw(cur) };
                cur = strip::<K, V>(node.next.load(Ordering::Relaxed));
            }
        }
    }
}

/// A sloppy bucket-chain iterator over an [`LfMap`]'s live entries.
pub struct Iter<'a, K, V> {
    map: &'a LfMap<K, V>,
    hptr: HazardRecord<'a, Node<K, V>>,
    offset: usize,
    elem: *mut Node<K, V>,
}

impl<'a, K, V> Iter<'a, K, V> {
    /// Advance to the first non-empty bucket at or after `offset`,
    /// protecting whatever node it lands on.
    fn prime(&mut self) {
        while self.offset < self.map.table.len() && self.elem.is_null() {
            std::sync::atomic::fence(Ordering::SeqCst);
            let tmp = self.map.table[self.offset].load(Ordering::Acquire);
            self.hptr.set(1, strip::<K, V>(tmp));

            if self.map.table[self.offset].load(Ordering::Acquire) != tmp || is_deleted(tmp) {
                continue;
            }

            self.elem = strip::<K, V>(tmp);
            self.hptr.set(0, self.elem);

            if self.elem.is_null() {
                self.offset += 1;
            }
        }
    }

    fn advance(&mut self) {
        let node = unsafe { &*self.elem };
        let mut tmp;

        loop {
            tmp = node.next.load(Ordering::Acquire);
            self.hptr.set(1, strip::<K, V>(tmp));

            if node.next.load(Ordering::Acquire) != tmp {
                continue;
            }

            self.hptr.set(0, strip::<K, V>(tmp));
            break;
        }

        if is_deleted(tmp) {
            self.elem = ptr::null_mut();
            self.prime();
        } else {
            let stripped = strip::<K, V>(tmp);
            if !stripped.is_null() {
                self.elem = stripped;
            } else {
                self.offset += 1;
                self.elem = ptr::null_mut();
                self.prime();
            }
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.elem.is_null() {
            return None;
        }

        let node = unsafe { &*self.elem };
        let item = (node.key.clone(), node.value.clone());
        self.advance();
        Some(item)
    }
}

/// `LfMap<K, ()>` wrapped as a set, exactly as `lockfree_hash_set.h` wraps
/// `lockfree_hash_map<K, int, H>`.
pub struct LfSet<K> {
    inner: LfMap<K, ()>,
}

impl<K> LfSet<K>
where
    K: Ord + Clone + std::hash::Hash,
{
    pub fn new(magnitude: u16) -> Self {
        Self {
            inner: LfMap::new(magnitude),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn insert(&self, key: K) -> bool {
        self.inner.insert(key, ())
    }

    pub fn remove(&self, key: &K) -> bool {
        self.inner.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.inner.iter().map(|(k, _)| k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_lookup_remove() {
        let map: LfMap<u64, u64> = LfMap::new(4);

        assert!(map.insert(1, 100));
        assert!(map.insert(2, 200));
        assert!(!map.insert(1, 999));

        assert_eq!(map.lookup(&1), Some(100));
        assert_eq!(map.lookup(&2), Some(200));
        assert_eq!(map.lookup(&3), None);

        assert!(map.remove(&1));
        assert_eq!(map.lookup(&1), None);
        assert!(!map.remove(&1));
        assert!(map.contains(&2));
    }

    #[test]
    fn iterator_sees_live_entries() {
        let map: LfMap<u64, u64> = LfMap::new(3);
        for i in 0..20u64 {
            map.insert(i, i * i);
        }
        map.remove(&5);

        let mut seen: Vec<(u64, u64)> = map.iter().collect();
        seen.sort();

        assert_eq!(seen.len(), 19);
        assert!(seen.iter().all(|&(k, v)| v == k * k));
        assert!(seen.iter().all(|&(k, _)| k != 5));
    }

    #[test]
    fn set_wrapper() {
        let set: LfSet<String> = LfSet::new(4);
        assert!(set.insert("a".to_string()));
        assert!(!set.insert("a".to_string()));
        assert!(set.contains(&"a".to_string()));
        assert!(set.remove(&"a".to_string()));
        assert!(!set.contains(&"a".to_string()));
    }

    #[test]
    fn concurrent_insert_remove_stress() {
        let map = Arc::new(LfMap::<u64, u64>::new(5));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..500u64 {
                        let key = t * 500 + i;
                        map.insert(key, key);
                        assert_eq!(map.lookup(&key), Some(key));
                        if i % 3 == 0 {
                            map.remove(&key);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }
}
