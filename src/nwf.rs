//! Nearly-wait-free resizable hash map.
//!
//! Ported from Cliff Click's `NonBlockingHashMap` design (the algorithm is
//! lock-free overall because of resizing, but any operation that doesn't hit
//! a resize is wait-free). Values are stored behind a tagged `usize` per
//! slot rather than the original's raw-pointer sentinels
//! (`reinterpret_cast<T*>(2)` and friends) — the tag scheme is identical,
//! just expressed as small integer constants a real heap pointer can never
//! collide with, since every boxed payload is forced to at least 2-byte
//! alignment (see [`Boxed`]).
//!
//! Growth, cooperative copying, and reclamation follow `nwf_hash_map.h`
//! (`put_if_match`, `table::resize`, `table::help_copy`, `table::copy_slot`)
//! operation for operation.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::gc::Collector;

const MIN_SIZE_LOG: u32 = 3;
const MIN_SIZE: usize = 1 << MIN_SIZE_LOG;
const REPROBE_LIMIT: usize = 10;

mod tag {
    pub const NULL: usize = 0;
    pub const NO_MATCH_OLD: usize = 2;
    pub const MATCH_ANY: usize = 4;
    pub const TOMBSTONE: usize = 8;
    pub const TOMBPRIME: usize = 9;

    pub fn is_special(raw: usize) -> bool {
        raw <= 9
    }
    pub fn is_null(raw: usize) -> bool {
        raw == NULL
    }
    pub fn is_no_match_old(raw: usize) -> bool {
        raw == NO_MATCH_OLD
    }
    pub fn is_match_any(raw: usize) -> bool {
        raw == MATCH_ANY
    }
    pub fn is_tombstone(raw: usize) -> bool {
        raw == TOMBSTONE || raw == TOMBPRIME
    }
    pub fn is_tombprime(raw: usize) -> bool {
        raw == TOMBPRIME
    }
    pub fn is_empty(raw: usize) -> bool {
        is_tombstone(raw) || is_null(raw)
    }
    pub fn is_primed(raw: usize) -> bool {
        raw & 1 != 0
    }
    pub fn prime(raw: usize) -> usize {
        raw | 1
    }
    pub fn deprime(raw: usize) -> usize {
        raw & !1usize
    }
}

/// Forces at least 2-byte alignment on the boxed payload so tag bit 0 is
/// always free on a real allocation, regardless of `T`'s own alignment.
#[repr(align(2))]
struct Boxed<T>(T);

unsafe fn free_boxed<T>(raw: usize) {
    if !tag::is_special(raw) {
        drop(Box::from_raw(tag::deprime(raw) as *mut Boxed<T>));
    }
}

unsafe fn unwrap_ref<'a, T>(raw: usize) -> &'a T {
    &(*(tag::deprime(raw) as *const Boxed<T>)).0
}

fn raw_equals_value<V: PartialEq>(raw: usize, value: &V) -> bool {
    !tag::is_special(raw) && unsafe { unwrap_ref::<V>(raw) == value }
}

/// What an operation expects to find in a slot before it overwrites it.
enum Expected<'a, V> {
    /// Internal-only: used by `copy_slot` to install a value into the new
    /// table without touching size accounting.
    Null,
    NoMatchOld,
    MatchAny,
    Tombstone,
    Value(&'a V),
}

impl<'a, V: PartialEq> Expected<'a, V> {
    fn is_null(&self) -> bool {
        matches!(self, Expected::Null)
    }
    fn is_no_match_old(&self) -> bool {
        matches!(self, Expected::NoMatchOld)
    }
    fn is_match_any(&self) -> bool {
        matches!(self, Expected::MatchAny)
    }
    fn is_tombstone(&self) -> bool {
        matches!(self, Expected::Tombstone)
    }

    /// Raw identity to compare `v` against with ordinary pointer-style
    /// inequality, for the sentinel variants. `Value` never collides with a
    /// raw slot contents by identity, only by unwrapped equality.
    fn raw_identity(&self) -> Option<usize> {
        match self {
            Expected::Null => Some(tag::NULL),
            Expected::NoMatchOld => Some(tag::NO_MATCH_OLD),
            Expected::MatchAny => Some(tag::MATCH_ANY),
            Expected::Tombstone => Some(tag::TOMBSTONE),
            Expected::Value(_) => None,
        }
    }

    fn equals_raw(&self, v_raw: usize) -> bool {
        match self {
            Expected::Value(v) => !tag::is_special(v_raw) && **v == *unsafe { unwrap_ref::<V>(v_raw) },
            _ => false,
        }
    }
}

/// What to install. `Tombstone` needs no allocation; `Value` is boxed fresh
/// on every CAS attempt it takes part in, exactly as the original's
/// `wrapper::cas` copy-constructs its argument once per attempt.
enum PutVal<V> {
    Tombstone,
    Value(V),
}

impl<V: Clone> PutVal<V> {
    fn is_tombstone(&self) -> bool {
        matches!(self, PutVal::Tombstone)
    }

    fn to_raw(&self) -> usize {
        match self {
            PutVal::Tombstone => tag::TOMBSTONE,
            PutVal::Value(v) => Box::into_raw(Box::new(Boxed(v.clone()))) as usize,
        }
    }
}

struct Node {
    key: AtomicUsize,
    val: AtomicUsize,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            key: AtomicUsize::new(tag::NULL),
            val: AtomicUsize::new(tag::NULL),
        }
    }
}

struct Table<K, V> {
    capacity: usize,
    depth: usize,
    slots: AtomicU64,
    elems: AtomicU64,
    copy_idx: AtomicU64,
    copy_done: AtomicU64,
    next: AtomicPtr<Table<K, V>>,
    nodes: Box<[Node]>,
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K, V> Table<K, V> {
    fn new(capacity: usize, depth: usize) -> Box<Self> {
        debug_assert!(capacity > 0 && capacity & (capacity - 1) == 0);
        let mut nodes = Vec::with_capacity(capacity);
        nodes.resize_with(capacity, Node::default);

        Box::new(Self {
            capacity,
            depth,
            slots: AtomicU64::new(0),
            elems: AtomicU64::new(0),
            copy_idx: AtomicU64::new(0),
            copy_done: AtomicU64::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            nodes: nodes.into_boxed_slice(),
            _marker: std::marker::PhantomData,
        })
    }

    fn inc_slots(&self) {
        self.slots.fetch_add(1, Ordering::Relaxed);
    }
    fn inc_size(&self) {
        self.elems.fetch_add(1, Ordering::Relaxed);
    }
    fn dec_size(&self) {
        self.elems.fetch_sub(1, Ordering::Relaxed);
    }
    fn size(&self) -> u64 {
        std::sync::atomic::fence(Ordering::SeqCst);
        self.elems.load(Ordering::Relaxed)
    }

    fn table_is_full(&self, reprobes: usize) -> bool {
        std::sync::atomic::fence(Ordering::SeqCst);
        reprobes >= REPROBE_LIMIT && self.slots.load(Ordering::Relaxed) >= (self.capacity >> 2) as u64
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        for node in self.nodes.iter_mut() {
            unsafe {
                free_boxed::<K>(*node.key.get_mut());
                free_boxed::<V>(tag::deprime(*node.val.get_mut()));
            }
        }
    }
}

fn reprobe_limit(capacity: usize) -> usize {
    REPROBE_LIMIT + (capacity >> 2)
}

/// A nearly-wait-free resizable hash map keyed by `K`, retiring replaced
/// tables and values through a shared [`Collector`].
///
/// `K`/`V` must be `Clone` because every slot write — including CAS retries
/// that lose the race — allocates its own boxed copy, mirroring the
/// original's per-attempt copy-construction in `wrapper<T>::cas`.
pub struct NwfMap<K, V> {
    gc: Arc<Collector>,
    table: AtomicPtr<Table<K, V>>,
    start: Instant,
    last_resize_millis: AtomicU64,
}

unsafe impl<K: Send, V: Send> Send for NwfMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for NwfMap<K, V> {}

impl<K, V> NwfMap<K, V>
where
    K: Clone + Eq + std::hash::Hash,
    V: Clone + PartialEq,
{
    pub fn new(gc: Arc<Collector>) -> Self {
        let start = Instant::now();
        Self {
            gc,
            table: AtomicPtr::new(Box::into_raw(Table::new(MIN_SIZE, 0))),
            start,
            last_resize_millis: AtomicU64::new(0),
        }
    }

    fn millis_now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn size(&self) -> u64 {
        let t = unsafe { &*self.table.load(Ordering::Acquire) };
        t.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn put(&self, key: K, value: V) -> bool {
        self.put_if_match(key, Expected::NoMatchOld, PutVal::Value(value));
        true
    }

    pub fn put_ine(&self, key: K, value: V) -> bool {
        self.put_if_match(key, Expected::Tombstone, PutVal::Value(value));
        true
    }

    pub fn cas(&self, key: K, old: &V, new: V) -> bool {
        let result = self.put_if_match(key, Expected::Value(old), PutVal::Value(new));
        raw_equals_value(result, old)
    }

    pub fn del(&self, key: K) -> bool {
        let result = self.put_if_match(key, Expected::NoMatchOld, PutVal::Tombstone);
        !tag::is_empty(result)
    }

    pub fn del_if(&self, key: K, value: &V) -> bool {
        let result = self.put_if_match(key, Expected::Value(value), PutVal::Tombstone);
        !tag::is_empty(result)
    }

    pub fn has(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let hash = finalize_hash(hash_of(key));
        std::sync::atomic::fence(Ordering::SeqCst);
        let t = unsafe { &*self.table.load(Ordering::Acquire) };
        self.get_in(t, key, hash)
    }

    /// A sloppy snapshot over the top-level table's live `(key, value)`
    /// pairs, taken at call time. Matches the original's plain-array
    /// iterator: it never yields a tombstoned slot, but it may miss a key
    /// that a concurrent resize has not yet copied forward, or one inserted
    /// after the snapshot was taken.
    pub fn iter(&self) -> Iter<K, V> {
        let t = unsafe { &*self.table.load(Ordering::Acquire) };
        let mut items = Vec::new();

        for node in t.nodes.iter() {
            let k_raw = node.key.load(Ordering::Acquire);
            if tag::is_null(k_raw) || tag::is_special(k_raw) {
                continue;
            }

            let v_raw = tag::deprime(node.val.load(Ordering::Acquire));
            if tag::is_tombstone(v_raw) || tag::is_null(v_raw) {
                continue;
            }

            let key = unsafe { unwrap_ref::<K>(k_raw) }.clone();
            let value = unsafe { unwrap_ref::<V>(v_raw) }.clone();
            items.push((key, value));
        }

        Iter {
            items: items.into_iter(),
        }
    }

    fn get_in(&self, t: &Table<K, V>, key: &K, hash: u64) -> Option<V> {
        let mask = (t.capacity - 1) as u64;
        let mut idx = (hash & mask) as usize;
        let mut reprobes = 0usize;

        loop {
            let node = &t.nodes[idx];
            let k_raw = node.key.load(Ordering::Acquire);
            let v_raw = node.val.load(Ordering::Acquire);

            if tag::is_null(k_raw) {
                return None;
            }

            let nested = t.next.load(Ordering::Acquire);

            if !tag::is_special(k_raw) && unsafe { unwrap_ref::<K>(k_raw) == key } {
                if !tag::is_primed(v_raw) {
                    if tag::is_tombstone(v_raw) || tag::is_null(v_raw) {
                        return None;
                    }
                    return Some(unsafe { unwrap_ref::<V>(v_raw) }.clone());
                }

                let nested = self.copy_slot_and_check(t, idx, true);
                return self.get_in(unsafe { &*nested }, key, hash);
            }

            reprobes += 1;

            if reprobes >= reprobe_limit(t.capacity) || tag::is_tombstone(k_raw) {
                if !nested.is_null() {
                    let nested = self.help_copy(nested);
                    return self.get_in(unsafe { &*nested }, key, hash);
                }
                return None;
            }

            idx = (idx + 1) & mask as usize;
        }
    }

    fn put_if_match(&self, key: K, exp_val: Expected<'_, V>, put_val: PutVal<V>) -> usize {
        let t = self.table.load(Ordering::Acquire);
        let ret = self.put_if_match_in(t, &key, exp_val, put_val);
        std::sync::atomic::fence(Ordering::SeqCst);
        ret
    }

    fn put_if_match_in(
        &self,
        t: *mut Table<K, V>,
        key: &K,
        exp_val: Expected<'_, V>,
        put_val: PutVal<V>,
    ) -> usize {
        let top = self.table.load(Ordering::Acquire);
        if unsafe { (*top).depth > (*t).depth } {
            return self.put_if_match_in(top, key, exp_val, put_val);
        }

        let table = unsafe { &*t };
        let hash = finalize_hash(hash_of(key));
        let mask = (table.capacity - 1) as u64;
        let mut idx = (hash & mask) as usize;
        let mut reprobes = 0usize;

        let mut k_raw;
        let mut v_raw;
        let mut nested;

        loop {
            let node = &table.nodes[idx];
            k_raw = node.key.load(Ordering::Acquire);
            v_raw = node.val.load(Ordering::Acquire);

            if tag::is_null(k_raw) {
                if put_val.is_tombstone() {
                    return tag::TOMBSTONE;
                }

                let boxed = Box::into_raw(Box::new(Boxed(key.clone()))) as usize;
                match node.key.compare_exchange(
                    tag::NULL,
                    boxed,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        table.inc_slots();
                        break;
                    }
                    Err(witness) => {
                        unsafe { free_boxed::<K>(boxed) };
                        k_raw = witness;
                    }
                }
            }

            nested = table.next.load(Ordering::Acquire);

            if !tag::is_special(k_raw) && unsafe { unwrap_ref::<K>(k_raw) == key } {
                break;
            }

            reprobes += 1;

            if reprobes >= reprobe_limit(table.capacity) || tag::is_tombstone(k_raw) {
                let nested = self.resize(table);
                if !exp_val.is_null() {
                    self.help_copy(nested);
                }
                return self.put_if_match_in(nested, key, exp_val, put_val);
            }

            idx = (idx + 1) & mask as usize;
        }

        let node = &table.nodes[idx];

        if let PutVal::Value(v) = &put_val {
            if !tag::is_special(v_raw) && unsafe { unwrap_ref::<V>(v_raw) == v } {
                return v_raw;
            }
        }

        let mut nested = nested;
        if nested.is_null()
            && ((tag::is_null(v_raw) && table.table_is_full(reprobes)) || tag::is_primed(v_raw))
        {
            nested = self.resize(table);
        }

        if !nested.is_null() {
            let nested = self.copy_slot_and_check(table, idx, !exp_val.is_null());
            return self.put_if_match_in(nested, key, exp_val, put_val);
        }

        loop {
            debug_assert!(!tag::is_primed(v_raw));

            let identity_mismatch = exp_val.raw_identity().map_or(true, |id| v_raw != id);
            let refuse = !exp_val.is_no_match_old()
                && identity_mismatch
                && (!exp_val.is_match_any() || tag::is_tombstone(v_raw) || tag::is_null(v_raw))
                && !(tag::is_null(v_raw) && exp_val.is_tombstone())
                && (exp_val.is_null() || !exp_val.equals_raw(v_raw));

            if refuse {
                return v_raw;
            }

            let candidate = put_val.to_raw();
            let witness = match node.val.compare_exchange(
                v_raw,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(prev) => prev,
                Err(actual) => {
                    if !tag::is_special(candidate) {
                        unsafe { free_boxed::<V>(candidate) };
                    }
                    actual
                }
            };

            if witness == v_raw {
                if !exp_val.is_null() {
                    if (tag::is_null(v_raw) || tag::is_tombstone(v_raw)) && !put_val.is_tombstone() {
                        table.inc_size();
                    }
                    if !(tag::is_null(v_raw) || tag::is_tombstone(v_raw)) && put_val.is_tombstone() {
                        table.dec_size();
                    }
                    if tag::is_null(v_raw) {
                        return tag::TOMBSTONE;
                    }
                }

                if !tag::is_special(v_raw) {
                    self.gc.retire(tag::deprime(v_raw) as *mut Boxed<V>);
                }
                return v_raw;
            }

            if tag::is_primed(witness) {
                let nested = self.copy_slot_and_check(table, idx, !exp_val.is_null());
                return self.put_if_match_in(nested, key, exp_val, put_val);
            }

            v_raw = witness;
        }
    }

    fn help_copy(&self, t: *mut Table<K, V>) -> *mut Table<K, V> {
        let top = self.table.load(Ordering::Acquire);
        let top_ref = unsafe { &*top };

        if top_ref.next.load(Ordering::Acquire).is_null() {
            return t;
        }

        self.table_help_copy(top_ref, false);
        t
    }

    fn resize(&self, table: &Table<K, V>) -> *mut Table<K, V> {
        let nested = table.next.load(Ordering::Acquire);
        if !nested.is_null() {
            return nested;
        }

        let old_sz = table.size() as usize;
        let mut new_sz = old_sz;

        if old_sz >= (table.capacity >> 2) {
            new_sz = table.capacity << 1;
            if old_sz >= (table.capacity >> 1) {
                new_sz = table.capacity << 2;
            }
        }

        let now = self.millis_now();
        let last = self.last_resize_millis.load(Ordering::Relaxed);

        if new_sz < table.capacity
            && now <= last + 1000
            && table.slots.load(Ordering::Relaxed) >= (old_sz as u64) << 1
        {
            new_sz = table.capacity << 1;
        }

        if new_sz < table.capacity {
            new_sz = table.capacity;
        }

        let mut log2 = MIN_SIZE_LOG;
        while (1usize << log2) < new_sz {
            log2 += 1;
        }

        let nested = table.next.load(Ordering::Acquire);
        if !nested.is_null() {
            return nested;
        }

        let new_table = Box::into_raw(Table::new(1usize << log2, table.depth + 1));

        let nested = table.next.load(Ordering::Acquire);
        if !nested.is_null() {
            unsafe { drop(Box::from_raw(new_table)) };
            return nested;
        }

        match table.next.compare_exchange(
            std::ptr::null_mut(),
            new_table,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => new_table,
            Err(witness) => {
                unsafe { drop(Box::from_raw(new_table)) };
                witness
            }
        }
    }

    fn table_help_copy(&self, table: &Table<K, V>, copy_all: bool) {
        let nested = table.next.load(Ordering::Acquire);
        debug_assert!(!nested.is_null());
        let min_copy_work = table.capacity.min(1024);
        let mut panic = false;
        let mut idx;

        loop {
            if table.copy_done.load(Ordering::Acquire) >= table.capacity as u64 {
                break;
            }

            if !panic {
                idx = table.copy_idx.load(Ordering::Acquire);
                while (idx as usize) < (table.capacity << 1)
                    && table
                        .copy_idx
                        .compare_exchange(
                            idx,
                            idx + min_copy_work as u64,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_err()
                {
                    idx = table.copy_idx.load(Ordering::Acquire);
                }

                if !((idx as usize) < (table.capacity << 1)) {
                    panic = true;
                }
            } else {
                idx = table.copy_idx.load(Ordering::Acquire);
            }

            let mut work_done = 0usize;
            for i in 0..min_copy_work {
                if self.copy_slot(table, (idx as usize + i) & (table.capacity - 1), nested) {
                    work_done += 1;
                }
            }

            if work_done > 0 {
                self.copy_check_and_promote(table, work_done as u64);
            }

            if !copy_all && !panic {
                return;
            }
        }

        self.copy_check_and_promote(table, 0);
    }

    fn copy_slot_and_check(&self, table: &Table<K, V>, idx: usize, should_help: bool) -> *mut Table<K, V> {
        let nested = table.next.load(Ordering::Acquire);
        debug_assert!(!nested.is_null());

        if self.copy_slot(table, idx, nested) {
            self.copy_check_and_promote(table, 1);
        }

        if should_help {
            self.help_copy(nested)
        } else {
            nested
        }
    }

    fn copy_check_and_promote(&self, table: &Table<K, V>, work_done: u64) {
        let mut done = table.copy_done.load(Ordering::Acquire);
        debug_assert!(done + work_done <= table.capacity as u64);

        if work_done > 0 {
            loop {
                match table.copy_done.compare_exchange(
                    done,
                    done + work_done,
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(witness) => {
                        done = witness;
                        debug_assert!(done + work_done <= table.capacity as u64);
                    }
                }
            }
        }

        let nested = table.next.load(Ordering::Acquire);
        let top = self.table.load(Ordering::Acquire);

        if done + work_done == table.capacity as u64 && std::ptr::eq(top, table) {
            let table_ptr = top;
            if self
                .table
                .compare_exchange(table_ptr, nested, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.last_resize_millis.store(self.millis_now(), Ordering::Release);
                self.gc.retire(table_ptr);
            }
        }
    }

    fn copy_slot(&self, table: &Table<K, V>, idx: usize, new_table: *mut Table<K, V>) -> bool {
        let node = &table.nodes[idx];
        let mut kwitness = node.key.load(Ordering::Acquire);

        while tag::is_null(kwitness) {
            match node.key.compare_exchange(
                tag::NULL,
                tag::TOMBSTONE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    let mut tmp = node.val.load(Ordering::Acquire);
                    while node
                        .val
                        .compare_exchange(tmp, tag::TOMBPRIME, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        tmp = node.val.load(Ordering::Acquire);
                    }
                    return true;
                }
                Err(witness) => kwitness = witness,
            }
        }

        if tag::is_tombstone(kwitness) {
            return false;
        }

        let mut old_val = node.val.load(Ordering::Acquire);

        loop {
            if tag::is_primed(old_val) {
                break;
            }

            let candidate = if !tag::is_null(old_val) && !tag::is_tombstone(old_val) {
                tag::prime(old_val)
            } else {
                tag::TOMBPRIME
            };

            match node
                .val
                .compare_exchange(old_val, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    if candidate == tag::TOMBPRIME {
                        return true;
                    }
                    old_val = candidate;
                    break;
                }
                Err(witness) => old_val = witness,
            }
        }

        if tag::is_tombprime(old_val) {
            return false;
        }

        let key_raw = node.key.load(Ordering::Acquire);
        let old_unboxed = tag::deprime(old_val);
        debug_assert_ne!(old_unboxed, tag::TOMBSTONE);
        unsafe { &*new_table }.inc_size();

        let key_ref = unsafe { unwrap_ref::<K>(key_raw) };
        // Clones the value into a freshly boxed slot in the new table;
        // `old_unboxed`'s own box is retired separately below once the
        // source slot is marked TOMBPRIME.
        self.put_if_match_in(
            new_table,
            key_ref,
            Expected::Null,
            PutVal::Value(unsafe { unwrap_ref::<V>(old_unboxed) }.clone()),
        );

        let mut witness = node.val.compare_exchange(
            old_val,
            tag::TOMBPRIME,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        while let Err(w) = witness {
            old_val = w;
            witness = node.val.compare_exchange(
                old_val,
                tag::TOMBPRIME,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }

        if tag::is_tombprime(old_val) {
            unsafe { &*new_table }.dec_size();
            return false;
        }

        if !tag::is_special(old_val) {
            self.gc.retire(tag::deprime(old_val) as *mut Boxed<V>);
        }
        true
    }
}

impl<K, V> Drop for NwfMap<K, V> {
    fn drop(&mut self) {
        let t = *self.table.get_mut();
        unsafe { drop(Box::from_raw(t)) };
    }
}

/// Snapshot iterator returned by [`NwfMap::iter`].
pub struct Iter<K, V> {
    items: std::vec::IntoIter<(K, V)>,
}

impl<K, V> Iterator for Iter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}

fn hash_of<K: std::hash::Hash>(key: &K) -> u64 {
    use std::hash::Hasher;
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// `lookup3`-style 64-bit finalizer, giving the probe sequence the same
/// avalanche behavior `e::lookup3_64` provides the original regardless of
/// the quality of the caller-supplied hash.
fn finalize_hash(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_del_roundtrip() {
        let gc = Collector::new();
        let map: NwfMap<String, u64> = NwfMap::new(Arc::clone(&gc));

        assert!(map.put("a".to_string(), 1));
        assert!(map.put("b".to_string(), 2));
        assert_eq!(map.get(&"a".to_string()), Some(1));
        assert_eq!(map.get(&"b".to_string()), Some(2));
        assert_eq!(map.get(&"c".to_string()), None);

        assert!(map.del("a".to_string()));
        assert_eq!(map.get(&"a".to_string()), None);
        assert!(!map.del("a".to_string()));
    }

    #[test]
    fn put_ine_does_not_overwrite() {
        let gc = Collector::new();
        let map: NwfMap<u64, u64> = NwfMap::new(Arc::clone(&gc));

        map.put_ine(1, 10);
        map.put_ine(1, 20);
        assert_eq!(map.get(&1), Some(10));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let gc = Collector::new();
        let map: NwfMap<u64, u64> = NwfMap::new(Arc::clone(&gc));

        for i in 0..500u64 {
            map.put(i, i * 2);
        }
        for i in 0..500u64 {
            assert_eq!(map.get(&i), Some(i * 2));
        }
        assert_eq!(map.size(), 500);
    }

    #[test]
    fn iter_sees_live_entries_only() {
        let gc = Collector::new();
        let map: NwfMap<u64, u64> = NwfMap::new(Arc::clone(&gc));

        for i in 0..50u64 {
            map.put(i, i * 10);
        }
        for i in 0..10u64 {
            map.del(i);
        }

        let mut seen: Vec<(u64, u64)> = map.iter().collect();
        seen.sort();

        assert_eq!(seen.len(), 40);
        assert!(seen.iter().all(|&(k, v)| v == k * 10));
        assert!(seen.iter().all(|&(k, _)| k >= 10));
    }

    #[test]
    fn concurrent_put_get_stress() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let gc = Collector::new();
        let map = StdArc::new(NwfMap::<u64, u64>::new(Arc::clone(&gc)));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = StdArc::clone(&map);
                thread::spawn(move || {
                    for i in 0..2000u64 {
                        let key = t * 2000 + i;
                        map.put(key, key);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        for t in 0..8u64 {
            for i in 0..2000u64 {
                let key = t * 2000 + i;
                assert_eq!(map.get(&key), Some(key));
            }
        }
    }
}
