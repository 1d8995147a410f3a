//! Hazard pointers: safe memory reclamation for lock-free objects.
//!
//! Implements the scheme from Maged M. Michael, "Hazard Pointers: Safe
//! Memory Reclamation for Lock-Free Objects" (IEEE TPDS 15(6), 2004). An
//! object is only freed once `retire` has been called on it *and* no
//! hazard record anywhere in the domain still holds that pointer in one of
//! its protected slots.
//!
//! `retire` does not touch the calling record's own protected slots, so a
//! `set(slot, ptr)` followed by `retire(ptr)` on the same record still
//! leaves `ptr` usable until the slot is cleared or the record is released.

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

/// Fixed number of protected slots per hazard record, matching the lock-free
/// map built on top of this (C5 needs at most three pointers live at once:
/// predecessor, current, successor).
const SLOTS: usize = 3;

struct HazardRec<T> {
    taslock: AtomicBool,
    next: AtomicPtr<HazardRec<T>>,
    ptrs: [AtomicPtr<T>; SLOTS],
    // Only ever touched by whichever thread currently holds `taslock`, which
    // is the same synchronization the original relies on for its rcount/rlist
    // fields — they are deliberately not behind their own lock.
    rcount: UnsafeCell<u64>,
    rlist: UnsafeCell<Vec<*mut T>>,
}

unsafe impl<T> Send for HazardRec<T> {}
unsafe impl<T> Sync for HazardRec<T> {}

impl<T> HazardRec<T> {
    fn new() -> Self {
        Self {
            taslock: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
            ptrs: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            rcount: UnsafeCell::new(0),
            rlist: UnsafeCell::new(Vec::new()),
        }
    }

    /// Free every retired pointer this record holds that no hazard record in
    /// `domain` currently protects. Caller must hold `taslock`.
    unsafe fn scan(&self, domain: &HazardDomain<T>) {
        let mut hazardous: HashSet<*mut T> = HashSet::new();
        let mut cur = domain.recs.load(Ordering::Acquire);

        while !cur.is_null() {
            let rec = unsafe { &*cur };
            for slot in &rec.ptrs {
                let p = slot.load(Ordering::Acquire);
                if !p.is_null() {
                    hazardous.insert(p);
                }
            }
            cur = rec.next.load(Ordering::Acquire);
        }

        let rlist = unsafe { &mut *self.rlist.get() };
        let pending = std::mem::take(rlist);
        let rcount = unsafe { &mut *self.rcount.get() };
        *rcount = 0;

        for p in pending {
            if hazardous.contains(&p) {
                rlist.push(p);
                *rcount += 1;
            } else {
                unsafe { drop(Box::from_raw(p)) };
            }
        }
    }
}

/// A domain of hazard-protected objects of type `T`. Construct one per
/// logical structure (e.g. one per [`crate::lfmap::LfMap`] instance) and
/// call [`HazardDomain::acquire`] once per participating thread.
pub struct HazardDomain<T> {
    recs: AtomicPtr<HazardRec<T>>,
    num_recs: AtomicU64,
}

impl<T> Default for HazardDomain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HazardDomain<T> {
    pub fn new() -> Self {
        Self {
            recs: AtomicPtr::new(ptr::null_mut()),
            num_recs: AtomicU64::new(0),
        }
    }

    /// Claim an idle record via test-and-set, or allocate and register a new
    /// one if every existing record is in use.
    pub fn acquire(&self) -> HazardRecord<'_, T> {
        let mut cur = self.recs.load(Ordering::Acquire);

        while !cur.is_null() {
            let rec = unsafe { &*cur };
            if !rec.taslock.swap(true, Ordering::Acquire) {
                return HazardRecord {
                    domain: self,
                    rec: cur,
                };
            }
            cur = rec.next.load(Ordering::Acquire);
        }

        let newrec = Box::into_raw(Box::new(HazardRec::new()));
        unsafe { (*newrec).taslock.store(true, Ordering::Relaxed) };

        let mut head = self.recs.load(Ordering::Acquire);
        loop {
            unsafe { (*newrec).next.store(head, Ordering::Relaxed) };
            match self
                .recs
                .compare_exchange_weak(head, newrec, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(witness) => head = witness,
            }
        }
        self.num_recs.fetch_add(1, Ordering::Relaxed);

        HazardRecord {
            domain: self,
            rec: newrec,
        }
    }

    /// Clear every record's protected slots, then run a full scan over every
    /// record's retire list. Used by callers that need a strong "nothing is
    /// protected anymore" barrier (e.g. before a bulk teardown).
    pub fn force_scan(&self) {
        let mut cur = self.recs.load(Ordering::Acquire);
        while !cur.is_null() {
            let rec = unsafe { &*cur };
            while rec.taslock.swap(true, Ordering::Acquire) {
                std::hint::spin_loop();
            }
            for slot in &rec.ptrs {
                slot.store(ptr::null_mut(), Ordering::SeqCst);
            }
            rec.taslock.store(false, Ordering::Release);
            cur = rec.next.load(Ordering::Acquire);
        }

        let mut cur = self.recs.load(Ordering::Acquire);
        while !cur.is_null() {
            let rec = unsafe { &*cur };
            while rec.taslock.swap(true, Ordering::Acquire) {
                std::hint::spin_loop();
            }
            unsafe { rec.scan(self) };
            rec.taslock.store(false, Ordering::Release);
            cur = rec.next.load(Ordering::Acquire);
        }
    }
}

impl<T> Drop for HazardDomain<T> {
    fn drop(&mut self) {
        // A domain going away implies no thread still holds a record into
        // it (same assumption `Collector::drop` makes about its registry),
        // so every still-retired pointer is simply freed rather than
        // re-scanned.
        let mut cur = *self.recs.get_mut();
        while !cur.is_null() {
            let rec = unsafe { Box::from_raw(cur) };
            cur = rec.next.load(Ordering::Relaxed);
            let rlist = unsafe { &mut *rec.rlist.get() };
            for p in rlist.drain(..) {
                unsafe { drop(Box::from_raw(p)) };
            }
        }
    }
}

/// A thread's claim on one hazard record. Not `Clone`; releases the record
/// (clearing its slots) on drop.
pub struct HazardRecord<'a, T> {
    domain: &'a HazardDomain<T>,
    rec: *mut HazardRec<T>,
}

unsafe impl<'a, T> Send for HazardRecord<'a, T> {}

impl<'a, T> HazardRecord<'a, T> {
    /// Publish `ptr` as protected in slot `slot_num`. A full-barrier store:
    /// every hazard pointer write must be visible to concurrent `scan`s
    /// before the pointed-to object can be dereferenced.
    pub fn set(&self, slot_num: usize, ptr: *mut T) {
        debug_assert!(slot_num < SLOTS);
        let rec = unsafe { &*self.rec };
        rec.ptrs[slot_num].store(ptr, Ordering::SeqCst);
    }

    /// Defer `ptr`'s destruction. Does not affect this record's own
    /// protected slots — a concurrent `set` of the same pointer keeps it
    /// alive regardless of when `retire` is called.
    pub fn retire(&self, ptr: *mut T) {
        let rec = unsafe { &*self.rec };
        let rlist = unsafe { &mut *rec.rlist.get() };
        let rcount = unsafe { &mut *rec.rcount.get() };

        if let Some(slot) = rlist.iter_mut().find(|p| p.is_null()) {
            *slot = ptr;
        } else {
            rlist.push(ptr);
        }
        *rcount += 1;

        let threshold = self.domain.num_recs.load(Ordering::Relaxed) as f64 * SLOTS as f64 * 1.2;
        if *rcount as f64 >= threshold {
            unsafe { rec.scan(self.domain) };
        }
    }
}

impl<'a, T> Drop for HazardRecord<'a, T> {
    fn drop(&mut self) {
        let rec = unsafe { &*self.rec };
        for slot in &rec.ptrs {
            slot.store(ptr::null_mut(), Ordering::SeqCst);
        }
        rec.taslock.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn retire_frees_unprotected_pointer() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }
        DROPS.store(0, Ordering::Relaxed);

        let domain: HazardDomain<Tracked> = HazardDomain::new();
        let rec = domain.acquire();

        for _ in 0..10 {
            let ptr = Box::into_raw(Box::new(Tracked));
            rec.retire(ptr);
        }
        domain.force_scan();

        assert_eq!(DROPS.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn protected_pointer_survives_scan() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }
        DROPS.store(0, Ordering::Relaxed);

        let domain: HazardDomain<Tracked> = HazardDomain::new();
        let reader = domain.acquire();
        let writer = domain.acquire();

        let ptr = Box::into_raw(Box::new(Tracked));
        reader.set(0, ptr);
        writer.retire(ptr);
        domain.force_scan();

        assert_eq!(DROPS.load(Ordering::Relaxed), 0);

        reader.set(0, ptr::null_mut());
        domain.force_scan();
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn concurrent_acquire_retire() {
        let domain: Arc<HazardDomain<u64>> = Arc::new(HazardDomain::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let domain = Arc::clone(&domain);
                thread::spawn(move || {
                    let rec = domain.acquire();
                    for i in 0..500u64 {
                        let ptr = Box::into_raw(Box::new(i));
                        rec.set(0, ptr);
                        rec.retire(ptr);
                        rec.set(0, ptr::null_mut());
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        domain.force_scan();
    }
}
