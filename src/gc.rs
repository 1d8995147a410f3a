//! Epoch-based garbage collector.
//!
//! Tracks per-thread quiescent states and defers destructors until no thread
//! can observe a retired object. Every other reclamation-sensitive module in
//! this crate (`nwf`, `mpsc_fifo`, `seqno`) retires through a [`Collector`]
//! rather than freeing directly.
//!
//! # Usage
//!
//! ```
//! use nwfcore::gc::Collector;
//!
//! let collector = Collector::new();
//! let handle = collector.register();
//!
//! let ptr = Box::into_raw(Box::new(42u64));
//! handle.retire(ptr);
//! handle.quiescent_state();
//! ```

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::atomic::{raise_monotonic, Timestamp};

/// A single deferred destructor: a pointer and the function that frees it,
/// type-erased so thread records and the shared list can hold any retired
/// type uniformly.
#[derive(Clone, Copy)]
struct HeapEntry {
    epoch: u64,
    ptr: *mut u8,
    deleter: unsafe fn(*mut u8),
}

// SAFETY: the pointer is only ever touched through `deleter`, which
// reconstructs the original type and is only invoked once, by whichever
// thread purges this entry.
unsafe impl Send for HeapEntry {}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.epoch.cmp(&other.epoch)
    }
}

/// A node in the shared, CAS-prepended garbage list.
struct GarbageNode {
    next: AtomicPtr<GarbageNode>,
    epoch: u64,
    ptr: *mut u8,
    deleter: unsafe fn(*mut u8),
}

/// Per-thread registration record. Linked into the collector's registry and
/// owned (for destruction purposes) by the [`Handle`] that registered it,
/// but readable by every other thread performing a quiescent scan.
struct ThreadRecord {
    next: AtomicPtr<ThreadRecord>,
    quiescent_epoch: AtomicU64,
    offline_epoch: AtomicU64,
    heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
}

impl ThreadRecord {
    fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            // Matches the original's thread_state_node: quiescent starts
            // ahead of offline so a freshly registered thread reads as
            // "online" before its first real timestamp is stored.
            quiescent_epoch: AtomicU64::new(1),
            offline_epoch: AtomicU64::new(0),
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Free every deferred destructor retired at an epoch strictly below
    /// `min_epoch`.
    fn purge(&self, min_epoch: u64) {
        let mut heap = self.heap.lock().unwrap();
        while let Some(Reverse(top)) = heap.peek() {
            if top.epoch < min_epoch {
                let Reverse(entry) = heap.pop().unwrap();
                unsafe { (entry.deleter)(entry.ptr) };
            } else {
                break;
            }
        }
    }
}

/// Owns all shared GC state: the global epoch counter, the thread registry,
/// and the shared garbage list. Construct one per logical domain of shared
/// pointers and share it (via the returned `Arc`) with every participating
/// thread.
pub struct Collector {
    timestamp: Timestamp,
    offline_transitions: AtomicU64,
    minimum: AtomicU64,
    registered: AtomicPtr<ThreadRecord>,
    registration_mutex: Mutex<()>,
    garbage: AtomicPtr<GarbageNode>,
}

impl Collector {
    /// Create a fresh collector. Not a process singleton — build and tear
    /// down as many as tests or call sites need.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            timestamp: Timestamp::new(2),
            offline_transitions: AtomicU64::new(0),
            minimum: AtomicU64::new(0),
            registered: AtomicPtr::new(ptr::null_mut()),
            registration_mutex: Mutex::new(()),
            garbage: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Register the calling thread, returning a [`Handle`] it alone should
    /// use. `Handle` is not `Clone`; its `Drop` deregisters automatically.
    pub fn register(self: &Arc<Self>) -> Handle {
        let node = Box::into_raw(Box::new(ThreadRecord::new()));
        {
            let _guard = self.registration_mutex.lock().unwrap();
            let old_head = self.registered.load(Ordering::Acquire);
            unsafe { (*node).next.store(old_head, Ordering::Relaxed) };
            self.registered.store(node, Ordering::Release);
        }
        let timestamp = self.timestamp.tick();
        unsafe { (*node).quiescent_epoch.store(timestamp, Ordering::Release) };

        Handle {
            collector: Arc::clone(self),
            node,
        }
    }

    fn deregister(&self, node: *mut ThreadRecord) {
        {
            let _guard = self.registration_mutex.lock().unwrap();
            let mut link = &self.registered;
            let mut cur = link.load(Ordering::Acquire);

            while !cur.is_null() && cur != node {
                link = unsafe { &(*cur).next };
                cur = link.load(Ordering::Acquire);
            }

            debug_assert_eq!(cur, node, "deregistering an unregistered thread_state");
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            link.store(next, Ordering::Release);
        }

        // Drain this thread's still-pending destructors into the shared list
        // — someone else's quiescent_state will eventually purge them, since
        // this thread is no longer around to do it itself.
        let pending: Vec<HeapEntry> = {
            let mut heap = unsafe { (*node).heap.lock().unwrap() };
            heap.drain().map(|Reverse(e)| e).collect()
        };
        for entry in pending {
            self.enqueue_garbage(entry.epoch, entry.ptr, entry.deleter);
        }

        // Retire the node itself through the same mechanism, rather than
        // freeing it immediately — another thread may still be mid-scan over
        // the registry and could dereference a stale `next`.
        let timestamp = self.timestamp.tick();
        unsafe fn free_thread_record(ptr: *mut u8) {
            drop(Box::from_raw(ptr as *mut ThreadRecord));
        }
        self.enqueue_garbage(timestamp, node as *mut u8, free_thread_record);
    }

    fn enqueue_garbage(&self, epoch: u64, ptr: *mut u8, deleter: unsafe fn(*mut u8)) {
        let node = Box::into_raw(Box::new(GarbageNode {
            next: AtomicPtr::new(ptr::null_mut()),
            epoch,
            ptr,
            deleter,
        }));
        let mut expect = self.garbage.load(Ordering::Acquire);

        loop {
            unsafe { (*node).next.store(expect, Ordering::Relaxed) };

            match self
                .garbage
                .compare_exchange_weak(expect, node, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(witness) => expect = witness,
            }
        }
    }

    /// The quiescent-scan algorithm. Advances `node`'s safe-point timestamp,
    /// computes the minimum quiescent epoch across all online threads, and
    /// frees everything retired before that minimum (either immediately or
    /// by handing it to the calling thread's local heap).
    fn quiescent_state(&self, node: *mut ThreadRecord) {
        let this = unsafe { &*node };
        let prev_min = self.minimum.load(Ordering::Acquire);

        let (timestamp, min_timestamp) = loop {
            let timestamp = self.timestamp.tick();
            let mut min_timestamp = timestamp;
            let transitions = self.offline_transitions.load(Ordering::Acquire);

            let mut cur = self.registered.load(Ordering::Acquire);
            while !cur.is_null() {
                if cur != node {
                    let other = unsafe { &*cur };
                    let qst = other.quiescent_epoch.load(Ordering::Acquire);
                    let oft = other.offline_epoch.load(Ordering::Acquire);

                    if qst > oft {
                        min_timestamp = min_timestamp.min(qst);
                    } else {
                        other.purge(prev_min);
                    }
                }
                cur = unsafe { (*cur).next.load(Ordering::Acquire) };
            }

            // Barrier between the transitions read above and the re-read
            // below: a thread that went offline mid-scan and came back
            // online with a smaller timestamp would otherwise be missed.
            self.timestamp.tick();

            if transitions == self.offline_transitions.load(Ordering::Acquire) {
                break (timestamp, min_timestamp);
            }
        };

        raise_monotonic(&self.minimum, min_timestamp);

        let gc_head = self.garbage.swap(ptr::null_mut(), Ordering::SeqCst);

        this.quiescent_epoch.store(timestamp, Ordering::Release);
        this.purge(min_timestamp);

        let mut cur = gc_head;
        while !cur.is_null() {
            let node_box = unsafe { Box::from_raw(cur) };
            let next = node_box.next.load(Ordering::Acquire);

            if node_box.epoch < min_timestamp {
                unsafe { (node_box.deleter)(node_box.ptr) };
            } else {
                this.heap.lock().unwrap().push(Reverse(HeapEntry {
                    epoch: node_box.epoch,
                    ptr: node_box.ptr,
                    deleter: node_box.deleter,
                }));
            }

            cur = next;
        }
    }

    fn offline(&self, node: *mut ThreadRecord) {
        let this = unsafe { &*node };
        let timestamp = self.timestamp.tick();
        this.offline_epoch.store(timestamp, Ordering::Release);
        this.quiescent_epoch.store(timestamp, Ordering::Release);
        self.timestamp.tick();
    }

    fn online(&self, node: *mut ThreadRecord) {
        let this = unsafe { &*node };
        let timestamp = self.timestamp.tick();
        this.quiescent_epoch.store(timestamp, Ordering::Release);
        raise_monotonic(&self.offline_transitions, timestamp);
        self.timestamp.tick();
    }

    fn retire_raw(&self, epoch: u64, ptr: *mut u8, deleter: unsafe fn(*mut u8)) {
        self.enqueue_garbage(epoch, ptr, deleter);
    }

    /// Defer `ptr`'s destruction, same as [`Handle::retire`] but usable by
    /// callers (`nwf`, `mpsc_fifo`) that hold a collector directly rather
    /// than a per-thread registration — `collect()` in the original is a
    /// plain method on the collector, independent of `thread_state`.
    pub fn retire<T>(&self, ptr: *mut T) {
        let timestamp = self.timestamp.tick();
        unsafe fn free_box<T>(ptr: *mut u8) {
            drop(Box::from_raw(ptr as *mut T));
        }
        self.retire_raw(timestamp, ptr as *mut u8, free_box::<T>);
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        // Mirrors the original's destructor: leftover thread records are
        // simply freed (any destructors still parked in their per-thread
        // heaps are not run — the collector itself is going away), while the
        // shared garbage list is drained and its destructors are executed.
        let mut cur = *self.registered.get_mut();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }

        let mut cur = *self.garbage.get_mut();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            unsafe { (node.deleter)(node.ptr) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

/// A registered thread's handle onto a [`Collector`]. Not `Clone` — each
/// thread owns exactly one, and dropping it deregisters automatically so a
/// forgotten `deregister_thread` call (the original's big footgun) cannot
/// happen.
pub struct Handle {
    collector: Arc<Collector>,
    node: *mut ThreadRecord,
}

// SAFETY: `node` is used only through the `Collector`'s synchronized
// registry operations and this handle's own exclusive access; the pointee
// is `Send`-safe state (atomics and a mutex).
unsafe impl Send for Handle {}

impl Handle {
    /// Advance this thread's safe-point timestamp and run the quiescent-scan
    /// algorithm: compute the minimum online epoch across all threads and
    /// free everything retired before it.
    pub fn quiescent_state(&self) {
        self.collector.quiescent_state(self.node);
    }

    /// Declare that this thread is outside any critical section. While
    /// offline, it does not pin any epoch.
    pub fn offline(&self) {
        self.collector.offline(self.node);
    }

    /// Declare that this thread has re-entered a critical section.
    pub fn online(&self) {
        self.collector.online(self.node);
    }

    /// Defer `ptr`'s destruction until no thread can observe it. `ptr` must
    /// have come from `Box::into_raw`.
    pub fn retire<T>(&self, ptr: *mut T) {
        self.collector.retire(ptr);
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.collector.deregister(self.node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn quiescent_advances_and_frees() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::Relaxed);
            }
        }
        DROP_COUNT.store(0, Ordering::Relaxed);

        let c = Collector::new();
        let h = c.register();

        for _ in 0..100 {
            let ptr = Box::into_raw(Box::new(Tracked));
            h.retire(ptr);
        }

        for _ in 0..10 {
            h.quiescent_state();
        }

        assert_eq!(DROP_COUNT.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn deregister_drains_thread_heap_to_shared_list() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::Relaxed);
            }
        }
        DROP_COUNT.store(0, Ordering::Relaxed);

        let c = Collector::new();
        let h1 = c.register();
        let h2 = c.register();

        // h2 stays pinned at an old epoch so h1's retirements land in h1's
        // local heap rather than being freed immediately.
        for _ in 0..50 {
            let ptr = Box::into_raw(Box::new(Tracked));
            h1.retire(ptr);
        }
        h1.quiescent_state();

        drop(h1);
        // h2 is still registered; purging through it should see h1's
        // drained garbage eventually once h2 advances far enough.
        for _ in 0..10 {
            h2.quiescent_state();
        }

        assert_eq!(DROP_COUNT.load(Ordering::Relaxed), 50);
        drop(h2);
    }

    #[test]
    fn offline_threads_do_not_block_reclamation() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::Relaxed);
            }
        }
        DROP_COUNT.store(0, Ordering::Relaxed);

        let c = Collector::new();
        let h1 = c.register();
        let h2 = c.register();
        h2.offline();

        for _ in 0..20 {
            let ptr = Box::into_raw(Box::new(Tracked));
            h1.retire(ptr);
        }

        for _ in 0..10 {
            h1.quiescent_state();
        }

        assert_eq!(DROP_COUNT.load(Ordering::Relaxed), 20);
        h2.online();
    }

    #[test]
    fn concurrent_register_retire_deregister() {
        let c = Collector::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let h = c.register();
                    barrier.wait();
                    for _ in 0..1_000 {
                        let ptr = Box::into_raw(Box::new(7u64));
                        h.retire(ptr);
                        h.quiescent_state();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn no_use_after_free_under_contention() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);
        struct Tracked(#[allow(dead_code)] u64);
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::Relaxed);
            }
        }
        DROP_COUNT.store(0, Ordering::Relaxed);

        let c = Collector::new();
        const THREADS: usize = 8;
        const PER_THREAD: usize = 2_000;

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let c = Arc::clone(&c);
                thread::spawn(move || {
                    let h = c.register();
                    for i in 0..PER_THREAD {
                        let ptr = Box::into_raw(Box::new(Tracked((t * PER_THREAD + i) as u64)));
                        h.retire(ptr);
                        if i % 100 == 0 {
                            h.quiescent_state();
                        }
                    }
                    for _ in 0..10 {
                        h.quiescent_state();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(DROP_COUNT.load(Ordering::Relaxed), THREADS * PER_THREAD);
    }
}
