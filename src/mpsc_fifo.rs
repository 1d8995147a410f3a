//! Lock-free multi-producer, single-consumer FIFO.
//!
//! Ported from `lockfree_mpsc_fifo.h`: a Michael-Scott queue with a
//! permanent sentinel head node. `push` is safe to call from any number of
//! threads concurrently; `pop` is not — only one thread may ever dequeue,
//! which this module enforces at compile time with [`Consumer`] rather than
//! the original's bare "don't do that" comment.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use crate::gc::Collector;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    data: AtomicPtr<T>,
}

impl<T> Node<T> {
    fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            data: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    fn holding(val: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            data: AtomicPtr::new(Box::into_raw(Box::new(val))),
        }))
    }
}

/// A multi-producer, single-consumer lock-free queue.
///
/// `push` may be called from any thread. `pop` is only reachable through a
/// [`Consumer`] handle, of which there is ever exactly one per queue — the
/// single-consumer discipline `lockfree_mpsc_fifo.h` leaves to caller
/// discipline is a type-level guarantee here instead.
pub struct MpscFifo<T> {
    gc: Arc<Collector>,
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    popping: AtomicBool,
}

unsafe impl<T: Send> Send for MpscFifo<T> {}
unsafe impl<T: Send> Sync for MpscFifo<T> {}

impl<T> MpscFifo<T> {
    pub fn new(gc: Arc<Collector>) -> Self {
        let sentinel = Node::sentinel();
        Self {
            gc,
            head: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            popping: AtomicBool::new(false),
        }
    }

    /// Split into the producer side (`Self`, cheaply `Arc`-shared by
    /// callers) and the single [`Consumer`] token allowed to `pop` it.
    pub fn consumer(self: &Arc<Self>) -> Consumer<T> {
        Consumer {
            queue: Arc::clone(self),
        }
    }

    /// Append `val` to the back of the queue. Lock-free, safe from any
    /// number of concurrent producers.
    pub fn push(&self, val: T) {
        let nn = Node::holding(val);
        let mut tail;

        loop {
            tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { &*tail }.next.compare_exchange(
                ptr::null_mut(),
                nn,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );

            match next {
                Ok(_) => break,
                Err(next) => {
                    let _ = self.tail.compare_exchange(
                        tail,
                        next,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
            }
        }

        let _ = self
            .tail
            .compare_exchange(tail, nn, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// The single-consumer-only dequeue. Called exclusively through
    /// [`Consumer::pop`], which is why this takes `&self` rather than
    /// `&mut self` — the token, not the borrow checker, is what keeps it
    /// single-caller.
    fn pop(&self) -> Option<T> {
        let already_popping = self.popping.swap(true, Ordering::AcqRel);
        debug_assert!(!already_popping, "two consumers called MpscFifo::pop concurrently");

        let result = self.pop_inner();

        self.popping.store(false, Ordering::Release);
        result
    }

    fn pop_inner(&self) -> Option<T> {
        std::sync::atomic::fence(Ordering::SeqCst);
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let next = unsafe { &*head }.next.load(Ordering::Acquire);

        if next.is_null() {
            return None;
        }

        if head == tail {
            let _ = self
                .tail
                .compare_exchange(tail, next, Ordering::SeqCst, Ordering::SeqCst);
        }

        self.head.store(next, Ordering::Release);
        let data = unsafe { &*next }.data.swap(ptr::null_mut(), Ordering::AcqRel);
        debug_assert!(!data.is_null());

        self.gc.retire(head);
        Some(*unsafe { Box::from_raw(data) })
    }
}

impl<T> Drop for MpscFifo<T> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            let data = node.data.load(Ordering::Relaxed);
            if !data.is_null() {
                unsafe { drop(Box::from_raw(data)) };
            }
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

/// The sole handle allowed to dequeue from an [`MpscFifo`]. Not `Clone` —
/// two live `Consumer`s for the same queue would violate the
/// single-consumer contract `lockfree_mpsc_fifo.h` requires of `pop`.
pub struct Consumer<T> {
    queue: Arc<MpscFifo<T>>,
}

unsafe impl<T: Send> Send for Consumer<T> {}

impl<T> Consumer<T> {
    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn push_pop_in_order() {
        let gc = Collector::new();
        let q = Arc::new(MpscFifo::new(Arc::clone(&gc)));
        let mut consumer = q.consumer();

        q.push(1);
        q.push(2);
        q.push(3);

        assert_eq!(consumer.pop(), Some(1));
        assert_eq!(consumer.pop(), Some(2));
        assert_eq!(consumer.pop(), Some(3));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn no_leaks_on_drop_and_pop() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }
        DROPS.store(0, Ordering::Relaxed);

        let gc = Collector::new();
        let q = Arc::new(MpscFifo::new(Arc::clone(&gc)));
        let mut consumer = q.consumer();

        for _ in 0..500 {
            q.push(Tracked);
        }
        for _ in 0..250 {
            consumer.pop();
        }

        drop(consumer);
        drop(q);

        assert_eq!(DROPS.load(Ordering::Relaxed), 500);
    }

    #[test]
    fn concurrent_producers_single_consumer() {
        const PRODUCERS: usize = 8;
        const OPS: usize = 5_000;

        let gc = Collector::new();
        let q = Arc::new(MpscFifo::new(Arc::clone(&gc)));
        let mut consumer = q.consumer();

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|t| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..OPS {
                        q.push(t * OPS + i);
                    }
                })
            })
            .collect();

        let total = PRODUCERS * OPS;
        let mut seen = 0usize;
        while seen < total {
            if consumer.pop().is_some() {
                seen += 1;
            } else {
                thread::yield_now();
            }
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(consumer.pop(), None);
    }
}
