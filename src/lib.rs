//! Epoch-based reclamation substrate plus the concurrent data structures
//! built on top of it: a nearly-wait-free resizable hash map, a hazard-
//! pointer-backed lock-free hash map/set, a bounded MPMC FIFO, an unbounded
//! MPSC FIFO, and a sequence-number collector for out-of-order completion
//! tracking.
//!
//! Every reclaiming structure in this crate (`nwf`, `mpsc_fifo`, `seqno`)
//! retires through a shared [`gc::Collector`]; `lfmap` reclaims through its
//! own [`hazard::HazardDomain`] instead, since it is grounded on a different
//! source algorithm that does its own bookkeeping.

pub mod atomic;
pub mod bounded_fifo;
pub mod gc;
pub mod hazard;
pub mod lfmap;
pub mod mpsc_fifo;
pub mod nwf;
pub mod seqno;
