//! Sequence-number collector.
//!
//! Tracks completion of an unbounded stream of sequential identifiers
//! arriving out of order, compacting them into a dense set of 64-byte
//! cache-line-aligned bitmap "runs" instead of one entry per identifier.
//! Ported from `seqno_collector.cc`: each run covers 512 consecutive ids as
//! eight 64-bit words, looked up by `idx = id & !511` in an embedded
//! [`NwfMap`]. A run that fills to all-ones is compressed away and the
//! collector's low-water mark (`lb_hint`) advances past it, recursing into
//! the next run when that one happens to be complete too.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::gc::Collector;
use crate::nwf::NwfMap;

/// Number of identifiers tracked per run.
const RUN_SPAN: u64 = 512;
/// Words per run (`512 / 64`).
const RUN_WORDS: usize = 8;

/// Eight 64-bit bitmaps covering 512 consecutive identifiers, aligned to a
/// cache line so concurrent runs don't false-share.
#[repr(align(64))]
struct Run {
    bits: [AtomicU64; RUN_WORDS],
}

impl Run {
    fn new() -> Self {
        Self {
            bits: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn is_full(&self) -> bool {
        self.bits.iter().all(|w| w.load(Ordering::Acquire) == u64::MAX)
    }
}

/// A handle to a [`Run`], cheap to clone and compared by identity — the
/// [`NwfMap`] this collector is built on needs `V: Clone + PartialEq` for
/// its CAS-style operations, and "the same run" is exactly the identity
/// [`SeqnoCollector::compress`] needs to CAS-delete against.
#[derive(Clone)]
struct RunHandle(Arc<Run>);

impl PartialEq for RunHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Compacts a dense set of completed identifiers into a small set of
/// bitmaps and reports the contiguous low-water mark.
///
/// # Usage
///
/// ```
/// use nwfcore::gc::Collector;
/// use nwfcore::seqno::SeqnoCollector;
///
/// let gc = Collector::new();
/// let seqno = SeqnoCollector::new(gc);
///
/// seqno.collect(0);
/// seqno.collect(2);
/// assert_eq!(seqno.lower_bound(), 1);
/// seqno.collect(1);
/// assert_eq!(seqno.lower_bound(), 3);
/// ```
pub struct SeqnoCollector {
    runs: NwfMap<u64, RunHandle>,
    lb_hint: AtomicU64,
}

impl SeqnoCollector {
    pub fn new(gc: Arc<Collector>) -> Self {
        Self {
            runs: NwfMap::new(gc),
            lb_hint: AtomicU64::new(0),
        }
    }

    /// Mark identifier `i` as collected. Idempotent: collecting the same
    /// `i` twice sets no new bit the second time.
    pub fn collect(&self, i: u64) {
        let idx = run_base(i);
        let run = self.get_or_insert_run(idx);

        let bit = (i - idx) as usize;
        let word = bit / 64;
        let mask = 1u64 << (bit % 64);
        run.0.bits[word].fetch_or(mask, Ordering::AcqRel);

        if run.0.is_full() {
            self.compress(idx, run);
        }
    }

    /// Collect every identifier below `n`, one at a time. Deliberately not
    /// short-circuited into a single bulk write: `collect` is cheap and
    /// idempotent, and routing every identifier through the same path keeps
    /// `lower_bound`'s contiguous-prefix invariant earned by real bitmap
    /// updates rather than a privileged bulk path.
    pub fn collect_up_to(&self, n: u64) {
        for i in 0..n {
            self.collect(i);
        }
    }

    /// The largest `n` such that every identifier in `[0, n)` has been
    /// collected. Never decreases.
    pub fn lower_bound(&self) -> u64 {
        let hint = self.lb_hint.load(Ordering::Acquire);

        let run = match self.runs.get(&hint) {
            Some(run) => run,
            None => return hint,
        };

        for (w, word) in run.0.bits.iter().enumerate() {
            let bits = word.load(Ordering::Acquire);
            if bits != u64::MAX {
                let trailing_ones = (!bits).trailing_zeros() as u64;
                return hint + 64 * w as u64 + trailing_ones;
            }
        }

        // Every word is full but the compress that should retire this run
        // hasn't landed yet; the frontier is still at least past it.
        hint + RUN_SPAN
    }

    fn get_or_insert_run(&self, idx: u64) -> RunHandle {
        loop {
            if let Some(run) = self.runs.get(&idx) {
                return run;
            }

            let candidate = RunHandle(Arc::new(Run::new()));
            self.runs.put_ine(idx, candidate.clone());

            if let Some(run) = self.runs.get(&idx) {
                return run;
            }
            // A concurrent `compress` deleted the run between our insert and
            // this read (only possible if it filled and compressed in that
            // window); retry with a fresh run.
        }
    }

    /// `run` (covering `[idx, idx + 512)`) has just filled to all-ones. If
    /// it sits at the current low-water mark, advance past it and recurse
    /// into the next run in case that one is complete too.
    fn compress(&self, mut idx: u64, mut run: RunHandle) {
        loop {
            if !run.0.is_full() {
                return;
            }

            let hint = self.lb_hint.load(Ordering::Acquire);
            if hint != idx {
                return;
            }

            let advanced = idx + RUN_SPAN;
            if self
                .lb_hint
                .compare_exchange(hint, advanced, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Someone else already advanced past this run.
                return;
            }

            self.runs.del_if(idx, &run);

            match self.runs.get(&advanced) {
                Some(next_run) => {
                    idx = advanced;
                    run = next_run;
                }
                None => return,
            }
        }
    }
}

fn run_base(i: u64) -> u64 {
    i & !(RUN_SPAN - 1)
}
