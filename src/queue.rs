//! Per-slot work queue.
//!
//! Each scheduler slot owns one queue. The owning thread pushes and pops at
//! the private end (LIFO, so freshly pushed continuation jobs run first and
//! stay cache-hot); every other thread steals from the opposite end (FIFO,
//! taking the owner's oldest work). The deque itself is the crossbeam
//! work-stealing deque, which guarantees that each element is delivered to
//! exactly one taker across `pop` and any number of concurrent `steal`s, and
//! that a successful steal synchronizes with the push that produced the
//! element.

use std::sync::atomic::{AtomicIsize, Ordering};

use crossbeam::deque::{Steal, Stealer, Worker};

/// Queue entries are arena indices; the arena resolves them back to jobs.
pub(crate) type JobIndex = u16;

pub(crate) struct WorkQueue {
    owner: Worker<JobIndex>,
    stealer: Stealer<JobIndex>,
    /// Approximate occupancy, maintained relaxed. Decremented by takers and
    /// incremented after a push lands, so it can under-report but never
    /// reports more than was actually enqueued.
    len: AtomicIsize,
}

// SAFETY: the `Worker` half is only touched by the slot's owning thread
// (`push`/`pop` are owner-only by contract); the `Stealer` half and the
// counter are thread-safe.
unsafe impl Send for WorkQueue {}
unsafe impl Sync for WorkQueue {}

impl WorkQueue {
    pub(crate) fn new() -> WorkQueue {
        let owner = Worker::new_lifo();
        let stealer = owner.stealer();
        WorkQueue {
            owner,
            stealer,
            len: AtomicIsize::new(0),
        }
    }

    /// Owner-only: adds an entry at the private end.
    #[inline]
    pub(crate) fn push(&self, index: JobIndex) {
        self.owner.push(index);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Owner-only: removes the most recently pushed entry.
    #[inline]
    pub(crate) fn pop(&self) -> Option<JobIndex> {
        let taken = self.owner.pop();
        if taken.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        taken
    }

    /// Steals the oldest entry. One attempt only; contention (`Retry`) counts
    /// as a miss and the caller's outer loop probes again.
    #[inline]
    pub(crate) fn steal(&self) -> Option<JobIndex> {
        match self.stealer.steal() {
            Steal::Success(index) => {
                self.len.fetch_sub(1, Ordering::Relaxed);
                Some(index)
            }
            Steal::Empty | Steal::Retry => None,
        }
    }

    /// Approximate occupancy, for diagnostics and telemetry only.
    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.len.load(Ordering::Relaxed).max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn owner_pops_lifo() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn stealers_take_fifo() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.steal(), Some(1));
        assert_eq!(queue.steal(), Some(2));
        // The owner still gets its freshest entry.
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn count_never_exceeds_enqueued() {
        let queue = WorkQueue::new();
        assert_eq!(queue.count(), 0);
        for i in 0..10 {
            queue.push(i);
        }
        assert!(queue.count() <= 10);
        for _ in 0..10 {
            queue.pop();
        }
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn every_entry_taken_exactly_once_under_contention() {
        const ENTRIES: u16 = 4096;
        const STEALERS: usize = 3;

        let queue = WorkQueue::new();
        for i in 0..ENTRIES {
            queue.push(i);
        }

        let stolen = Mutex::new(Vec::new());
        let mut popped = Vec::new();

        std::thread::scope(|scope| {
            for _ in 0..STEALERS {
                scope.spawn(|| {
                    let mut local = Vec::new();
                    loop {
                        match queue.steal() {
                            Some(index) => local.push(index),
                            None if queue.count() == 0 => break,
                            None => std::thread::yield_now(),
                        }
                    }
                    stolen.lock().unwrap().extend(local);
                });
            }
            // The spawning thread is the owner and drains from its own end.
            while let Some(index) = queue.pop() {
                popped.push(index);
            }
        });

        let mut taken: Vec<JobIndex> = stolen.into_inner().unwrap();
        taken.extend(popped);
        assert_eq!(taken.len(), ENTRIES as usize, "an entry was lost or duplicated");
        let unique: HashSet<_> = taken.iter().copied().collect();
        assert_eq!(unique.len(), ENTRIES as usize, "an entry was taken twice");
    }
}
