//! Fixed-capacity job pool.
//!
//! The arena owns the backing storage for every [`Job`] in the system and
//! hands slots out by stable index, so a parent link fits in 15 bits and
//! never dangles (slot addresses are fixed for the arena's lifetime).
//! Allocation and reclamation are lock-free: a Treiber free list over a
//! side array of link atomics, with a generation tag packed into the list
//! head so that a pop/push/pop race cannot ABA the head pointer.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI16, AtomicU16, AtomicU64, Ordering};

use static_assertions::const_assert;

use crate::job::{Job, NO_PARENT};

/// Capacity of the job pool. Bounded so parent links fit in 15 bits.
pub const MAX_JOB_COUNT: usize = 16384;

const_assert!(MAX_JOB_COUNT < NO_PARENT as usize);

/// Free-list terminator. Distinct from [`NO_PARENT`], which is a job-level
/// sentinel; the free list has the full 16-bit space to itself.
const NIL: u16 = u16::MAX;

const INDEX_MASK: u64 = 0xFFFF;

#[inline]
fn bump_tag(head: u64) -> u64 {
    ((head >> 16).wrapping_add(1)) << 16
}

/// Pool of [`MAX_JOB_COUNT`] job slots with lock-free allocate/destroy.
pub(crate) struct JobArena {
    slots: Box<[UnsafeCell<Job>]>,
    /// Free-list links, indexed like `slots`. Only meaningful while the slot
    /// is on the free list.
    next: Box<[AtomicU16]>,
    /// Packed `(tag << 16) | index` list head; `NIL` index means exhausted.
    head: AtomicU64,
}

// SAFETY: slot contents are only mutated through the `UnsafeCell` while the
// slot is off every queue and unreferenced (freshly popped from the free
// list); published slots are accessed as `&Job`, which is `Sync`.
unsafe impl Send for JobArena {}
unsafe impl Sync for JobArena {}

impl JobArena {
    pub(crate) fn new() -> JobArena {
        let slots: Box<[UnsafeCell<Job>]> = (0..MAX_JOB_COUNT)
            .map(|_| UnsafeCell::new(Job::vacant()))
            .collect();
        let next: Box<[AtomicU16]> = (0..MAX_JOB_COUNT)
            .map(|i| {
                if i + 1 < MAX_JOB_COUNT {
                    AtomicU16::new((i + 1) as u16)
                } else {
                    AtomicU16::new(NIL)
                }
            })
            .collect();
        JobArena {
            slots,
            next,
            head: AtomicU64::new(0),
        }
    }

    /// Pops a slot off the free list and resets it for a fresh job lifetime
    /// (`running_job_count = 1`, `ref_count = 1`). Returns `None` when the
    /// pool is exhausted; callers tolerate this.
    pub(crate) fn allocate(&self) -> Option<NonNull<Job>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let index = (head & INDEX_MASK) as u16;
            if index == NIL {
                return None;
            }
            // May be stale if another thread pops this slot first; the CAS
            // below fails in that case because the tag advanced.
            let next = self.next[index as usize].load(Ordering::Relaxed);
            let new_head = bump_tag(head) | u64::from(next);
            match self.head.compare_exchange_weak(
                head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let slot = self.slots[index as usize].get();
                    // SAFETY: the slot was just popped, so nothing else
                    // references it; it is ours to reinitialize.
                    unsafe {
                        (*slot).function = None;
                        (*slot).parent = NO_PARENT;
                        (*slot).running_job_count = AtomicI16::new(1);
                        (*slot).ref_count = AtomicU16::new(1);
                    }
                    return NonNull::new(slot);
                }
                Err(observed) => head = observed,
            }
        }
    }

    /// Returns a slot to the free list. The job's last reference must already
    /// be gone.
    pub(crate) fn destroy(&self, job: &Job) {
        debug_assert_eq!(job.ref_count.load(Ordering::Relaxed), 0);
        let index = self.index_of(job);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            self.next[index as usize].store((head & INDEX_MASK) as u16, Ordering::Relaxed);
            let new_head = bump_tag(head) | u64::from(index);
            match self.head.compare_exchange_weak(
                head,
                new_head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Stable index of a job handed out by this arena.
    #[inline]
    pub(crate) fn index_of(&self, job: &Job) -> u16 {
        let base = self.slots.as_ptr() as usize;
        let addr = job as *const Job as usize;
        let index = (addr - base) / std::mem::size_of::<Job>();
        debug_assert!(index < MAX_JOB_COUNT);
        index as u16
    }

    #[inline]
    pub(crate) fn job_at(&self, index: u16) -> &Job {
        // SAFETY: indices handed out by `allocate`/`index_of` are in bounds,
        // and the slot's storage lives as long as the arena.
        unsafe { &*self.slots[index as usize].get() }
    }
}
