//! Scheduler core: thread states, submission, work stealing, the parent
//! cascade, and the sleep/wake protocol.
//!
//! The [`JobSystem`] owns a fixed set of slots, one per participating
//! thread: `worker_count` slots are backed by scheduler-spawned OS threads,
//! the rest are claimed lazily by external threads through
//! [`adopt`](JobSystem::adopt). Each slot has a work queue with owner-LIFO /
//! stealer-FIFO discipline; idle workers probe one random victim per step
//! and otherwise sleep on a condition variable that submissions signal.
//!
//! Waiting is always helpful: a thread blocked in [`wait`](JobSystem::wait)
//! keeps executing other jobs (its own or stolen) until the waited-on
//! subtree completes, so a single participating thread can drain an entire
//! fork/join tree by itself.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitflags::bitflags;
use crossbeam::sync::{Parker, Unparker};
use crossbeam::utils::CachePadded;
use log::{debug, trace};

use crate::arena::JobArena;
use crate::job::{pack_payload, Job, JobHandle, NO_PARENT};
use crate::platform::{self, ThreadPriority};
use crate::queue::WorkQueue;

/// Hard cap on scheduler slots (owned workers plus adoptable slots); slot
/// masks are 32-bit.
pub const MAX_THREAD_COUNT: usize = 32;

/// How long a waiter parks when it finds no work before re-checking
/// completion. Completion is detected by polling, so this bounds wake-up
/// staleness for threads blocked in `wait`.
const WAIT_PARK_TIMEOUT: Duration = Duration::from_micros(50);

bitflags! {
    /// Submission flags for [`JobSystem::run`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RunFlags: u32 {
        /// Do not wake a sleeping worker for this job. Useful when the
        /// caller submits a batch and signals once, or will consume the
        /// job itself right away.
        const DONT_SIGNAL = 1;
    }
}

/// Per-slot state. The queue's owner half, the PRNG and the parker are only
/// ever touched by the slot's thread; the queue's stealer half, the mask and
/// the unparker are shared.
struct ThreadState {
    queue: WorkQueue,
    rng: RefCell<fastrand::Rng>,
    mask: u32,
    parker: Parker,
    unparker: Unparker,
}

// SAFETY: `rng` and `parker` are owner-only by the same discipline that
// makes the queue's `push`/`pop` owner-only; everything else is shareable.
unsafe impl Sync for ThreadState {}

#[derive(Clone, Copy, PartialEq, Eq)]
struct TlsSlot {
    core: *const Core,
    index: usize,
}

thread_local! {
    /// Which scheduler and slot the current thread belongs to, if any. Set
    /// at worker startup or on `adopt`, cleared on `emancipate`.
    static CURRENT_SLOT: Cell<Option<TlsSlot>> = const { Cell::new(None) };
}

struct Core {
    states: Box<[CachePadded<ThreadState>]>,
    arena: JobArena,
    /// Arena index of the master job, the implicit parent of `create(None)`
    /// jobs. Alive for the scheduler's whole lifetime.
    master: u16,
    thread_count: u16,
    parallel_split_count: u8,
    adopted_threads: AtomicU16,
    /// Jobs queued but not yet executed. A wake-up hint only; never trusted
    /// for correctness.
    active_jobs: AtomicI32,
    exit_requested: AtomicBool,
    /// With `condvar`, guards only the idle-wait predicate. Never held
    /// around queue operations or job execution.
    lock: Mutex<()>,
    condvar: Condvar,
}

/// Keeps a job's storage alive for a scope (ref up on entry, down on exit),
/// so the job cannot be recycled under a thread that is still touching it.
struct Pin<'a> {
    core: &'a Core,
    job: &'a Job,
}

impl<'a> Pin<'a> {
    fn new(core: &'a Core, job: &'a Job) -> Pin<'a> {
        core.inc_ref(job);
        Pin { core, job }
    }
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        self.core.dec_ref(self.job);
    }
}

impl Core {
    #[inline]
    fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Relaxed)
    }

    fn request_exit(&self) {
        {
            // The store happens under the lock so a worker checking the
            // predicate between its load and its `wait` cannot miss the edge.
            let _idle = self.lock.lock().unwrap();
            self.exit_requested.store(true, Ordering::Relaxed);
        }
        self.condvar.notify_all();
        for state in self.states.iter() {
            state.unparker.unpark();
        }
        debug!("exit requested");
    }

    #[inline]
    fn inc_ref(&self, job: &Job) {
        job.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_ref(&self, job: &Job) {
        // Release so no access to the job can be reordered past the drop of
        // our reference; the last holder re-acquires before recycling.
        let previous = job.ref_count.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0);
        if previous == 1 {
            fence(Ordering::Acquire);
            self.arena.destroy(job);
        }
    }

    /// Terminates `job` and cascades: a child's completion may complete its
    /// parent, and so on up the tree.
    fn finish(&self, job: &Job) {
        let _pin = Pin::new(self, job);
        let mut job = job;
        loop {
            // Release pairs with the acquire fence below and with the fence
            // in `wait`: whoever observes the zero transition sees every
            // write made by the subtree.
            let previous = job.running_job_count.fetch_sub(1, Ordering::Release);
            debug_assert!(previous > 0);
            if previous != 1 {
                // Outstanding children; they will complete this job.
                break;
            }
            fence(Ordering::Acquire);
            let parent = if job.parent == NO_PARENT {
                None
            } else {
                Some(self.arena.job_at(job.parent))
            };
            self.dec_ref(job);
            match parent {
                Some(parent_job) => job = parent_job,
                None => break,
            }
        }
    }

    /// Picks a random victim slot for one steal attempt, or `None` when the
    /// draw lands on the prober itself. One biased probe per call; the outer
    /// loop retries, so speed outranks uniformity.
    fn steal_target(&self, state: &ThreadState) -> Option<&ThreadState> {
        let adopted = self.adopted_threads.load(Ordering::Relaxed) as usize;
        let slots = (self.thread_count as usize + adopted).min(self.states.len());
        let victim = state.rng.borrow_mut().usize(..slots);
        let candidate: &ThreadState = &self.states[victim];
        if std::ptr::eq(candidate, state) {
            None
        } else {
            Some(candidate)
        }
    }
}

/// A work-stealing fork/join job scheduler.
///
/// Constructed with a fixed worker count and a fixed number of adoptable
/// slots; neither changes afterwards. Dropping the system requests exit and
/// joins every owned worker (adopted threads are the caller's to join).
pub struct JobSystem {
    core: Arc<Core>,
    threads: Vec<JoinHandle<()>>,
    is_owner: bool,
}

impl JobSystem {
    /// Creates a scheduler with `worker_count` owned threads (0 picks a
    /// default based on the machine: one per physical core, minus one for
    /// the calling thread) and `adoptable_count` slots claimable via
    /// [`adopt`](Self::adopt).
    pub fn new(worker_count: usize, adoptable_count: usize) -> JobSystem {
        let worker_count = if worker_count == 0 {
            default_worker_count()
        } else {
            worker_count
        };
        Self::with_worker_count(worker_count, adoptable_count)
    }

    /// Like [`new`](Self::new) but takes `worker_count` literally: 0 builds
    /// an adopt-only scheduler where external threads do all the work.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count + adoptable_count` is 0 or exceeds
    /// [`MAX_THREAD_COUNT`].
    pub fn with_worker_count(worker_count: usize, adoptable_count: usize) -> JobSystem {
        let worker_count = worker_count.min(MAX_THREAD_COUNT);
        let slot_count = worker_count + adoptable_count;
        assert!(
            slot_count > 0,
            "a job system needs at least one worker or adoptable slot"
        );
        assert!(
            slot_count <= MAX_THREAD_COUNT,
            "a job system supports at most {MAX_THREAD_COUNT} slots"
        );

        let states: Box<[CachePadded<ThreadState>]> = (0..slot_count)
            .map(|i| {
                let parker = Parker::new();
                let unparker = parker.unparker().clone();
                CachePadded::new(ThreadState {
                    queue: WorkQueue::new(),
                    rng: RefCell::new(fastrand::Rng::new()),
                    mask: 1u32 << i,
                    parker,
                    unparker,
                })
            })
            .collect();

        let arena = JobArena::new();
        let master_slot = arena.allocate().expect("fresh arena cannot be exhausted");
        // SAFETY: the slot was just allocated and is unpublished.
        let master = arena.index_of(unsafe { master_slot.as_ref() });

        let core = Arc::new(Core {
            states,
            arena,
            master,
            thread_count: worker_count as u16,
            parallel_split_count: ceil_log2(slot_count),
            adopted_threads: AtomicU16::new(0),
            active_jobs: AtomicI32::new(0),
            exit_requested: AtomicBool::new(false),
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        });

        debug!("job system: {worker_count} workers, {adoptable_count} adoptable slots");

        let mut threads = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_core = Arc::clone(&core);
            let handle = thread::Builder::new()
                .name(format!("jobsys-{index}"))
                .spawn(move || JobSystem::from_core(worker_core).worker_loop(index))
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }

        JobSystem {
            core,
            threads,
            is_owner: true,
        }
    }

    /// Internal handle for worker threads; never joins or requests exit.
    fn from_core(core: Arc<Core>) -> JobSystem {
        JobSystem {
            core,
            threads: Vec::new(),
            is_owner: false,
        }
    }

    /// Number of scheduler-owned worker threads.
    pub fn worker_count(&self) -> usize {
        self.core.thread_count as usize
    }

    /// Total slots: owned workers plus adoptable.
    pub fn slot_count(&self) -> usize {
        self.core.states.len()
    }

    pub(crate) fn parallel_split_count(&self) -> u32 {
        u32::from(self.core.parallel_split_count)
    }

    /// The master job: the implicit parent of every job created without an
    /// explicit one. It stays alive for the scheduler's lifetime, so orphan
    /// jobs are always accounted to a live root.
    pub fn master(&self) -> &Job {
        self.core.arena.job_at(self.core.master)
    }

    /// Creates an empty job, usable as a synchronization barrier for the
    /// children attached to it. With `parent == None` the job is parented to
    /// the master job. Returns `None` when the job pool is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if `parent` has already terminated.
    pub fn create<'s>(&'s self, parent: Option<&Job>) -> Option<JobHandle<'s>> {
        let job = self.allocate(parent)?;
        Some(JobHandle::new(job))
    }

    /// Creates a job that runs `f`, embedded in the job's inline storage
    /// (size-checked at compile time). Same parenting and exhaustion
    /// behavior as [`create`](Self::create).
    ///
    /// If the job never executes (scheduler shut down first, or the handle
    /// is leaked), the embedded payload is leaked with it.
    pub fn create_with<'s, F>(&'s self, parent: Option<&Job>, f: F) -> Option<JobHandle<'s>>
    where
        F: FnOnce(&JobSystem, &Job) + Send,
    {
        let job = self.allocate(parent)?;
        // SAFETY: freshly allocated, unpublished slot.
        unsafe {
            let function = pack_payload(job, f);
            (*job.as_ptr()).function = Some(function);
        }
        Some(JobHandle::new(job))
    }

    fn allocate(&self, parent: Option<&Job>) -> Option<NonNull<Job>> {
        let core = &*self.core;
        let parent = parent.unwrap_or_else(|| core.arena.job_at(core.master));
        let job = core.arena.allocate()?;
        // Registering the child keeps the parent alive; relaxed is fine
        // because nothing published depends on the count yet.
        let previous = parent.running_job_count.fetch_add(1, Ordering::Relaxed);
        assert!(
            previous > 0,
            "cannot create a child of a job that has already terminated"
        );
        let parent_index = core.arena.index_of(parent);
        // SAFETY: unpublished slot; the parent link is immutable afterwards.
        unsafe {
            (*job.as_ptr()).parent = parent_index;
        }
        Some(job)
    }

    /// Submits a job to the calling thread's queue. The handle is consumed:
    /// from here the job owns itself and is destroyed when its subtree
    /// completes. Retain first (see [`run_and_retain`](Self::run_and_retain))
    /// to wait on it.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is neither an owned worker nor adopted.
    pub fn run(&self, job: JobHandle<'_>, flags: RunFlags) {
        let state = self.state();
        let core = &*self.core;
        let _pin = Pin::new(core, &job);

        // Count the job before publishing it: a stealer could otherwise run
        // and finish it before the counter reflects it, and the executor's
        // pairing decrement would go below zero.
        let was_active = core.active_jobs.fetch_add(1, Ordering::Relaxed);
        state.queue.push(core.arena.index_of(&job));

        if !flags.contains(RunFlags::DONT_SIGNAL) && was_active > 0 {
            // Busy system: peers may be asleep. The empty critical section
            // orders the push and counter increment before any sleeper's
            // re-check of the predicate; without it the notify can race the
            // sleeper into a lost wake-up.
            drop(core.lock.lock().unwrap());
            core.condvar.notify_one();
        }
    }

    /// Submits `job` and returns a retained handle for a later
    /// [`wait`](Self::wait) or [`release`](Self::release).
    pub fn run_and_retain<'s>(&'s self, job: JobHandle<'s>, flags: RunFlags) -> JobHandle<'s> {
        let retained = JobHandle::new(job.raw());
        self.core.inc_ref(&retained);
        self.run(job, flags);
        retained
    }

    /// Submits `job` and waits for its whole subtree to complete.
    pub fn run_and_wait(&self, job: JobHandle<'_>) {
        let retained = self.run_and_retain(job, RunFlags::empty());
        self.wait(retained);
    }

    /// Waits until `job`'s subtree completes, executing other jobs in the
    /// meantime (never purely blocking). Returns early if exit is requested,
    /// in which case the subtree may be incomplete. Consumes and releases
    /// the retained handle either way.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is neither an owned worker nor adopted.
    pub fn wait(&self, job: JobHandle<'_>) {
        let state = self.state();
        while !job.has_completed() && !self.exit_requested() {
            if !self.execute_on(state) {
                // No runnable work anywhere we looked; park briefly rather
                // than spin. `request_exit` unparks everyone.
                state.parker.park_timeout(WAIT_PARK_TIMEOUT);
            }
        }
        self.core.dec_ref(&job);
    }

    /// Releases a retained handle without waiting.
    pub fn release(&self, job: JobHandle<'_>) {
        self.core.dec_ref(&job);
    }

    /// One worker step: pop locally, else try one random steal; execute and
    /// finish whatever was obtained. Returns whether a job ran.
    fn execute_on(&self, state: &ThreadState) -> bool {
        let core = &*self.core;
        let mut index = state.queue.pop();
        if index.is_none() {
            if let Some(victim) = core.steal_target(state) {
                index = victim.queue.steal();
            }
        }
        let Some(index) = index else {
            return false;
        };

        let was_active = core.active_jobs.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(was_active > 0);

        let job = core.arena.job_at(index);
        if let Some(function) = job.function {
            // SAFETY: the queue delivers each entry to exactly one taker and
            // a successful steal synchronizes with the push, so the payload
            // write is visible and consumed exactly once.
            unsafe { function(job.storage_ptr(), self, job) };
        }
        core.finish(job);
        true
    }

    fn worker_loop(&self, index: usize) {
        platform::set_thread_priority(ThreadPriority::Display);
        CURRENT_SLOT.with(|slot| {
            slot.set(Some(TlsSlot {
                core: Arc::as_ptr(&self.core),
                index,
            }))
        });
        trace!("worker {index} up");

        let core = &*self.core;
        let state: &ThreadState = &core.states[index];
        loop {
            if !self.execute_on(state) {
                let mut idle = core.lock.lock().unwrap();
                while !core.exit_requested() && core.active_jobs.load(Ordering::Relaxed) <= 0 {
                    idle = core.condvar.wait(idle).unwrap();
                }
            }
            if core.exit_requested() {
                break;
            }
        }
        trace!("worker {index} down");
    }

    /// Registers the calling external thread with this scheduler, claiming
    /// the next adoptable slot. A no-op if the thread is already adopted
    /// here. Adoption is monotonic: slots are never reclaimed, even after
    /// [`emancipate`](Self::emancipate).
    ///
    /// # Panics
    ///
    /// Panics if the thread belongs to another scheduler, or if every
    /// adoptable slot has been claimed.
    pub fn adopt(&self) {
        let core_ptr = Arc::as_ptr(&self.core);
        if let Some(slot) = CURRENT_SLOT.with(|slot| slot.get()) {
            assert!(
                slot.core == core_ptr,
                "cannot adopt a thread already owned by another job system"
            );
            return;
        }

        let core = &*self.core;
        let adopted = core.adopted_threads.fetch_add(1, Ordering::Relaxed);
        let index = core.thread_count as usize + adopted as usize;
        assert!(
            index < core.states.len(),
            "too many calls to adopt(): no adoptable slots left"
        );

        // Adopted threads run at the canonical worker priority so the work
        // they execute is not deprioritized against the owned workers.
        platform::set_thread_priority(ThreadPriority::Display);
        CURRENT_SLOT.with(|slot| {
            slot.set(Some(TlsSlot {
                core: core_ptr,
                index,
            }))
        });
        debug!("adopted external thread into slot {index}");
    }

    /// Detaches the calling thread from this scheduler. The slot is not
    /// reclaimed.
    ///
    /// # Panics
    ///
    /// Panics if the thread is not adopted by this scheduler.
    pub fn emancipate(&self) {
        let slot = CURRENT_SLOT
            .with(|slot| slot.get())
            .expect("this thread is not an adopted thread");
        assert!(
            slot.core == Arc::as_ptr(&self.core),
            "this thread is not adopted by this job system"
        );
        CURRENT_SLOT.with(|slot| slot.set(None));
        debug!("emancipated external thread from slot {}", slot.index);
    }

    /// Adopts the calling thread and returns a guard that emancipates it on
    /// drop. If the thread was already adopted here, the guard does nothing
    /// on drop (the outer adoption stands).
    pub fn adopt_scoped(&self) -> AdoptScope<'_> {
        let already = CURRENT_SLOT
            .with(|slot| slot.get())
            .is_some_and(|slot| slot.core == Arc::as_ptr(&self.core));
        self.adopt();
        AdoptScope {
            system: self,
            adopted_here: !already,
        }
    }

    /// Signals every thread to exit. Queued jobs may or may not run;
    /// waiters return early.
    pub fn request_exit(&self) {
        self.core.request_exit();
    }

    pub fn exit_requested(&self) -> bool {
        self.core.exit_requested()
    }

    fn state(&self) -> &ThreadState {
        self.current_state()
            .expect("this thread is neither owned by nor adopted into this job system")
    }

    fn current_state(&self) -> Option<&ThreadState> {
        let slot = CURRENT_SLOT.with(|slot| slot.get())?;
        if slot.core != Arc::as_ptr(&self.core) {
            return None;
        }
        Some(&self.core.states[slot.index])
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        if !self.is_owner {
            return;
        }
        self.core.request_exit();
        // Adopted threads are not ours to join.
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Per-slot diagnostic: one `log2(mask): queue_count` line per slot.
impl fmt::Display for JobSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for state in self.core.states.iter() {
            writeln!(f, "{}: {}", state.mask.trailing_zeros(), state.queue.count())?;
        }
        Ok(())
    }
}

/// Guard returned by [`JobSystem::adopt_scoped`].
pub struct AdoptScope<'s> {
    system: &'s JobSystem,
    adopted_here: bool,
}

impl Drop for AdoptScope<'_> {
    fn drop(&mut self) {
        if self.adopted_here {
            self.system.emancipate();
        }
    }
}

/// One job thread per physical core (SMT pairs count once), keeping one core
/// free for the thread that feeds the scheduler. Chosen for predictable
/// latency rather than peak throughput.
fn default_worker_count() -> usize {
    let logical = num_cpus::get();
    let physical = num_cpus::get_physical();
    let per_core = if logical > physical {
        logical / 2
    } else {
        logical
    };
    per_core.saturating_sub(1).clamp(1, MAX_THREAD_COUNT)
}

fn ceil_log2(n: usize) -> u8 {
    debug_assert!(n > 0);
    (usize::BITS - (n - 1).leading_zeros()) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_log2_matches_split_depths() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(32), 5);
    }

    #[test]
    fn default_worker_count_is_bounded() {
        let n = default_worker_count();
        assert!(n >= 1);
        assert!(n <= MAX_THREAD_COUNT);
    }

    #[test]
    fn construction_and_shutdown() {
        let js = JobSystem::with_worker_count(2, 1);
        assert_eq!(js.worker_count(), 2);
        assert_eq!(js.slot_count(), 3);
        assert!(!js.exit_requested());
        js.request_exit();
        assert!(js.exit_requested());
    }

    #[test]
    fn adopt_only_construction() {
        let js = JobSystem::with_worker_count(0, 1);
        assert_eq!(js.worker_count(), 0);
        assert_eq!(js.slot_count(), 1);
    }

    #[test]
    #[should_panic(expected = "at least one worker")]
    fn zero_slots_rejected() {
        let _ = JobSystem::with_worker_count(0, 0);
    }

    #[test]
    fn diagnostic_lists_every_slot() {
        let js = JobSystem::with_worker_count(2, 2);
        let printed = js.to_string();
        let lines: Vec<&str> = printed.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("0: "));
        assert!(lines[3].starts_with("3: "));
    }

    #[test]
    fn run_outside_scheduler_panics() {
        let js = JobSystem::with_worker_count(1, 1);
        let job = js.create(None).unwrap();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            js.run(job, RunFlags::empty());
        }));
        assert!(outcome.is_err());
    }
}
