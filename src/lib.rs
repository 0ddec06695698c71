//! # jobsys - Work-Stealing Fork/Join Job Scheduler
//!
//! A job scheduler for structured fork/join parallelism inside
//! latency-sensitive runtimes (rendering, simulation). It owns a fixed pool
//! of worker threads plus reserved slots that external threads can claim,
//! and schedules trees of small cache-line-sized [`Job`] records over
//! per-worker queues with LIFO-local / FIFO-steal discipline.
//!
//! ## Architecture
//!
//! - **Jobs**: a function pointer plus inline payload, pooled in a
//!   fixed-capacity arena and addressed by stable index. Each job tracks its
//!   subtree with a running count and its storage with a reference count.
//! - **Queues**: one bounded work-stealing deque per slot; owners pop their
//!   freshest work, idle peers steal the oldest.
//! - **Workers**: OS threads running the pop-else-steal loop, sleeping on a
//!   condition variable when the system is idle.
//! - **Adoption**: external threads register with [`JobSystem::adopt`] to
//!   submit and wait; waiting is always helpful (the waiter executes jobs
//!   until its target completes).
//!
//! ## Example
//!
//! ```no_run
//! use jobsys::{JobSystem, RunFlags};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let js = JobSystem::new(0, 1); // auto worker count, one adoptable slot
//! let _scope = js.adopt_scoped(); // the calling thread participates
//!
//! let done = Arc::new(AtomicUsize::new(0));
//! let root = js.create(None).expect("job pool exhausted");
//! for _ in 0..8 {
//!     let done = Arc::clone(&done);
//!     if let Some(job) = js.create_with(Some(&*root), move |_, _| {
//!         done.fetch_add(1, Ordering::Relaxed);
//!     }) {
//!         js.run(job, RunFlags::empty());
//!     }
//! }
//! let root = js.run_and_retain(root, RunFlags::empty());
//! js.wait(root);
//! ```

mod arena;
pub mod job;
pub mod parallel;
pub mod platform;
mod queue;
pub mod scheduler;

pub use arena::MAX_JOB_COUNT;
pub use job::{Job, JobHandle, JOB_STORAGE_SIZE};
pub use parallel::{parallel_for, CountSplitter};
pub use platform::ThreadPriority;
pub use scheduler::{AdoptScope, JobSystem, RunFlags, MAX_THREAD_COUNT};
