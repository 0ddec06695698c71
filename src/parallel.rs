//! Structured divide-and-conquer over index ranges.
//!
//! [`parallel_for`] builds a fork/join job tree over a `u32` range: interior
//! jobs fork their range in half until the [`CountSplitter`] says stop, and
//! leaves invoke the caller's closure with their sub-range. The call runs
//! and waits on the root, so it returns only once the whole range has been
//! processed (or an exit request cut the wait short). Work is executed by
//! the scheduler's workers *and* by the calling thread, which must therefore
//! be a worker or an adopted thread.

use std::ops::Range;
use std::sync::Arc;

use crate::job::Job;
use crate::scheduler::{JobSystem, RunFlags};

/// Splits a range in half while the piece is big enough and the tree is
/// shallow enough.
///
/// Without an explicit split cap, the depth defaults to one level past
/// `ceil(log2(slot_count))`, enough to give every slot a piece plus slack
/// for steal imbalance.
#[derive(Clone, Copy, Debug)]
pub struct CountSplitter {
    min_count: u32,
    max_splits: Option<u32>,
}

impl CountSplitter {
    /// Splitter producing leaves of at least `min_count` items.
    pub fn new(min_count: u32) -> CountSplitter {
        CountSplitter {
            min_count: min_count.max(1),
            max_splits: None,
        }
    }

    /// Caps the split depth explicitly.
    pub fn with_max_splits(mut self, max_splits: u32) -> CountSplitter {
        self.max_splits = Some(max_splits);
        self
    }

    fn should_split(&self, splits: u32, count: u32, default_max_splits: u32) -> bool {
        count >= self.min_count * 2 && splits < self.max_splits.unwrap_or(default_max_splits)
    }
}

impl Default for CountSplitter {
    fn default() -> CountSplitter {
        CountSplitter::new(1)
    }
}

/// Runs `f` over every piece of `range`, forking across the scheduler, and
/// waits for the whole range to complete.
///
/// The closure is shared by every leaf, so it gets the sub-range as an
/// argument rather than capturing mutable state; aggregate through atomics
/// or per-leaf slots. When the job pool runs dry, pieces degrade to running
/// inline on whichever thread hit the wall.
///
/// # Panics
///
/// Panics if the calling thread is neither an owned worker nor adopted.
pub fn parallel_for<F>(
    js: &JobSystem,
    parent: Option<&Job>,
    range: Range<u32>,
    splitter: CountSplitter,
    f: F,
) where
    F: Fn(Range<u32>) + Send + Sync + 'static,
{
    let start = range.start;
    let count = range.end.saturating_sub(range.start);
    if count == 0 {
        return;
    }

    let f = Arc::new(f);
    let default_max_splits = js.parallel_split_count() + 1;

    let root = {
        let f = Arc::clone(&f);
        js.create_with(parent, move |js, job| {
            split_range(js, job, &f, start, count, 0, splitter, default_max_splits);
        })
    };
    match root {
        Some(root) => js.run_and_wait(root),
        None => f(start..start + count),
    }
}

#[allow(clippy::too_many_arguments)]
fn split_range<F>(
    js: &JobSystem,
    job: &Job,
    f: &Arc<F>,
    start: u32,
    count: u32,
    splits: u32,
    splitter: CountSplitter,
    default_max_splits: u32,
) where
    F: Fn(Range<u32>) + Send + Sync + 'static,
{
    if splitter.should_split(splits, count, default_max_splits) {
        let left = count / 2;
        spawn_half(js, job, f, start, left, splits + 1, splitter, default_max_splits);
        spawn_half(
            js,
            job,
            f,
            start + left,
            count - left,
            splits + 1,
            splitter,
            default_max_splits,
        );
    } else {
        f(start..start + count);
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_half<F>(
    js: &JobSystem,
    parent: &Job,
    f: &Arc<F>,
    start: u32,
    count: u32,
    splits: u32,
    splitter: CountSplitter,
    default_max_splits: u32,
) where
    F: Fn(Range<u32>) + Send + Sync + 'static,
{
    let child = {
        let f = Arc::clone(f);
        js.create_with(Some(parent), move |js, job| {
            split_range(js, job, &f, start, count, splits, splitter, default_max_splits);
        })
    };
    match child {
        Some(child) => js.run(child, RunFlags::empty()),
        // Pool exhausted: process this piece inline without splitting
        // further. The tree above us still completes normally.
        None => f(start..start + count),
    }
}
