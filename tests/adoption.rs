//! External-thread adoption: claiming slots, draining work without owned
//! workers, emancipation cycles, and the contract panics.

use jobsys::{JobSystem, RunFlags};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn submit_and_drain(js: &JobSystem, jobs: usize, counter: &Arc<AtomicUsize>) {
    let root = js.create(None).expect("job pool exhausted");
    for _ in 0..jobs {
        let counter = Arc::clone(counter);
        let job = js
            .create_with(Some(&*root), move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("job pool exhausted");
        js.run(job, RunFlags::empty());
    }
    let root = js.run_and_retain(root, RunFlags::empty());
    js.wait(root);
}

#[test]
fn adopted_thread_drains_without_any_workers() {
    let js = JobSystem::with_worker_count(0, 1);
    js.adopt();

    let counter = Arc::new(AtomicUsize::new(0));
    submit_and_drain(&js, 100, &counter);
    assert_eq!(counter.load(Ordering::SeqCst), 100);

    js.emancipate();
}

#[test]
fn adopt_emancipate_cycles_use_one_slot_each() {
    // Adoption is monotonic: every cycle claims a fresh slot, so ten cycles
    // need ten adoptable slots.
    const CYCLES: usize = 10;
    let js = JobSystem::with_worker_count(1, CYCLES);

    let counter = Arc::new(AtomicUsize::new(0));
    for cycle in 0..CYCLES {
        js.adopt();
        submit_and_drain(&js, 100, &counter);
        assert_eq!(counter.load(Ordering::SeqCst), (cycle + 1) * 100);
        js.emancipate();
    }
}

#[test]
fn double_adopt_is_a_no_op() {
    let js = JobSystem::with_worker_count(1, 2);
    js.adopt();
    // Re-adopting the same thread must not claim a second slot...
    js.adopt();

    // ...so another external thread can still claim the remaining one.
    std::thread::scope(|scope| {
        scope.spawn(|| {
            js.adopt();
            let counter = Arc::new(AtomicUsize::new(0));
            submit_and_drain(&js, 10, &counter);
            assert_eq!(counter.load(Ordering::SeqCst), 10);
            js.emancipate();
        });
    });

    let counter = Arc::new(AtomicUsize::new(0));
    submit_and_drain(&js, 10, &counter);
    assert_eq!(counter.load(Ordering::SeqCst), 10);
    js.emancipate();
}

#[test]
#[should_panic(expected = "another job system")]
fn adopting_into_a_second_scheduler_panics() {
    let first = JobSystem::with_worker_count(1, 1);
    let second = JobSystem::with_worker_count(1, 1);
    first.adopt();
    second.adopt();
}

#[test]
#[should_panic(expected = "no adoptable slots left")]
fn adopting_past_the_quota_panics() {
    let js = JobSystem::with_worker_count(1, 1);
    std::thread::scope(|scope| {
        scope
            .spawn(|| js.adopt())
            .join()
            .expect("first adoption fits the quota");
    });
    // The helper thread's slot is never reclaimed.
    js.adopt();
}

#[test]
#[should_panic(expected = "not an adopted thread")]
fn emancipating_an_unadopted_thread_panics() {
    let js = JobSystem::with_worker_count(1, 1);
    js.emancipate();
}

#[test]
fn adopt_scope_guard_emancipates() {
    let js = JobSystem::with_worker_count(1, 2);
    {
        let _scope = js.adopt_scoped();
        let counter = Arc::new(AtomicUsize::new(0));
        submit_and_drain(&js, 10, &counter);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
    // The guard released the thread; a plain re-adopt claims a new slot and
    // works again.
    js.adopt();
    let counter = Arc::new(AtomicUsize::new(0));
    submit_and_drain(&js, 10, &counter);
    assert_eq!(counter.load(Ordering::SeqCst), 10);
    js.emancipate();
}
