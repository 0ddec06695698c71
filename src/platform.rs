//! Best-effort OS thread hooks.
//!
//! Thread naming, priority and affinity are quality-of-life settings, not
//! correctness requirements: every function here silently does nothing on
//! platforms without support, and ignores failures (raising priority
//! typically needs elevated privileges on desktop systems).

/// Canonical priorities for threads participating in the scheduler. Every
/// owned worker and every adopted thread runs at [`Display`](Self::Display)
/// so jobs see uniform latency regardless of which slot picks them up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadPriority {
    Normal,
    Display,
    UrgentDisplay,
}

#[cfg(target_os = "linux")]
impl ThreadPriority {
    fn nice(self) -> libc::c_int {
        match self {
            ThreadPriority::Normal => 0,
            ThreadPriority::Display => -4,
            ThreadPriority::UrgentDisplay => -8,
        }
    }
}

/// Names the calling thread. Truncated to the platform limit (15 bytes on
/// Linux).
#[cfg(target_os = "linux")]
pub fn set_thread_name(name: &str) {
    let truncated: String = name.chars().take(15).filter(|c| *c != '\0').collect();
    if let Ok(cname) = std::ffi::CString::new(truncated) {
        // SAFETY: plain libc call on the current thread with a valid,
        // nul-terminated string.
        unsafe {
            libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr());
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_thread_name(_name: &str) {}

/// Applies a scheduling priority to the calling thread.
#[cfg(target_os = "linux")]
pub fn set_thread_priority(priority: ThreadPriority) {
    // SAFETY: plain libc call; `who == 0` targets the calling thread.
    unsafe {
        libc::setpriority(libc::PRIO_PROCESS, 0, priority.nice());
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_thread_priority(_priority: ThreadPriority) {}

/// Pins the calling thread to the lowest core set in `mask`.
pub fn set_thread_affinity(mask: u32) {
    if mask == 0 {
        return;
    }
    let id = mask.trailing_zeros() as usize;
    core_affinity::set_for_current(core_affinity::CoreId { id });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_are_best_effort() {
        // None of these may fail or panic, whatever the platform or
        // privileges; they are hints.
        set_thread_name("jobsys-test");
        set_thread_priority(ThreadPriority::Display);
        set_thread_priority(ThreadPriority::Normal);
        set_thread_affinity(0);
        set_thread_affinity(0b1);
    }
}
