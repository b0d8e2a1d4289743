//! OpenMP execution context plumbing.
//!
//! The scheduler that fans OpenMP sections out over threads and hosts lives
//! outside this crate; the module host only prepares the per-thread context
//! it expects: the current level (local or distributed) and the thread
//! number, stored in TLS, plus the thread-pool hook used by host-local
//! forks.

use std::cell::RefCell;
use std::sync::Arc;

use tracing::debug;

/// One OpenMP nesting level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Level {
    /// Top-level execution on this host; forks go to the local pool.
    SingleHost,
    /// A level forked across hosts; this execution is one remote thread of
    /// it.
    MultiHost {
        depth: i32,
        effective_depth: i32,
        max_active_levels: i32,
        num_threads: i32,
    },
}

thread_local! {
    static OMP_CONTEXT: RefCell<Option<(i32, Arc<Level>)>> = const { RefCell::new(None) };
}

/// Installs this thread's OpenMP context.
pub fn set_thread_context(thread_num: i32, level: Arc<Level>) {
    debug!(thread_num, ?level, "setting OpenMP thread context");
    OMP_CONTEXT.with(|ctx| *ctx.borrow_mut() = Some((thread_num, level)));
}

/// This thread's OpenMP context, if one was installed.
pub fn thread_context() -> Option<(i32, Arc<Level>)> {
    OMP_CONTEXT.with(|ctx| ctx.borrow().clone())
}

/// Hook point for the host-local OpenMP worker pool. The module host only
/// sizes it; scheduling onto it is the platform's job.
#[derive(Debug)]
pub struct ThreadPool {
    size: usize,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        debug!(size, "created OpenMP thread pool");
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_context_round_trips() {
        assert!(thread_context().is_none());

        set_thread_context(3, Arc::new(Level::SingleHost));
        let (thread_num, level) = thread_context().unwrap();
        assert_eq!(thread_num, 3);
        assert_eq!(*level, Level::SingleHost);

        set_thread_context(
            0,
            Arc::new(Level::MultiHost {
                depth: 1,
                effective_depth: 1,
                max_active_levels: 2,
                num_threads: 8,
            }),
        );
        let (_, level) = thread_context().unwrap();
        assert!(matches!(*level, Level::MultiHost { num_threads: 8, .. }));
    }
}
