//! Work dispatch for per-cluster units.
//!
//! Callers submit closures and later join the returned handles; whether a
//! handle resolves in the caller's thread or on a pool is the queue's business.

use log::{debug, error};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};

use crate::error::{EngineError, Result};
use crate::hardware::ExecutionMode;

pub trait WorkQueue: Send + Sync {
    fn submit<T, F>(&self, work: F) -> WorkHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static;

    /// Units that may run at the same time.
    fn width(&self) -> usize;
}

/// Pending result of a submitted unit.
pub struct WorkHandle<T> {
    inner: HandleInner<T>,
}

enum HandleInner<T> {
    Ready(std::thread::Result<T>),
    Pending(Receiver<std::thread::Result<T>>),
}

impl<T> WorkHandle<T> {
    fn ready(result: std::thread::Result<T>) -> Self {
        Self {
            inner: HandleInner::Ready(result),
        }
    }

    /// Blocks until the unit finishes. A panicking unit becomes `Internal`.
    pub fn join(self) -> Result<T> {
        let result = match self.inner {
            HandleInner::Ready(r) => r,
            HandleInner::Pending(rx) => rx
                .recv()
                .map_err(|_| EngineError::Internal("worker dropped its result".into()))?,
        };
        result.map_err(|panic| {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!("work unit panicked: {msg}");
            EngineError::Internal(format!("work unit panicked: {msg}"))
        })
    }
}

/// Runs each unit immediately in the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineQueue;

impl WorkQueue for InlineQueue {
    fn submit<T, F>(&self, work: F) -> WorkHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        WorkHandle::ready(catch_unwind(AssertUnwindSafe(work)))
    }

    fn width(&self) -> usize {
        1
    }
}

/// Fixed-width rayon pool.
#[derive(Clone)]
pub struct PoolQueue {
    pool: Arc<rayon::ThreadPool>,
}

impl PoolQueue {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("cluster-worker-{i}"))
            .build()
            .map_err(|e| EngineError::Internal(format!("building worker pool: {e}")))?;
        Ok(Self { pool: Arc::new(pool) })
    }
}

impl WorkQueue for PoolQueue {
    fn submit<T, F>(&self, work: F) -> WorkHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.pool.spawn(move || {
            let _ = tx.send(catch_unwind(AssertUnwindSafe(work)));
        });
        WorkHandle {
            inner: HandleInner::Pending(rx),
        }
    }

    fn width(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// Queue chosen at runtime from the execution mode.
#[derive(Clone)]
pub enum Dispatcher {
    Inline(InlineQueue),
    Pool(PoolQueue),
}

impl Dispatcher {
    /// Distributed workers are mapped onto pool width; the remote transport
    /// lives outside the engine.
    pub fn for_mode(mode: ExecutionMode) -> Result<Self> {
        let dispatcher = match mode {
            ExecutionMode::SingleThreaded => Dispatcher::Inline(InlineQueue),
            ExecutionMode::ThreadPool(n) | ExecutionMode::Distributed(n) => Dispatcher::Pool(PoolQueue::new(n)?),
        };
        debug!("work dispatcher width {}", dispatcher.width());
        Ok(dispatcher)
    }
}

impl WorkQueue for Dispatcher {
    fn submit<T, F>(&self, work: F) -> WorkHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        match self {
            Dispatcher::Inline(q) => q.submit(work),
            Dispatcher::Pool(q) => q.submit(work),
        }
    }

    fn width(&self) -> usize {
        match self {
            Dispatcher::Inline(q) => q.width(),
            Dispatcher::Pool(q) => q.width(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_resolves_in_order() {
        let q = InlineQueue;
        let handles: Vec<_> = (0..4).map(|i| q.submit(move || i * 2)).collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_pool_results_match_submission_order() {
        let q = Dispatcher::for_mode(ExecutionMode::ThreadPool(3)).unwrap();
        assert_eq!(q.width(), 3);
        let handles: Vec<_> = (0..10u64)
            .map(|i| {
                q.submit(move || {
                    std::thread::sleep(std::time::Duration::from_millis(10 - i));
                    i
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let q = PoolQueue::new(1).unwrap();
        let h = q.submit(|| -> u32 { panic!("cluster exploded") });
        let err = h.join().unwrap_err();
        assert!(err.to_string().contains("cluster exploded"));
    }
}
