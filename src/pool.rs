//! # Completion Pool
//!
//! A fixed set of worker threads drives every transport in the registry:
//! connection reader tasks, background sends, handshake drivers. The pool
//! is a thin owner around a tokio runtime so the thread count is decided
//! once, at [`crate::Registry::start`], and every instance shares it.
//!
//! `num_threads == 0` is legal and selects a current-thread runtime: no
//! workers run in the background and I/O only progresses while a blocking
//! entry point is driving the runtime. That mode exists for deterministic,
//! caller-driven tests.

use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::error::Result;

pub(crate) struct CompletionPool {
    runtime: Option<Runtime>,
    threads: usize,
}

impl CompletionPool {
    /// Build a pool with `num_threads` workers (0 = caller-driven).
    pub(crate) fn new(num_threads: usize) -> Result<CompletionPool> {
        let runtime = if num_threads == 0 {
            Builder::new_current_thread().enable_all().build()?
        } else {
            Builder::new_multi_thread()
                .worker_threads(num_threads)
                .thread_name("msglink-worker")
                .enable_all()
                .build()?
        };
        debug!(num_threads, "completion pool started");
        Ok(CompletionPool {
            runtime: Some(runtime),
            threads: num_threads,
        })
    }

    /// Worker thread count the pool was built with.
    pub(crate) fn threads(&self) -> usize {
        self.threads
    }

    pub(crate) fn handle(&self) -> &Handle {
        self.runtime
            .as_ref()
            .expect("completion pool already shut down")
            .handle()
    }

    /// Drive `future` to completion from a non-worker thread.
    pub(crate) fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime
            .as_ref()
            .expect("completion pool already shut down")
            .block_on(future)
    }

    /// Stop accepting work and give in-flight tasks a moment to drain.
    pub(crate) fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!("completion pool shutting down");
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

impl Drop for CompletionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_thread_pool_runs_work() {
        let pool = CompletionPool::new(2).unwrap();
        assert_eq!(pool.threads(), 2);
        let value = pool.block_on(async { 41 + 1 });
        assert_eq!(value, 42);
    }

    #[test]
    fn caller_driven_pool_progresses_spawned_tasks() {
        let pool = CompletionPool::new(0).unwrap();
        let handle = pool.handle().clone();
        let task = handle.spawn(async { 7u32 });
        // The spawned task only runs while block_on drives the runtime.
        let value = pool.block_on(async { task.await.unwrap() });
        assert_eq!(value, 7);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut pool = CompletionPool::new(1).unwrap();
        pool.shutdown();
        pool.shutdown();
    }
}
