//! Bounded task pools
//!
//! Identity resolution and charge resolution each run on their own pool whose width is
//! an explicit parameter. Tasks are spawned onto the multi-threaded runtime, and at most
//! `width` of them are alive at any moment.

use anyhow::{Context, Result};
use futures::stream::{self, TryStreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct BoundedPool {
    name: &'static str,
    width: usize,
    progress_interval: usize,
}

impl BoundedPool {
    pub fn new(name: &'static str, width: usize) -> Self {
        Self {
            name,
            width: width.max(1),
            progress_interval: 0,
        }
    }

    /// Log progress every `interval` completed tasks. Zero disables it.
    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Run `task` over every item with at most `width` tasks in flight.
    ///
    /// Results come back in completion order. The pool stops at the first failed or
    /// panicking task: no task is spawned after that, and tasks already in flight are
    /// left to finish on their own.
    pub async fn try_run<I, F, Fut, T>(&self, items: I, task: F) -> Result<Vec<T>>
    where
        I: IntoIterator,
        I::Item: Send + 'static,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let items: Vec<I::Item> = items.into_iter().collect();
        let total = items.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let name = self.name;

        let handles = items.into_iter().map(|item| {
            let handle = tokio::spawn(task(item));
            Ok::<_, anyhow::Error>(async move {
                handle
                    .await
                    .with_context(|| format!("Task in pool {} failed", name))?
            })
        });

        stream::iter(handles)
            .try_buffer_unordered(self.width)
            .inspect_ok(|_| {
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if self.progress_interval > 0
                    && (done % self.progress_interval == 0 || done == total)
                {
                    info!(pool = self.name, done, total, "Pool progress");
                }
            })
            .try_collect()
            .await
    }
}
