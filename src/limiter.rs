//! Bounded-parallelism task runner shared by every probing stage

use futures::stream::{self, StreamExt};
use std::future::Future;
use tracing::debug;

/// Runs independent fallible tasks with at most `concurrency` in flight.
///
/// A failing task never aborts its siblings: its slot in the result is `None`.
/// The limiter holds no state between runs, so separate stages can each use
/// their own instance, nested or not.
#[derive(Debug, Clone, Copy)]
pub struct Limiter {
    concurrency: usize,
}

impl Limiter {
    /// A concurrency of zero is treated as one.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every task and wait until all of them settle.
    ///
    /// A task is only started once a slot frees up. Completion order is
    /// arbitrary; result `i` always belongs to task `i`.
    pub async fn run<T, F, Fut, I>(&self, tasks: I) -> Vec<Option<T>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut settled: Vec<(usize, Option<T>)> = stream::iter(tasks.into_iter().enumerate())
            .map(|(index, task)| async move {
                match task().await {
                    Ok(value) => (index, Some(value)),
                    Err(e) => {
                        debug!(task = index, error = %e, "task failed");
                        (index, None)
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        settled.sort_unstable_by_key(|(index, _)| *index);
        settled.into_iter().map(|(_, value)| value).collect()
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(1)
    }
}
