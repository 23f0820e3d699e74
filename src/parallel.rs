//! Bounded-concurrency execution of async workers.

use anyhow::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;

/// Runs `worker` over every input with at most `parallelism` invocations in
/// flight at the same time. Results are collected in input order, not
/// completion order. Fails fast: the first worker error is returned and the
/// remaining in-flight workers are dropped.
pub async fn in_parallel<T, R, F, Fut>(
    parallelism: usize,
    inputs: Vec<T>,
    worker: F,
) -> Result<Vec<R>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    stream::iter(inputs.into_iter().map(worker))
        .buffered(parallelism.max(1))
        .try_collect()
        .await
}
