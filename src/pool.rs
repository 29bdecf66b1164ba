//! Bounded fan-out over chunks of work.

use std::future::Future;

use futures_util::{StreamExt, stream};

use crate::{context::ExecutionContext, error::Result};

pub const DEFAULT_WORKERS: usize = 3;

/// Outcome of one chunk, tagged with its position in the submitted order.
#[derive(Debug)]
pub struct ChunkResult<R> {
    pub index: usize,
    pub result: Result<R>,
}

/// Splits `items` into chunks of at most `size` elements, preserving order.
pub fn chunked<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Runs `work` over every chunk with at most `workers` chunks in flight.
///
/// The run deadline is checked as each chunk starts; a chunk that starts after the deadline
/// fails without calling `work`. Failures never cancel peers. Results come back in
/// submission order.
pub async fn map_chunks<T, R, F, Fut>(
    chunks: Vec<Vec<T>>,
    workers: usize,
    ctx: &ExecutionContext,
    work: F,
) -> Vec<ChunkResult<R>>
where
    F: Fn(usize, Vec<T>) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let work = &work;
    let mut results: Vec<ChunkResult<R>> = stream::iter(chunks.into_iter().enumerate())
        .map(|(index, chunk)| async move {
            let result = match ctx.check_deadline() {
                Ok(()) => work(index, chunk).await,
                Err(err) => Err(err),
            };
            ChunkResult { index, result }
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await;
    results.sort_by_key(|chunk| chunk.index);
    results
}
