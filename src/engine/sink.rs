//! The delivery seam: where batches leave the engine.

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// Durable destination for batches (a bulk insert, an HTTP endpoint, a file).
///
/// The engine never calls `flush` concurrently, so implementations need no
/// locking of their own. `cancel` fires when the engine starts shutting
/// down; a slow flush may use it to give up early, but is never aborted.
pub trait BatchSink<T>: Send + Sync + 'static {
    fn flush(
        &self,
        batch: &[T],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;
}

impl<T, S> BatchSink<T> for Arc<S>
where
    S: BatchSink<T>,
{
    fn flush(
        &self,
        batch: &[T],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        (**self).flush(batch, cancel)
    }
}

/// Sink backed by a closure that receives an owned copy of each batch.
pub struct FnSink<F>(F);

/// Adapt `Fn(Vec<T>) -> impl Future<Output = Result<(), BoxError>>` into a
/// [`BatchSink`].
pub fn sink_fn<F>(f: F) -> FnSink<F> {
    FnSink(f)
}

impl<T, F, Fut> BatchSink<T> for FnSink<F>
where
    T: Clone,
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    fn flush(
        &self,
        batch: &[T],
        _cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), BoxError>> + Send {
        (self.0)(batch.to_vec())
    }
}
