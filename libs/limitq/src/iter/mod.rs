//! Concurrency-limited iteration.
//!
//! All the functions here drive a private `Queue` over an input sequence, keeping
//! at most `concurrency` elements in flight. Outcomes are delivered over a channel
//! tagged with the index of the element, so every completion is processed in O(1),
//! in completion order.
//!
//! As soon as the outcome of the whole iteration is decided (first error, or a
//! decisive element for the short-circuiting helpers), the remaining elements are
//! abandoned: no further element is started, and the tasks which are already
//! running are left to complete on their own, with their outcomes ignored.
//! Cancelation of `ctx` abandons the iteration in the same way. A panic of an element
//! abandons the iteration too, and is then resumed in the caller.
use crate::{config::Concurrency, ctx, metrics, queue::Queue};
use std::{convert::Infallible, future::Future, ops::ControlFlow, panic, sync::Arc};
use tokio::sync::mpsc;

#[cfg(test)]
mod tests;

/// Runs `f` over `items`, with at most `concurrency` elements in flight.
/// Successful outputs are passed to `on_output` in completion order,
/// which decides whether to continue or to stop with a result.
/// Returns `None` if all the elements have been processed.
#[tracing::instrument(level = "debug", skip_all, fields(concurrency = %concurrency))]
async fn run_limit<I, T, E, F, Fut, R>(
    ctx: &ctx::Ctx,
    items: impl IntoIterator<Item = I>,
    concurrency: Concurrency,
    mut f: F,
    mut on_output: impl FnMut(usize, T) -> ControlFlow<R>,
) -> Result<Option<R>, E>
where
    T: 'static + Send,
    E: 'static + Send + From<ctx::Canceled>,
    F: FnMut(I, usize) -> Fut,
    Fut: 'static + Send + Future<Output = Result<T, E>>,
{
    let queue = Queue::new(concurrency);
    let (send, mut recv) = mpsc::unbounded_channel();
    let mut items = items.into_iter().enumerate();
    let mut in_flight = 0;
    let mut exhausted = false;
    loop {
        // Refill.
        while !exhausted && in_flight < concurrency.get() {
            let Some((i, item)) = items.next() else {
                exhausted = true;
                break;
            };
            let send = send.clone();
            queue.submit_with(f(item, i), move |res| {
                // Receiver is gone iff the iteration has been abandoned.
                let _ = send.send((i, res));
            });
            in_flight += 1;
        }
        if in_flight == 0 {
            return Ok(None);
        }
        let next = ctx.wait(async {
            // `send` is alive, so the channel never gets disconnected.
            match recv.recv().await {
                Some(v) => v,
                None => std::future::pending().await,
            }
        });
        let (i, res) = match next.await {
            Ok(v) => v,
            Err(err) => {
                abandon(in_flight, exhausted);
                return Err(err.into());
            }
        };
        in_flight -= 1;
        let res = match res {
            Ok(res) => res,
            Err(payload) => {
                tracing::debug!(index = i, "element panicked");
                abandon(in_flight, exhausted);
                panic::resume_unwind(payload);
            }
        };
        let flow = match res {
            Ok(v) => on_output(i, v),
            Err(err) => {
                tracing::debug!(index = i, "element failed");
                abandon(in_flight, exhausted);
                return Err(err);
            }
        };
        if let ControlFlow::Break(r) = flow {
            tracing::debug!(index = i, "iteration decided");
            abandon(in_flight, exhausted);
            return Ok(Some(r));
        }
    }
}

/// Records an early termination of the iteration.
fn abandon(in_flight: usize, exhausted: bool) {
    if in_flight > 0 || !exhausted {
        tracing::debug!(in_flight, exhausted, "abandoning remaining elements");
        metrics::ITER.abandoned.inc();
    }
}

/// Maps `items` with `f`, running at most `concurrency` invocations at once.
///
/// `f` receives each element together with its index; see [`map_slice_limit`]
/// for a transform which also needs the whole sequence.
/// Returns the outputs in the order of the input, regardless of the order
/// in which they completed, or the first error (in completion order).
/// After an error no further element is started; elements which are
/// already running are left to complete and their outcomes are ignored.
/// If `f`'s future panics, the panic is resumed here.
pub async fn map_limit<I, T, E, F, Fut>(
    ctx: &ctx::Ctx,
    items: impl IntoIterator<Item = I>,
    concurrency: Concurrency,
    f: F,
) -> Result<Vec<T>, E>
where
    T: 'static + Send,
    E: 'static + Send + From<ctx::Canceled>,
    F: FnMut(I, usize) -> Fut,
    Fut: 'static + Send + Future<Output = Result<T, E>>,
{
    let mut outputs: Vec<Option<T>> = vec![];
    run_limit(ctx, items, concurrency, f, |i, v| {
        if outputs.len() <= i {
            outputs.resize_with(i + 1, || None);
        }
        debug_assert!(outputs[i].is_none());
        outputs[i] = Some(v);
        ControlFlow::<Infallible>::Continue(())
    })
    .await?;
    // Every element has completed successfully at this point.
    Ok(outputs.into_iter().flatten().collect())
}

/// Same as [`map_limit`], but over a shared slice: `f` receives a reference to
/// the element, its index and the whole sequence.
pub async fn map_slice_limit<I, T, E, F, Fut>(
    ctx: &ctx::Ctx,
    items: impl Into<Arc<[I]>>,
    concurrency: Concurrency,
    mut f: F,
) -> Result<Vec<T>, E>
where
    T: 'static + Send,
    E: 'static + Send + From<ctx::Canceled>,
    F: FnMut(&I, usize, &Arc<[I]>) -> Fut,
    Fut: 'static + Send + Future<Output = Result<T, E>>,
{
    let items = items.into();
    map_limit(ctx, 0..items.len(), concurrency, |i, _| f(&items[i], i, &items)).await
}

/// Runs `f` for every element of `items`, at most `concurrency` at once.
/// Returns the first error, abandoning the remaining elements.
pub async fn for_each_limit<I, E, F, Fut>(
    ctx: &ctx::Ctx,
    items: impl IntoIterator<Item = I>,
    concurrency: Concurrency,
    f: F,
) -> Result<(), E>
where
    E: 'static + Send + From<ctx::Canceled>,
    F: FnMut(I, usize) -> Fut,
    Fut: 'static + Send + Future<Output = Result<(), E>>,
{
    run_limit(ctx, items, concurrency, f, |_, ()| {
        ControlFlow::<Infallible>::Continue(())
    })
    .await?;
    Ok(())
}

/// Returns the index of the first element (in completion order) for which
/// `pred` returns `true`, abandoning the remaining elements once found.
/// Returns `None` if there is no such element.
pub async fn find_index_limit<I, E, F, Fut>(
    ctx: &ctx::Ctx,
    items: impl IntoIterator<Item = I>,
    concurrency: Concurrency,
    pred: F,
) -> Result<Option<usize>, E>
where
    E: 'static + Send + From<ctx::Canceled>,
    F: FnMut(I, usize) -> Fut,
    Fut: 'static + Send + Future<Output = Result<bool, E>>,
{
    run_limit(ctx, items, concurrency, pred, |i, found| {
        if found {
            ControlFlow::Break(i)
        } else {
            ControlFlow::Continue(())
        }
    })
    .await
}

/// Checks whether `pred` returns `true` for any element.
/// Short-circuits on the first `true`.
pub async fn some_limit<I, E, F, Fut>(
    ctx: &ctx::Ctx,
    items: impl IntoIterator<Item = I>,
    concurrency: Concurrency,
    pred: F,
) -> Result<bool, E>
where
    E: 'static + Send + From<ctx::Canceled>,
    F: FnMut(I, usize) -> Fut,
    Fut: 'static + Send + Future<Output = Result<bool, E>>,
{
    Ok(find_index_limit(ctx, items, concurrency, pred)
        .await?
        .is_some())
}

/// Checks whether `pred` returns `true` for every element.
/// Short-circuits on the first `false`. Empty input yields `true`.
pub async fn every_limit<I, E, F, Fut>(
    ctx: &ctx::Ctx,
    items: impl IntoIterator<Item = I>,
    concurrency: Concurrency,
    pred: F,
) -> Result<bool, E>
where
    E: 'static + Send + From<ctx::Canceled>,
    F: FnMut(I, usize) -> Fut,
    Fut: 'static + Send + Future<Output = Result<bool, E>>,
{
    let counterexample = run_limit(ctx, items, concurrency, pred, |_, ok| {
        if ok {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    })
    .await?;
    Ok(counterexample.is_none())
}

/// Returns the elements for which `pred` returns `true`, in input order.
/// Elements are moved into the tasks and back, so `pred` only gets
/// a reference to build its future from.
pub async fn filter_limit<I, E, F, Fut>(
    ctx: &ctx::Ctx,
    items: impl IntoIterator<Item = I>,
    concurrency: Concurrency,
    mut pred: F,
) -> Result<Vec<I>, E>
where
    I: 'static + Send,
    E: 'static + Send + From<ctx::Canceled>,
    F: FnMut(&I, usize) -> Fut,
    Fut: 'static + Send + Future<Output = Result<bool, E>>,
{
    let kept = map_limit(ctx, items, concurrency, |item, i| {
        let keep = pred(&item, i);
        async move { Ok::<_, E>(keep.await?.then_some(item)) }
    })
    .await?;
    Ok(kept.into_iter().flatten().collect())
}
