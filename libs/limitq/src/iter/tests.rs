use super::*;
use crate::testonly;
use assert_matches::assert_matches;
use rand::{rngs::StdRng, Rng as _, SeedableRng as _};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use test_casing::test_casing;

const LIMITS: [usize; 4] = [1, 2, 3, 64];

fn ms(n: u64) -> std::time::Duration {
    std::time::Duration::from_millis(n)
}

fn limit(n: usize) -> Concurrency {
    Concurrency::new(n).unwrap()
}

#[test_casing(4, LIMITS)]
#[tokio::test(start_paused = true)]
async fn outputs_are_ordered_by_index(n: usize) {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let rng = &mut StdRng::seed_from_u64(n as u64);
    let delays: Vec<u64> = (0..20).map(|_| rng.gen_range(1..50)).collect();
    let probe = testonly::Probe::default();
    let got = map_limit(ctx, delays.clone(), limit(n), |delay, i| {
        let probe = probe.clone();
        async move {
            let _guard = probe.enter();
            tokio::time::sleep(ms(delay)).await;
            ctx::OrCanceled::Ok(i * 1000 + delay as usize)
        }
    })
    .await
    .unwrap();
    let want: Vec<_> = delays
        .iter()
        .enumerate()
        .map(|(i, d)| i * 1000 + *d as usize)
        .collect();
    assert_eq!(want, got);
    assert_eq!(n.min(delays.len()), probe.max());
    assert_eq!(delays.len(), probe.entered());
}

#[test]
fn ordering_under_both_runtimes() {
    testonly::abort_on_panic();
    testonly::with_runtimes(|| async {
        let ctx = &ctx::root();
        let rng = &mut StdRng::seed_from_u64(1234);
        let yields: Vec<usize> = (0..200).map(|_| rng.gen_range(0..10)).collect();
        let probe = testonly::Probe::default();
        let got = map_limit(ctx, yields.clone(), limit(7), |y, i| {
            let probe = probe.clone();
            async move {
                let _guard = probe.enter();
                for _ in 0..y {
                    tokio::task::yield_now().await;
                }
                ctx::OrCanceled::Ok((i, y))
            }
        })
        .await
        .unwrap();
        assert_eq!(yields.into_iter().enumerate().collect::<Vec<_>>(), got);
        assert!(probe.max() <= 7, "max = {}", probe.max());
    });
}

#[tokio::test(start_paused = true)]
async fn concurrency_limit_timing() {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let start = ctx.now();
    let got = map_limit(ctx, 0..4, limit(2), |x, _| async move {
        tokio::time::sleep(ms(10)).await;
        ctx::OrCanceled::Ok(x)
    })
    .await
    .unwrap();
    assert_eq!(vec![0, 1, 2, 3], got);
    let elapsed = ctx.now() - start;
    assert!(elapsed >= ms(20), "{elapsed:?}");
    assert!(elapsed < ms(30), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn limit_above_length_starts_everything() {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let start = ctx.now();
    for c in [limit(3), limit(100), Concurrency::UNLIMITED] {
        let got = map_limit(ctx, 0..3, c, |x, _| async move {
            tokio::time::sleep(ms(10)).await;
            ctx::OrCanceled::Ok(x * 2)
        })
        .await
        .unwrap();
        assert_eq!(vec![0, 2, 4], got);
    }
    let elapsed = ctx.now() - start;
    assert!(elapsed < ms(40), "{elapsed:?}");
}

#[tokio::test]
async fn empty_input() {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let calls = AtomicUsize::new(0);
    let got = map_limit(ctx, Vec::<u32>::new(), limit(4), |x, _| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { ctx::OrCanceled::Ok(x) }
    })
    .await
    .unwrap();
    assert!(got.is_empty());
    assert_eq!(0, calls.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn first_error_in_completion_order_wins() {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let started = testonly::Probe::default();
    let completed = Arc::new(AtomicUsize::new(0));
    let start = ctx.now();
    // Elements 0..3 start at once; element 2 fails first, element 0 fails later.
    let res: Result<Vec<()>, ctx::Error> = map_limit(ctx, 0..10, limit(3), |i, _| {
        let started = started.clone();
        let completed = completed.clone();
        async move {
            let _guard = started.enter();
            let delay = match i {
                0 => 30,
                2 => 10,
                _ => 20,
            };
            tokio::time::sleep(ms(delay)).await;
            completed.fetch_add(1, Ordering::SeqCst);
            if i == 0 || i == 2 {
                return Err(anyhow::format_err!("element {i}").into());
            }
            Ok(())
        }
    })
    .await;
    assert_matches!(res, Err(ctx::Error::Internal(err)) if err.to_string() == "element 2");
    // The error is returned without waiting for the other elements.
    assert!(ctx.now() - start < ms(20));
    assert_eq!(1, completed.load(Ordering::SeqCst));

    // Already running elements complete on their own, nothing else gets started.
    tokio::time::sleep(ms(100)).await;
    assert_eq!(3, started.entered());
    assert_eq!(3, completed.load(Ordering::SeqCst));
    assert_eq!(0, started.current());
}

#[tokio::test(start_paused = true)]
async fn canceled_context_abandons_iteration() {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let started = testonly::Probe::default();
    let timeout = &ctx.with_timeout(crate::time::Duration::milliseconds(5));
    let res = map_limit(timeout, 0..10, limit(2), |x, _| {
        let started = started.clone();
        async move {
            let _guard = started.enter();
            tokio::time::sleep(ms(100)).await;
            Ok::<_, ctx::Error>(x)
        }
    })
    .await;
    assert_matches!(res, Err(ctx::Error::Canceled(_)));
    tokio::time::sleep(ms(1000)).await;
    assert_eq!(2, started.entered());
}

#[tokio::test(start_paused = true)]
async fn panicking_element_is_resumed() {
    let started = testonly::Probe::default();
    let res = tokio::spawn({
        let started = started.clone();
        async move {
            let ctx = &ctx::root();
            map_limit(ctx, 0..10, limit(2), |x, _| {
                let started = started.clone();
                async move {
                    let _guard = started.enter();
                    tokio::time::sleep(ms(if x == 1 { 5 } else { 10 })).await;
                    if x == 1 {
                        panic!("element failure");
                    }
                    ctx::OrCanceled::Ok(x)
                }
            })
            .await
        }
    })
    .await;
    let payload = res.unwrap_err().into_panic();
    assert_eq!(Some(&"element failure"), payload.downcast_ref::<&str>());
    // Nothing gets started after the panic.
    tokio::time::sleep(ms(100)).await;
    assert_eq!(2, started.entered());
}

#[tokio::test]
async fn map_slice_limit_passes_the_sequence() {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let got = map_slice_limit(ctx, vec![5u64, 6, 7], limit(2), |x, i, items| {
        let mirror = items[items.len() - 1 - i];
        let x = *x;
        async move { ctx::OrCanceled::Ok(x + mirror) }
    })
    .await
    .unwrap();
    assert_eq!(vec![12, 12, 12], got);
}

#[tokio::test]
async fn transform_can_capture_the_sequence() {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let items: Arc<[u64]> = vec![5, 6, 7].into();
    let got = map_limit(ctx, items.iter().copied(), limit(2), |x, i| {
        let items = items.clone();
        async move { ctx::OrCanceled::Ok(x + items[items.len() - 1 - i]) }
    })
    .await
    .unwrap();
    assert_eq!(vec![12, 12, 12], got);
}

#[tokio::test(start_paused = true)]
async fn some_limit_short_circuits() {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let started = testonly::Probe::default();
    let found = some_limit(ctx, 0..100, limit(4), |x, _| {
        let started = started.clone();
        async move {
            let _guard = started.enter();
            tokio::time::sleep(ms(10)).await;
            ctx::OrCanceled::Ok(x == 5)
        }
    })
    .await
    .unwrap();
    assert!(found);
    tokio::time::sleep(ms(100)).await;
    assert!(started.entered() < 100, "entered = {}", started.entered());

    let found = some_limit(ctx, 0..10, limit(4), |x, _| async move {
        ctx::OrCanceled::Ok(x > 100)
    })
    .await
    .unwrap();
    assert!(!found);
}

#[tokio::test]
async fn every_limit_cases() {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let even = |x: u32, _: usize| async move { ctx::OrCanceled::Ok(x % 2 == 0) };
    assert!(every_limit(ctx, [0, 2, 4, 6], limit(2), even).await.unwrap());
    assert!(!every_limit(ctx, [0, 2, 5, 6], limit(2), even).await.unwrap());
    assert!(every_limit(ctx, [], limit(2), even).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn find_index_returns_first_completed_match() {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let got = find_index_limit(ctx, [30, 10, 20], limit(3), |delay, _| async move {
        tokio::time::sleep(ms(delay)).await;
        ctx::OrCanceled::Ok(true)
    })
    .await
    .unwrap();
    assert_eq!(Some(1), got);

    let got = find_index_limit(ctx, [1, 2, 3], limit(3), |x, _| async move {
        ctx::OrCanceled::Ok(x == 4)
    })
    .await
    .unwrap();
    assert_eq!(None, got);
}

#[tokio::test(start_paused = true)]
async fn filter_limit_keeps_input_order() {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let rng = &mut StdRng::seed_from_u64(7);
    let items: Vec<(u64, u64)> = (0..30).map(|i| (i, rng.gen_range(1..20))).collect();
    let got = filter_limit(ctx, items, limit(5), |&(x, delay), _| async move {
        tokio::time::sleep(ms(delay)).await;
        ctx::OrCanceled::Ok(x % 3 == 0)
    })
    .await
    .unwrap();
    let got: Vec<_> = got.into_iter().map(|(x, _)| x).collect();
    assert_eq!((0..30).step_by(3).collect::<Vec<_>>(), got);
}

#[tokio::test]
async fn for_each_limit_propagates_error() {
    testonly::abort_on_panic();
    let ctx = &ctx::root();
    let sum = Arc::new(AtomicUsize::new(0));
    for_each_limit(ctx, 1..=10, limit(3), |x, _| {
        let sum = sum.clone();
        async move {
            sum.fetch_add(x, Ordering::SeqCst);
            Ok::<_, ctx::Error>(())
        }
    })
    .await
    .unwrap();
    assert_eq!(55, sum.load(Ordering::SeqCst));

    let res = for_each_limit(ctx, 1..=10, Concurrency::ONE, |x, _| async move {
        if x == 4 {
            return Err(ctx::Error::Internal(anyhow::format_err!("bad element")));
        }
        Ok(())
    })
    .await;
    assert_matches!(res, Err(ctx::Error::Internal(_)));
}
