use std::future::Future;

use tokio::task::JoinSet;

/// Run one async unit of work per item with at most `limit` in flight.
///
/// Results come back in input order: `results[i]` is the outcome for
/// `items[i]` regardless of completion order. No item is dropped. The unit of
/// work is expected to catch its own failures and map them to a neutral value;
/// this runner only bounds parallelism and restores ordering.
///
/// Dispatch loop: spawn until the cap is reached, then one-in-one-out as work
/// slots free up, until the queue is exhausted and all in-flight work settled.
pub async fn run_limited<I, T, F, Fut>(items: Vec<I>, limit: usize, work: F) -> Vec<T>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let limit = limit.max(1);
    let total = items.len();

    let mut results: Vec<Option<T>> = Vec::with_capacity(total);
    results.resize_with(total, || None);

    let mut queue = items.into_iter().enumerate();
    let mut in_flight: JoinSet<(usize, T)> = JoinSet::new();

    loop {
        while in_flight.len() < limit {
            let Some((index, item)) = queue.next() else {
                break;
            };
            let fut = work(item);
            in_flight.spawn(async move { (index, fut.await) });
        }

        match in_flight.join_next().await {
            Some(Ok((index, value))) => results[index] = Some(value),
            Some(Err(err)) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Some(Err(_)) => {}
            None => break,
        }
    }

    let collected: Vec<T> = results.into_iter().flatten().collect();
    debug_assert_eq!(collected.len(), total, "limiter lost a result slot");
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_input_yields_empty_output() {
        let results = run_limited(Vec::<u32>::new(), 5, |n| async move { n }).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn in_flight_count_never_exceeds_limit() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<usize> = (0..20).collect();
        let results = run_limited(items, 3, |n| {
            let current = current.clone();
            let peak = peak.clone();
            async move {
                let active = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                n
            }
        })
        .await;

        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3, "limit breached");
    }
}
