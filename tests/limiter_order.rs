use std::time::Duration;

use connmon::limiter::run_limited;

// Delays are scrambled so completion order differs from input order; the
// results must still line up with the inputs index for index.
#[tokio::test]
async fn results_match_input_order_despite_completion_order() {
    let items: Vec<(usize, u64)> = (0..32).map(|i| (i, (i as u64 * 13) % 17)).collect();

    let results = run_limited(items, 5, |(index, delay_ms)| async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        index
    })
    .await;

    let expected: Vec<usize> = (0..32).collect();
    assert_eq!(results, expected);
}

#[tokio::test]
async fn failing_units_map_to_neutral_values_without_dropping_items() {
    let results = run_limited(vec![1u32, 2, 3, 4, 5], 2, |n| async move {
        // The unit of work owns its failures and maps them to a sentinel.
        if n % 2 == 0 { None } else { Some(n) }
    })
    .await;

    assert_eq!(results, vec![Some(1), None, Some(3), None, Some(5)]);
}

#[tokio::test]
async fn limit_larger_than_input_completes_everything() {
    let results = run_limited(vec![10, 20, 30], 100, |n| async move { n * 2 }).await;
    assert_eq!(results, vec![20, 40, 60]);
}
