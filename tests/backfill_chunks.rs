use connmon::sync::chunk_range;

const WEEK: i64 = 7 * 24 * 3600;

#[test]
fn chunks_cover_exact_multiples_without_gaps() {
    let from = 1_600_000_000;
    let until = from + 3 * WEEK;

    let chunks = chunk_range(from, until, WEEK);
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks.first().unwrap().0, from);
    assert_eq!(chunks.last().unwrap().1, until);
    for pair in chunks.windows(2) {
        assert_eq!(pair[0].1, pair[1].0, "gap or overlap between chunks");
    }
}

#[test]
fn final_chunk_truncates_to_requested_until() {
    let from = 1_600_000_000;
    let until = from + 2 * WEEK + 12_345;

    let chunks = chunk_range(from, until, WEEK);
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[2], (from + 2 * WEEK, until));
    for (a, b) in &chunks {
        assert!(a < b, "chunk [{a}, {b}) is empty or inverted");
    }
    for pair in chunks.windows(2) {
        assert_eq!(pair[0].1, pair[1].0);
    }
}

#[test]
fn empty_or_inverted_ranges_produce_no_chunks() {
    assert!(chunk_range(500, 500, WEEK).is_empty());
    assert!(chunk_range(500, 400, WEEK).is_empty());
}

#[test]
fn range_smaller_than_one_chunk_is_one_truncated_chunk() {
    let chunks = chunk_range(0, 3_600, WEEK);
    assert_eq!(chunks, vec![(0, 3_600)]);
}
