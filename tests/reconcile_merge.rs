use connmon::reconcile::{StoredRegionSeries, reconcile_region_series, reconcile_rows};
use connmon::series::{Datasource, Entity, SignalPoint, SignalSeries, rows_by_timestamp};

fn series(datasource: Datasource, from: i64, values: Vec<Option<f64>>) -> SignalSeries {
    SignalSeries {
        entity: Entity::country("VE"),
        datasource,
        from_epoch: from,
        step_seconds: 300,
        values,
    }
}

// Cycle 1 persists bgp + probing; in cycle 2 the probing fetch fails. The
// reconciled rows must keep every probing value from cycle 1.
#[test]
fn failed_datasource_never_erases_persisted_values() {
    let cycle1 = rows_by_timestamp(&[
        series(Datasource::Bgp, 0, vec![Some(10.0), Some(11.0), Some(12.0)]),
        series(Datasource::Probing, 0, vec![Some(7.0), Some(8.0), Some(9.0)]),
    ]);

    // Cycle 2: only bgp came back, with newer values.
    let cycle2 = rows_by_timestamp(&[series(
        Datasource::Bgp,
        0,
        vec![Some(20.0), Some(21.0), Some(22.0)],
    )]);

    let merged = reconcile_rows(cycle2, &cycle1);
    assert_eq!(merged.len(), 3);
    for (i, row) in merged.iter().enumerate() {
        assert_eq!(row.bgp, Some(20.0 + i as f64), "fresh bgp overwrites");
        assert_eq!(row.probing, Some(7.0 + i as f64), "probing history preserved");
        assert_eq!(row.telescope, None, "never-seen datasource stays null");
    }
}

#[test]
fn applying_the_same_merge_twice_changes_nothing() {
    let previous = vec![
        SignalPoint {
            ts: 0,
            bgp: Some(1.0),
            probing: Some(2.0),
            telescope: None,
        },
        SignalPoint {
            ts: 300,
            bgp: None,
            probing: Some(3.0),
            telescope: Some(4.0),
        },
    ];
    let fresh = vec![
        SignalPoint {
            ts: 0,
            bgp: Some(9.0),
            probing: None,
            telescope: None,
        },
        SignalPoint {
            ts: 300,
            bgp: Some(8.0),
            probing: None,
            telescope: None,
        },
    ];

    let once = reconcile_rows(fresh.clone(), &previous);
    let twice = reconcile_rows(once.clone(), &once);
    assert_eq!(once, twice, "reconciliation must be idempotent");

    // And replaying the identical fresh set against the merged state is
    // also a fixed point.
    let replay = reconcile_rows(fresh, &once);
    assert_eq!(replay, once);
}

#[test]
fn region_series_union_is_null_preserving_and_idempotent() {
    let stored = StoredRegionSeries {
        from_epoch: 0,
        step_seconds: 300,
        values: vec![Some(1.0), Some(2.0), None, Some(4.0)],
    };
    let fresh = SignalSeries {
        entity: Entity::region("VE-A"),
        datasource: Datasource::Telescope,
        from_epoch: 600,
        step_seconds: 300,
        values: vec![Some(30.0), None, Some(50.0)],
    };

    let merged = reconcile_region_series(&fresh, Some(&stored));
    assert_eq!(merged.from_epoch, 0);
    assert_eq!(
        merged.values,
        vec![Some(1.0), Some(2.0), Some(30.0), Some(4.0), Some(50.0)],
        "fresh 30 fills the stored hole at 600, fresh null keeps 4 at 900, 50 extends the range"
    );

    let again = reconcile_region_series(&fresh, Some(&merged));
    assert_eq!(again, merged);
}
