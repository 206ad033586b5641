use std::collections::{BTreeMap, HashMap};

use crate::series::{SignalPoint, SignalSeries};

/// A regional series as persisted: one row per `(region_code, datasource)`
/// holding the whole sample array.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRegionSeries {
    pub from_epoch: i64,
    pub step_seconds: i64,
    pub values: Vec<Option<f64>>,
}

/// Merge one freshly built row with its previously persisted counterpart.
///
/// For each datasource field the resolution is `fresh.or(previous)`: a
/// successful fresh fetch overwrites, a failed fetch leaves history intact,
/// and only true first-time absence yields null. This is what lets one
/// datasource's fetch failure coexist with another datasource's already-known
/// value at the same timestamp.
pub fn reconcile_point(fresh: &SignalPoint, previous: Option<&SignalPoint>) -> SignalPoint {
    let Some(previous) = previous else {
        return fresh.clone();
    };
    SignalPoint {
        ts: fresh.ts,
        bgp: fresh.bgp.or(previous.bgp),
        probing: fresh.probing.or(previous.probing),
        telescope: fresh.telescope.or(previous.telescope),
    }
}

/// Reconcile a freshly merged row set against previously persisted rows keyed
/// by timestamp. Rows only present in the fresh set pass through unchanged;
/// rows only present in the store are not re-emitted (they are already
/// persisted and untouched by the upsert).
pub fn reconcile_rows(fresh: Vec<SignalPoint>, previous: &[SignalPoint]) -> Vec<SignalPoint> {
    let by_ts: HashMap<i64, &SignalPoint> = previous.iter().map(|row| (row.ts, row)).collect();
    fresh
        .into_iter()
        .map(|row| {
            let prior = by_ts.get(&row.ts).copied();
            reconcile_point(&row, prior)
        })
        .collect()
}

/// Elementwise union of a fresh regional series with its stored counterpart,
/// keyed by absolute timestamp. Fresh real samples win; stored real samples
/// survive a fresh null; the result covers both ranges on the fresh step grid.
///
/// Assumes the upstream keeps a stable step per datasource; history that does
/// not land on the fresh grid falls off.
pub fn reconcile_region_series(
    fresh: &SignalSeries,
    previous: Option<&StoredRegionSeries>,
) -> StoredRegionSeries {
    let step = fresh.step_seconds.max(1);
    let mut samples: BTreeMap<i64, Option<f64>> = BTreeMap::new();

    if let Some(previous) = previous {
        for (i, value) in previous.values.iter().enumerate() {
            let ts = previous.from_epoch + i as i64 * previous.step_seconds;
            samples.insert(ts, *value);
        }
    }

    for (i, value) in fresh.values.iter().enumerate() {
        let ts = fresh.from_epoch + i as i64 * step;
        match samples.get(&ts) {
            Some(Some(_)) if value.is_none() => {}
            _ => {
                samples.insert(ts, *value);
            }
        }
    }

    let Some((&first_ts, _)) = samples.iter().next() else {
        return StoredRegionSeries {
            from_epoch: fresh.from_epoch,
            step_seconds: step,
            values: Vec::new(),
        };
    };
    let last_ts = *samples.keys().next_back().unwrap_or(&first_ts);

    let len = ((last_ts - first_ts) / step + 1) as usize;
    let mut values = vec![None; len];
    for (ts, value) in samples {
        let offset = ts - first_ts;
        if offset % step == 0 {
            values[(offset / step) as usize] = value;
        }
    }

    StoredRegionSeries {
        from_epoch: first_ts,
        step_seconds: step,
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::{Datasource, Entity};

    #[test]
    fn fresh_value_overwrites_and_null_preserves() {
        let fresh = SignalPoint {
            ts: 100,
            bgp: Some(2.0),
            probing: None,
            telescope: None,
        };
        let previous = SignalPoint {
            ts: 100,
            bgp: Some(1.0),
            probing: Some(5.0),
            telescope: None,
        };

        let merged = reconcile_point(&fresh, Some(&previous));
        assert_eq!(merged.bgp, Some(2.0), "fresh overwrites");
        assert_eq!(merged.probing, Some(5.0), "failed fetch keeps history");
        assert_eq!(merged.telescope, None, "first-time absence stays null");
    }

    #[test]
    fn reconcile_is_idempotent() {
        let fresh = vec![SignalPoint {
            ts: 100,
            bgp: Some(2.0),
            probing: None,
            telescope: Some(3.0),
        }];
        let previous = vec![SignalPoint {
            ts: 100,
            bgp: Some(1.0),
            probing: Some(5.0),
            telescope: None,
        }];

        let once = reconcile_rows(fresh, &previous);
        let twice = reconcile_rows(once.clone(), &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn region_union_prefers_fresh_but_keeps_stored_history() {
        let stored = StoredRegionSeries {
            from_epoch: 0,
            step_seconds: 100,
            values: vec![Some(1.0), Some(2.0), Some(3.0)],
        };
        let fresh = SignalSeries {
            entity: Entity::region("ve-mir"),
            datasource: Datasource::Probing,
            from_epoch: 100,
            step_seconds: 100,
            values: vec![None, Some(9.0), Some(10.0)],
        };

        let merged = reconcile_region_series(&fresh, Some(&stored));
        assert_eq!(merged.from_epoch, 0);
        assert_eq!(merged.step_seconds, 100);
        assert_eq!(
            merged.values,
            vec![Some(1.0), Some(2.0), Some(9.0), Some(10.0)],
            "stored survives fresh null at ts=100, fresh wins at ts=200, range extends"
        );
    }

    #[test]
    fn region_union_without_history_passes_fresh_through() {
        let fresh = SignalSeries {
            entity: Entity::region("ve-dc"),
            datasource: Datasource::Bgp,
            from_epoch: 500,
            step_seconds: 60,
            values: vec![Some(4.0), None],
        };
        let merged = reconcile_region_series(&fresh, None);
        assert_eq!(merged.from_epoch, 500);
        assert_eq!(merged.values, vec![Some(4.0), None]);
    }
}
