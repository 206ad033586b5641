use chrono::{Duration, Utc};
use connmon::{
    ConnectivityStatus, Datasource, EntityType, OutageEvent, SignalPoint, derive_status,
};

fn bgp_points(values: &[f64]) -> Vec<SignalPoint> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| SignalPoint {
            ts: 1_000 + i as i64 * 300,
            bgp: Some(*value),
            probing: None,
            telescope: None,
        })
        .collect()
}

fn event(start_ts: i64, score: f64) -> OutageEvent {
    OutageEvent {
        entity_type: EntityType::Country,
        entity_code: "VE".into(),
        datasource: Datasource::Bgp,
        start_ts,
        duration_seconds: 600,
        score,
    }
}

#[test]
fn zero_signals_mean_no_data() {
    let now = Utc::now();
    assert_eq!(derive_status(&[], &[], now), ConnectivityStatus::NoData);

    // Rows that exist but carry no samples are still "no data".
    let empty_rows = vec![SignalPoint {
        ts: 1_000,
        bgp: None,
        probing: None,
        telescope: None,
    }];
    assert_eq!(
        derive_status(&empty_rows, &[], now),
        ConnectivityStatus::NoData
    );
}

#[test]
fn recent_high_score_event_wins_regardless_of_signal_shape() {
    let now = Utc::now();
    let healthy = bgp_points(&[100.0; 24]);
    let events = vec![event((now - Duration::hours(1)).timestamp(), 600.0)];

    assert_eq!(
        derive_status(&healthy, &events, now),
        ConnectivityStatus::Outage
    );
}

#[test]
fn recent_moderate_event_degrades() {
    let now = Utc::now();
    let healthy = bgp_points(&[100.0; 24]);
    let events = vec![event((now - Duration::minutes(30)).timestamp(), 150.0)];

    assert_eq!(
        derive_status(&healthy, &events, now),
        ConnectivityStatus::Degraded
    );
}

#[test]
fn old_events_do_not_trigger_the_event_rules() {
    let now = Utc::now();
    let healthy = bgp_points(&[100.0; 24]);
    let events = vec![event((now - Duration::hours(3)).timestamp(), 600.0)];

    assert_eq!(
        derive_status(&healthy, &events, now),
        ConnectivityStatus::Normal
    );
}

#[test]
fn latest_below_half_of_median_is_an_outage() {
    let now = Utc::now();
    let mut values = vec![100.0; 23];
    values.push(30.0);
    assert_eq!(
        derive_status(&bgp_points(&values), &[], now),
        ConnectivityStatus::Outage
    );

    let mut values = vec![100.0; 23];
    values.push(40.0);
    assert_eq!(
        derive_status(&bgp_points(&values), &[], now),
        ConnectivityStatus::Outage,
        "40% of median is below the half-median outage line"
    );
}

#[test]
fn latest_between_half_and_eighty_percent_of_median_degrades() {
    let now = Utc::now();
    let mut values = vec![100.0; 23];
    values.push(60.0);
    assert_eq!(
        derive_status(&bgp_points(&values), &[], now),
        ConnectivityStatus::Degraded
    );
}

#[test]
fn latest_near_median_is_normal() {
    let now = Utc::now();
    let mut values = vec![100.0; 23];
    values.push(95.0);
    assert_eq!(
        derive_status(&bgp_points(&values), &[], now),
        ConnectivityStatus::Normal
    );
}

#[test]
fn thin_windows_skip_the_drop_heuristic() {
    let now = Utc::now();
    // Three non-null samples: below the minimum, so even a hard drop is not
    // classified by the heuristic.
    let values = [100.0, 100.0, 10.0];
    assert_eq!(
        derive_status(&bgp_points(&values), &[], now),
        ConnectivityStatus::Normal
    );
}

#[test]
fn nulls_are_excluded_from_the_drop_window() {
    let now = Utc::now();
    let mut points = bgp_points(&[100.0; 23]);
    // A trailing null row must not count as the latest sample.
    points.push(SignalPoint {
        ts: 50_000,
        bgp: None,
        probing: Some(5.0),
        telescope: None,
    });
    assert_eq!(derive_status(&points, &[], now), ConnectivityStatus::Normal);
}
