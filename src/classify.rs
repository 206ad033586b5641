use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::series::{Datasource, OutageEvent, SignalPoint};

/// Datasource inspected by the silent-degradation drop heuristic.
const PRIMARY_DATASOURCE: Datasource = Datasource::Bgp;

/// How far back discrete events are considered "recent" for status derivation.
const RECENT_EVENT_WINDOW_HOURS: i64 = 2;

/// Event score at or above which a recent event means an outage.
const EVENT_OUTAGE_SCORE: f64 = 500.0;

/// Event score at or above which a recent event means degradation.
const EVENT_DEGRADED_SCORE: f64 = 100.0;

/// Number of trailing route-visibility samples inspected by the drop heuristic.
const DROP_WINDOW_SAMPLES: usize = 24;

/// Minimum non-null samples required before the drop heuristic applies.
const DROP_WINDOW_MIN_SAMPLES: usize = 4;

/// Discrete outage severity derived from a raw anomaly score.
///
/// Ordered from healthy to worst; the ordering is relied on by callers that
/// pick the worst severity across regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Low,
    Degraded,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Low => "low",
            Severity::Degraded => "degraded",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Map a raw anomaly score onto a severity level.
///
/// Total over all finite scores: every input maps to exactly one level, and
/// the mapping is monotonic in the score.
pub fn classify(score: f64) -> Severity {
    if score <= 0.0 {
        Severity::Normal
    } else if score < 1_000.0 {
        Severity::Low
    } else if score < 50_000.0 {
        Severity::Degraded
    } else if score < 200_000.0 {
        Severity::High
    } else {
        Severity::Critical
    }
}

/// Aggregate connectivity status computed per dashboard request.
///
/// Never persisted; derived from the signals and events loaded for the
/// request and discarded with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectivityStatus {
    Normal,
    Degraded,
    Outage,
    NoData,
}

impl ConnectivityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectivityStatus::Normal => "normal",
            ConnectivityStatus::Degraded => "degraded",
            ConnectivityStatus::Outage => "outage",
            ConnectivityStatus::NoData => "no-data",
        }
    }
}

/// Derive the aggregate status from signal rows and outage events.
///
/// Rules are evaluated in order, first match wins:
/// 1. no samples at all: `NoData`;
/// 2. a recent event (last 2h) above the outage/degraded score thresholds;
/// 3. the latest route-visibility sample dropping below half / 80% of the
///    median over the trailing window;
/// 4. `Normal`.
///
/// Discrete events take precedence over the statistical drop heuristic; the
/// heuristic only catches silent degradation without an explicit event.
pub fn derive_status(
    signals: &[SignalPoint],
    events: &[OutageEvent],
    now: DateTime<Utc>,
) -> ConnectivityStatus {
    if !signals.iter().any(SignalPoint::has_sample) {
        return ConnectivityStatus::NoData;
    }

    let recent_cutoff = (now - Duration::hours(RECENT_EVENT_WINDOW_HOURS)).timestamp();
    let recent: Vec<&OutageEvent> = events
        .iter()
        .filter(|event| event.start_ts >= recent_cutoff)
        .collect();

    if recent.iter().any(|event| event.score >= EVENT_OUTAGE_SCORE) {
        return ConnectivityStatus::Outage;
    }
    if recent.iter().any(|event| event.score >= EVENT_DEGRADED_SCORE) {
        return ConnectivityStatus::Degraded;
    }

    if let Some(status) = route_visibility_drop(signals) {
        return status;
    }

    ConnectivityStatus::Normal
}

/// Fallback heuristic: compare the latest route-visibility sample against the
/// median of the trailing window. Skipped when the window is too thin to be
/// meaningful.
fn route_visibility_drop(signals: &[SignalPoint]) -> Option<ConnectivityStatus> {
    let samples: Vec<f64> = signals
        .iter()
        .filter_map(|point| point.get(PRIMARY_DATASOURCE))
        .collect();
    let window: Vec<f64> = samples
        .iter()
        .rev()
        .take(DROP_WINDOW_SAMPLES)
        .rev()
        .copied()
        .collect();

    if window.len() < DROP_WINDOW_MIN_SAMPLES {
        return None;
    }

    let latest = *window.last()?;
    let median = median(&window)?;
    if median <= 0.0 {
        return None;
    }

    if latest < median * 0.5 {
        Some(ConnectivityStatus::Outage)
    } else if latest < median * 0.8 {
        Some(ConnectivityStatus::Degraded)
    } else {
        None
    }
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_boundaries_match_thresholds() {
        assert_eq!(classify(-5.0), Severity::Normal);
        assert_eq!(classify(0.0), Severity::Normal);
        assert_eq!(classify(1.0), Severity::Low);
        assert_eq!(classify(999.0), Severity::Low);
        assert_eq!(classify(1_000.0), Severity::Degraded);
        assert_eq!(classify(49_999.0), Severity::Degraded);
        assert_eq!(classify(50_000.0), Severity::High);
        assert_eq!(classify(199_999.0), Severity::High);
        assert_eq!(classify(200_000.0), Severity::Critical);
        assert_eq!(classify(1e9), Severity::Critical);
    }

    #[test]
    fn severity_is_monotonic() {
        let probes = [
            -10.0, 0.0, 0.5, 1.0, 500.0, 999.0, 1_000.0, 10_000.0, 49_999.0, 50_000.0, 100_000.0,
            199_999.0, 200_000.0, 1e7,
        ];
        for pair in probes.windows(2) {
            assert!(
                classify(pair[0]) <= classify(pair[1]),
                "classify({}) > classify({})",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn median_of_even_window_averages_middle_pair() {
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), Some(2.5));
        assert_eq!(median(&[5.0]), Some(5.0));
        assert_eq!(median(&[]), None);
    }
}
