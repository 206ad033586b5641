use std::collections::BTreeMap;

use serde::Serialize;

/// One independent connectivity-measurement method.
///
/// The upstream service identifies these with its own datasource ids; see
/// [`Datasource::from_upstream_id`] for the mapping, including the alias kept
/// for the renamed network-telescope feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Datasource {
    /// Route visibility (BGP).
    Bgp,
    /// Active probing.
    Probing,
    /// Passive darknet telescope.
    Telescope,
}

impl Datasource {
    pub const ALL: [Datasource; 3] = [Datasource::Bgp, Datasource::Probing, Datasource::Telescope];

    /// Column / API name used throughout this service.
    pub fn as_str(self) -> &'static str {
        match self {
            Datasource::Bgp => "bgp",
            Datasource::Probing => "probing",
            Datasource::Telescope => "telescope",
        }
    }

    /// Identifier sent to the upstream measurement service.
    pub fn upstream_id(self) -> &'static str {
        match self {
            Datasource::Bgp => "bgp",
            Datasource::Probing => "ping-slash24",
            Datasource::Telescope => "merit-nt",
        }
    }

    /// Canonicalize an upstream identifier.
    ///
    /// The alias table is consulted here and nowhere else: the upstream
    /// renamed its network-telescope feed from `ucsd-nt` to `merit-nt`, and
    /// both ids mean the same logical signal.
    pub fn from_upstream_id(id: &str) -> Option<Datasource> {
        match id {
            "bgp" => Some(Datasource::Bgp),
            "ping-slash24" => Some(Datasource::Probing),
            "merit-nt" | "ucsd-nt" => Some(Datasource::Telescope),
            _ => None,
        }
    }

    /// Parse the canonical name used by our own API surface.
    pub fn parse(name: &str) -> Option<Datasource> {
        match name {
            "bgp" => Some(Datasource::Bgp),
            "probing" => Some(Datasource::Probing),
            "telescope" => Some(Datasource::Telescope),
            _ => None,
        }
    }
}

/// Entity kind: a country or one of its subnational regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Country,
    Region,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Country => "country",
            EntityType::Region => "region",
        }
    }

    pub fn parse(name: &str) -> Option<EntityType> {
        match name {
            "country" => Some(EntityType::Country),
            "region" => Some(EntityType::Region),
            _ => None,
        }
    }
}

/// A monitored entity identified by `(entity_type, code)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub entity_type: EntityType,
    pub code: String,
}

impl Entity {
    pub fn country(code: impl Into<String>) -> Self {
        Self {
            entity_type: EntityType::Country,
            code: code.into(),
        }
    }

    pub fn region(code: impl Into<String>) -> Self {
        Self {
            entity_type: EntityType::Region,
            code: code.into(),
        }
    }
}

/// One datasource's raw time series for one entity, as fetched upstream.
///
/// `values[i]` is the sample at `from_epoch + i * step_seconds`; `None` means
/// "no sample", never zero. Immutable once fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSeries {
    pub entity: Entity,
    pub datasource: Datasource,
    pub from_epoch: i64,
    pub step_seconds: i64,
    pub values: Vec<Option<f64>>,
}

impl SignalSeries {
    pub fn timestamp_at(&self, index: usize) -> i64 {
        self.from_epoch + index as i64 * self.step_seconds
    }
}

/// One unified row: all datasources' samples at a single timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalPoint {
    pub ts: i64,
    pub bgp: Option<f64>,
    pub probing: Option<f64>,
    pub telescope: Option<f64>,
}

impl SignalPoint {
    pub fn empty(ts: i64) -> Self {
        Self {
            ts,
            bgp: None,
            probing: None,
            telescope: None,
        }
    }

    pub fn get(&self, datasource: Datasource) -> Option<f64> {
        match datasource {
            Datasource::Bgp => self.bgp,
            Datasource::Probing => self.probing,
            Datasource::Telescope => self.telescope,
        }
    }

    pub fn set(&mut self, datasource: Datasource, value: Option<f64>) {
        match datasource {
            Datasource::Bgp => self.bgp = value,
            Datasource::Probing => self.probing = value,
            Datasource::Telescope => self.telescope = value,
        }
    }

    pub fn has_sample(&self) -> bool {
        self.bgp.is_some() || self.probing.is_some() || self.telescope.is_some()
    }
}

/// A discrete detected anomaly reported by the upstream events endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutageEvent {
    pub entity_type: EntityType,
    pub entity_code: String,
    pub datasource: Datasource,
    pub start_ts: i64,
    pub duration_seconds: i64,
    pub score: f64,
}

/// Cross-datasource alignment for dashboard serving.
///
/// The series with the most samples becomes the time-axis anchor; every other
/// datasource is resampled onto the anchor's timestamps by nearest-index
/// mapping, with out-of-range indices yielding `None`. When two input series
/// carry the same logical datasource (alias collision) the later one wins
/// wherever it has a real sample.
pub fn align_series(series: &[SignalSeries]) -> Vec<SignalPoint> {
    let Some(anchor) = series.iter().max_by_key(|s| s.values.len()) else {
        return Vec::new();
    };
    if anchor.values.is_empty() {
        return Vec::new();
    }

    let mut points: Vec<SignalPoint> = (0..anchor.values.len())
        .map(|i| SignalPoint::empty(anchor.timestamp_at(i)))
        .collect();

    for s in series {
        for point in points.iter_mut() {
            if let Some(value) = sample_at(s, point.ts) {
                point.set(s.datasource, Some(value));
            }
        }
    }

    points
}

/// Nearest-index resample of one series at an absolute timestamp.
fn sample_at(series: &SignalSeries, ts: i64) -> Option<f64> {
    if series.step_seconds <= 0 {
        return None;
    }
    let index = ((ts - series.from_epoch) as f64 / series.step_seconds as f64).round() as i64;
    if index < 0 || index as usize >= series.values.len() {
        return None;
    }
    series.values[index as usize]
}

/// Ingest-to-store merging: group by absolute timestamp across all fetched
/// datasources, one row per raw timestamp with independent nullable fields.
/// No resampling here: the persisted grain is the raw timestamp.
pub fn rows_by_timestamp(series: &[SignalSeries]) -> Vec<SignalPoint> {
    let mut rows: BTreeMap<i64, SignalPoint> = BTreeMap::new();

    for s in series {
        for (i, value) in s.values.iter().enumerate() {
            let ts = s.timestamp_at(i);
            let row = rows.entry(ts).or_insert_with(|| SignalPoint::empty(ts));
            // Later series win on alias collisions, but a missing sample never
            // erases a real one.
            if value.is_some() {
                row.set(s.datasource, *value);
            }
        }
    }

    rows.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(datasource: Datasource, from: i64, step: i64, values: Vec<Option<f64>>) -> SignalSeries {
        SignalSeries {
            entity: Entity::country("ve"),
            datasource,
            from_epoch: from,
            step_seconds: step,
            values,
        }
    }

    #[test]
    fn align_resamples_onto_longest_series() {
        // bgp: 4 samples at step 100 -> anchor
        let bgp = series(Datasource::Bgp, 1_000, 100, vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
        // probing: 2 samples at step 200, offset so nearest-index mapping applies
        let probing = series(Datasource::Probing, 1_000, 200, vec![Some(10.0), Some(20.0)]);

        let points = align_series(&[bgp, probing]);
        assert_eq!(points.len(), 4);
        assert_eq!(points[0].ts, 1_000);
        assert_eq!(points[0].bgp, Some(1.0));
        assert_eq!(points[0].probing, Some(10.0));
        // ts=1100 -> index round(100/200)=1 -> 20.0
        assert_eq!(points[1].probing, Some(20.0));
        // ts=1300 -> index round(300/200)=2 -> out of range
        assert_eq!(points[3].probing, None);
        assert_eq!(points[3].bgp, Some(4.0));
    }

    #[test]
    fn align_with_no_series_is_empty() {
        assert!(align_series(&[]).is_empty());
    }

    #[test]
    fn rows_group_by_absolute_timestamp_without_resampling() {
        let bgp = series(Datasource::Bgp, 0, 100, vec![Some(1.0), None, Some(3.0)]);
        let telescope = series(Datasource::Telescope, 50, 100, vec![Some(7.0), Some(8.0)]);

        let rows = rows_by_timestamp(&[bgp, telescope]);
        let timestamps: Vec<i64> = rows.iter().map(|r| r.ts).collect();
        assert_eq!(timestamps, vec![0, 50, 100, 150, 200]);

        assert_eq!(rows[0].bgp, Some(1.0));
        assert_eq!(rows[0].telescope, None);
        assert_eq!(rows[1].telescope, Some(7.0));
        assert_eq!(rows[2].bgp, None, "missing sample stays null");
        assert_eq!(rows[4].bgp, Some(3.0));
    }

    #[test]
    fn later_series_wins_alias_collision_without_erasing_samples() {
        let old = series(Datasource::Telescope, 0, 100, vec![Some(1.0), Some(2.0)]);
        let new = series(Datasource::Telescope, 0, 100, vec![Some(9.0), None]);

        let rows = rows_by_timestamp(&[old, new]);
        assert_eq!(rows[0].telescope, Some(9.0), "last writer wins");
        assert_eq!(rows[1].telescope, Some(2.0), "no-sample does not erase");
    }

    #[test]
    fn telescope_aliases_map_to_one_datasource() {
        assert_eq!(Datasource::from_upstream_id("ucsd-nt"), Some(Datasource::Telescope));
        assert_eq!(Datasource::from_upstream_id("merit-nt"), Some(Datasource::Telescope));
        assert_eq!(Datasource::from_upstream_id("bgp"), Some(Datasource::Bgp));
        assert_eq!(Datasource::from_upstream_id("ping-slash24"), Some(Datasource::Probing));
        assert_eq!(Datasource::from_upstream_id("gtr"), None);
    }
}
