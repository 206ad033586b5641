use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use crate::classify::Severity;
use crate::db::DbPool;
use crate::reconcile::StoredRegionSeries;
use crate::series::{Datasource, Entity, OutageEvent, SignalPoint};

const UPSERT_SIGNAL_ROW_SQL: &str = r#"
INSERT INTO signal_rows (entity_type, entity_code, ts, bgp, probing, telescope, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, now())
ON CONFLICT (entity_type, entity_code, ts) DO UPDATE SET
    bgp = COALESCE(EXCLUDED.bgp, signal_rows.bgp),
    probing = COALESCE(EXCLUDED.probing, signal_rows.probing),
    telescope = COALESCE(EXCLUDED.telescope, signal_rows.telescope),
    updated_at = now()
"#;

const LOAD_SIGNAL_ROWS_SQL: &str = r#"
SELECT ts, bgp, probing, telescope
FROM signal_rows
WHERE entity_type = $1 AND entity_code = $2 AND ts >= $3 AND ts < $4
ORDER BY ts
"#;

const LATEST_UPDATED_AT_SQL: &str = r#"
SELECT max(updated_at) FROM signal_rows WHERE entity_type = $1 AND entity_code = $2
"#;

const UPSERT_EVENT_SQL: &str = r#"
INSERT INTO outage_events (entity_type, entity_code, datasource, start_ts, duration_seconds, score, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, now())
ON CONFLICT (entity_type, entity_code, datasource, start_ts) DO UPDATE SET
    duration_seconds = EXCLUDED.duration_seconds,
    score = EXCLUDED.score,
    updated_at = now()
"#;

const LOAD_EVENTS_SQL: &str = r#"
SELECT datasource, start_ts, duration_seconds, score
FROM outage_events
WHERE entity_type = $1 AND entity_code = $2 AND start_ts >= $3 AND start_ts < $4
ORDER BY start_ts
"#;

const UPSERT_REGION_SERIES_SQL: &str = r#"
INSERT INTO region_series (region_code, datasource, from_epoch, step_seconds, samples, updated_at)
VALUES ($1, $2, $3, $4, $5, now())
ON CONFLICT (region_code, datasource) DO UPDATE SET
    from_epoch = EXCLUDED.from_epoch,
    step_seconds = EXCLUDED.step_seconds,
    samples = EXCLUDED.samples,
    updated_at = now()
"#;

const LOAD_REGION_SERIES_SQL: &str = r#"
SELECT from_epoch, step_seconds, samples, updated_at
FROM region_series
WHERE region_code = $1 AND datasource = $2
"#;

const UPSERT_REGION_SCORE_SQL: &str = r#"
INSERT INTO region_scores (region_code, region_name, score, severity, updated_at)
VALUES ($1, $2, $3, $4, now())
ON CONFLICT (region_code) DO UPDATE SET
    region_name = EXCLUDED.region_name,
    score = EXCLUDED.score,
    severity = EXCLUDED.severity,
    updated_at = now()
"#;

const LOAD_REGION_SCORES_SQL: &str = r#"
SELECT region_code, region_name, score, severity
FROM region_scores
ORDER BY score DESC, region_code
"#;

/// Per-region current anomaly magnitude; overwritten on every regional sync.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutageScore {
    pub region_code: String,
    pub region_name: String,
    pub score: f64,
    pub severity: Severity,
}

/// Persist reconciled national rows. The upsert is idempotent on
/// `(entity_type, entity_code, ts)` and the COALESCE guard makes the
/// "null never overwrites" rule hold even under write-write races.
pub async fn upsert_signal_rows(
    pool: &DbPool,
    entity: &Entity,
    rows: &[SignalPoint],
) -> Result<u64> {
    let mut written = 0;
    for row in rows {
        let result = sqlx::query(UPSERT_SIGNAL_ROW_SQL)
            .bind(entity.entity_type.as_str())
            .bind(&entity.code)
            .bind(row.ts)
            .bind(row.bgp)
            .bind(row.probing)
            .bind(row.telescope)
            .execute(pool)
            .await?;
        written += result.rows_affected();
    }
    Ok(written)
}

pub async fn load_signal_rows(
    pool: &DbPool,
    entity: &Entity,
    from: i64,
    until: i64,
) -> Result<Vec<SignalPoint>> {
    let rows = sqlx::query(LOAD_SIGNAL_ROWS_SQL)
        .bind(entity.entity_type.as_str())
        .bind(&entity.code)
        .bind(from)
        .bind(until)
        .fetch_all(pool)
        .await?;

    let mut points = Vec::with_capacity(rows.len());
    for row in rows {
        points.push(SignalPoint {
            ts: row.try_get("ts")?,
            bgp: row.try_get("bgp")?,
            probing: row.try_get("probing")?,
            telescope: row.try_get("telescope")?,
        });
    }
    Ok(points)
}

/// Freshness cursor for an entity: when was any of its rows last written.
pub async fn latest_updated_at(pool: &DbPool, entity: &Entity) -> Result<Option<DateTime<Utc>>> {
    let latest: Option<DateTime<Utc>> = sqlx::query_scalar(LATEST_UPDATED_AT_SQL)
        .bind(entity.entity_type.as_str())
        .bind(&entity.code)
        .fetch_one(pool)
        .await?;
    Ok(latest)
}

/// Append-only event upsert; refetching the same window is a no-op apart from
/// refreshed duration/score.
pub async fn upsert_events(pool: &DbPool, events: &[OutageEvent]) -> Result<u64> {
    let mut written = 0;
    for event in events {
        let result = sqlx::query(UPSERT_EVENT_SQL)
            .bind(event.entity_type.as_str())
            .bind(&event.entity_code)
            .bind(event.datasource.as_str())
            .bind(event.start_ts)
            .bind(event.duration_seconds)
            .bind(event.score)
            .execute(pool)
            .await?;
        written += result.rows_affected();
    }
    Ok(written)
}

pub async fn load_events(
    pool: &DbPool,
    entity: &Entity,
    from: i64,
    until: i64,
) -> Result<Vec<OutageEvent>> {
    let rows = sqlx::query(LOAD_EVENTS_SQL)
        .bind(entity.entity_type.as_str())
        .bind(&entity.code)
        .bind(from)
        .bind(until)
        .fetch_all(pool)
        .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let datasource: String = row.try_get("datasource")?;
        // Rows written by older deployments keep their stored label; anything
        // unrecognized is skipped rather than invented.
        let Some(datasource) = Datasource::parse(&datasource) else {
            continue;
        };
        events.push(OutageEvent {
            entity_type: entity.entity_type,
            entity_code: entity.code.clone(),
            datasource,
            start_ts: row.try_get("start_ts")?,
            duration_seconds: row.try_get("duration_seconds")?,
            score: row.try_get("score")?,
        });
    }
    Ok(events)
}

pub async fn upsert_region_series(
    pool: &DbPool,
    region_code: &str,
    datasource: Datasource,
    series: &StoredRegionSeries,
) -> Result<()> {
    sqlx::query(UPSERT_REGION_SERIES_SQL)
        .bind(region_code)
        .bind(datasource.as_str())
        .bind(series.from_epoch)
        .bind(series.step_seconds)
        .bind(&series.values)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn load_region_series(
    pool: &DbPool,
    region_code: &str,
    datasource: Datasource,
) -> Result<Option<(StoredRegionSeries, DateTime<Utc>)>> {
    let row = sqlx::query(LOAD_REGION_SERIES_SQL)
        .bind(region_code)
        .bind(datasource.as_str())
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let series = StoredRegionSeries {
        from_epoch: row.try_get("from_epoch")?,
        step_seconds: row.try_get("step_seconds")?,
        values: row.try_get("samples")?,
    };
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(Some((series, updated_at)))
}

/// Overwrite the per-region score list with this sync's results. Regions
/// absent from `scores` (their summary fetch failed) keep their previous row.
pub async fn replace_region_scores(pool: &DbPool, scores: &[OutageScore]) -> Result<()> {
    for score in scores {
        sqlx::query(UPSERT_REGION_SCORE_SQL)
            .bind(&score.region_code)
            .bind(&score.region_name)
            .bind(score.score)
            .bind(score.severity.as_str())
            .execute(pool)
            .await?;
    }
    Ok(())
}

pub async fn load_region_scores(pool: &DbPool) -> Result<Vec<OutageScore>> {
    let rows = sqlx::query(LOAD_REGION_SCORES_SQL).fetch_all(pool).await?;

    let mut scores = Vec::with_capacity(rows.len());
    for row in rows {
        let score: f64 = row.try_get("score")?;
        scores.push(OutageScore {
            region_code: row.try_get("region_code")?,
            region_name: row.try_get("region_name")?,
            score,
            // Severity is always re-derived from the score; the stored label
            // is a denormalized convenience for SQL consumers.
            severity: crate::classify::classify(score),
        });
    }
    Ok(scores)
}
