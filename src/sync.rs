use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior, sleep};
use tracing::{error, info, instrument, warn};

use crate::app::AppContext;
use crate::classify::classify;
use crate::limiter::run_limited;
use crate::reconcile::{reconcile_region_series, reconcile_rows};
use crate::series::{Datasource, Entity, OutageEvent, SignalPoint, rows_by_timestamp};
use crate::store::{self, OutageScore};

pub const NATIONAL_LOOP: &str = "national";
pub const REGIONAL_LOOP: &str = "regional";

type LoopFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type LoopFn = fn(AppContext) -> LoopFuture;

/// Result of one fetch+merge+upsert cycle for a single entity window.
#[derive(Debug)]
pub struct SyncOutcome {
    /// The reconciled rows, as persisted; callers may serve these directly
    /// instead of re-reading the store.
    pub rows: Vec<SignalPoint>,
    pub events: Vec<OutageEvent>,
    pub rows_upserted: u64,
    pub events_upserted: u64,
    /// False when every fetcher came back empty (upstream unreachable or
    /// returning garbage for the whole window).
    pub fetched_any: bool,
}

/// Result of one regional batch cycle.
#[derive(Debug)]
pub struct RegionalOutcome {
    pub series_updated: u64,
    pub scores_written: usize,
}

/// Outcome of a chunked historical backfill.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillSummary {
    pub from: i64,
    pub until: i64,
    pub chunks: usize,
    pub rows_upserted: u64,
    pub events_upserted: u64,
    /// One entry per failed chunk, tagged with the chunk's own time range.
    pub errors: Vec<String>,
}

/// Has the stored dataset outlived the refresh interval?
pub fn needs_refresh(
    latest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    refresh_interval: Duration,
) -> bool {
    let Some(latest) = latest else {
        return true;
    };
    let interval = chrono::Duration::from_std(refresh_interval)
        .unwrap_or_else(|_| chrono::Duration::hours(24));
    now.signed_duration_since(latest) > interval
}

/// Partition `[from, until)` into fixed-size chunks. The final chunk is
/// truncated so its `until` equals the requested `until`; coverage is
/// complete with no gaps and no overlaps.
pub fn chunk_range(from: i64, until: i64, chunk_seconds: i64) -> Vec<(i64, i64)> {
    let chunk_seconds = chunk_seconds.max(1);
    let mut chunks = Vec::new();
    let mut start = from;
    while start < until {
        let end = (start + chunk_seconds).min(until);
        chunks.push((start, end));
        start = end;
    }
    chunks
}

/// One fetch+merge+upsert cycle for an entity over `[from, until)`.
///
/// A datasource that comes back empty leaves its column untouched for the
/// whole window: reconciliation keeps whatever history exists.
#[instrument(skip_all, fields(entity = %entity.code, from = from, until = until))]
pub async fn sync_signal_window(
    ctx: &AppContext,
    entity: &Entity,
    from: i64,
    until: i64,
) -> Result<SyncOutcome> {
    let (series, events) = fetch_window(ctx, entity, from, until).await;
    let fetched_any = !series.is_empty() || !events.is_empty();

    // One row per raw timestamp; rows with no sample at all carry no
    // information and are not persisted.
    let fresh: Vec<SignalPoint> = rows_by_timestamp(&series)
        .into_iter()
        .filter(SignalPoint::has_sample)
        .collect();

    let previous = store::load_signal_rows(&ctx.pool, entity, from, until).await?;
    let rows = reconcile_rows(fresh, &previous);

    let rows_upserted = store::upsert_signal_rows(&ctx.pool, entity, &rows).await?;
    ctx.metrics.add_rows_upserted("signal_rows", rows_upserted);

    let events_upserted = store::upsert_events(&ctx.pool, &events).await?;
    ctx.metrics.add_rows_upserted("outage_events", events_upserted);

    info!(
        series = series.len(),
        rows = rows.len(),
        events = events.len(),
        "signal window synced"
    );

    Ok(SyncOutcome {
        rows,
        events,
        rows_upserted,
        events_upserted,
        fetched_any,
    })
}

/// Fetch every datasource's series plus the events for one entity window.
///
/// Datasources are fetched strictly sequentially with the configured
/// inter-call pause (the upstream rate-limits aggressively per client), so
/// this path is deliberately not concurrency-limited. Datasources that come
/// back empty are simply absent from the result.
pub async fn fetch_window(
    ctx: &AppContext,
    entity: &Entity,
    from: i64,
    until: i64,
) -> (Vec<crate::series::SignalSeries>, Vec<OutageEvent>) {
    let pacing = ctx.config.sync.datasource_delay;

    let mut series = Vec::with_capacity(Datasource::ALL.len());
    for (i, datasource) in Datasource::ALL.into_iter().enumerate() {
        if i > 0 {
            sleep(pacing).await;
        }
        match ctx
            .upstream
            .fetch_signals(entity, datasource, from, until)
            .await
        {
            Some(fetched) => series.push(fetched),
            None => ctx.metrics.inc_fetch_empty(datasource),
        }
    }

    sleep(pacing).await;
    let events = ctx.upstream.fetch_events(entity, from, until).await;

    (series, events)
}

/// Batch cycle for all configured regions: per-region series for every
/// datasource plus the per-region outage scores, both through the bounded
/// worker pool.
#[instrument(skip_all, fields(from = from, until = until))]
pub async fn sync_regions(ctx: &AppContext, from: i64, until: i64) -> Result<RegionalOutcome> {
    let limit = ctx.config.sync.fetch_concurrency;

    let pairs: Vec<(String, Datasource)> = ctx
        .config
        .regions
        .iter()
        .flat_map(|region| {
            Datasource::ALL
                .into_iter()
                .map(move |datasource| (region.code.clone(), datasource))
        })
        .collect();

    // The unit of work maps every failure to None so the batch always settles.
    let updates = run_limited(pairs, limit, |(region_code, datasource)| {
        let ctx = ctx.clone();
        async move { sync_region_series(&ctx, &region_code, datasource, from, until).await }
    })
    .await;
    let series_updated = updates.iter().filter(|update| update.is_some()).count() as u64;

    let regions = ctx.config.regions.clone();
    let fetched = run_limited(regions, limit, |region| {
        let ctx = ctx.clone();
        async move {
            let entity = Entity::region(region.code.clone());
            let score = ctx.upstream.fetch_outage_summary(&entity, from, until).await;
            (region, score)
        }
    })
    .await;

    // Regions whose summary fetch failed keep their previous stored score.
    let scores: Vec<OutageScore> = fetched
        .into_iter()
        .filter_map(|(region, score)| {
            let score = score?;
            Some(OutageScore {
                region_code: region.code,
                region_name: region.name,
                score,
                severity: classify(score),
            })
        })
        .collect();

    store::replace_region_scores(&ctx.pool, &scores).await?;
    ctx.metrics
        .add_rows_upserted("region_scores", scores.len() as u64);

    info!(
        series_updated,
        scores = scores.len(),
        "regional batch synced"
    );

    Ok(RegionalOutcome {
        series_updated,
        scores_written: scores.len(),
    })
}

/// Fetch, reconcile, and persist one `(region, datasource)` series. Returns
/// the merged series on success; every failure path is caught here and maps
/// to `None`.
pub async fn sync_region_series(
    ctx: &AppContext,
    region_code: &str,
    datasource: Datasource,
    from: i64,
    until: i64,
) -> Option<crate::reconcile::StoredRegionSeries> {
    let entity = Entity::region(region_code);
    let Some(fresh) = ctx
        .upstream
        .fetch_signals(&entity, datasource, from, until)
        .await
    else {
        ctx.metrics.inc_fetch_empty(datasource);
        return None;
    };

    let previous = match store::load_region_series(&ctx.pool, region_code, datasource).await {
        Ok(row) => row,
        Err(err) => {
            warn!(region = region_code, datasource = datasource.as_str(), error = ?err,
                "failed loading stored region series; skipping");
            return None;
        }
    };

    let merged = reconcile_region_series(&fresh, previous.as_ref().map(|(series, _)| series));

    match store::upsert_region_series(&ctx.pool, region_code, datasource, &merged).await {
        Ok(()) => {
            ctx.metrics.add_rows_upserted("region_series", 1);
            Some(merged)
        }
        Err(err) => {
            warn!(region = region_code, datasource = datasource.as_str(), error = ?err,
                "failed persisting region series");
            None
        }
    }
}

/// Best-effort historical catch-up: chunks are processed strictly
/// sequentially, a failed chunk is recorded and skipped, and the pacing pause
/// runs after every chunk regardless of outcome.
#[instrument(skip_all, fields(entity = %entity.code, from = from, until = until))]
pub async fn backfill(ctx: &AppContext, entity: &Entity, from: i64, until: i64) -> BackfillSummary {
    let chunk_seconds = ctx.config.sync.backfill_chunk.as_secs() as i64;
    let chunks = chunk_range(from, until, chunk_seconds);

    let mut summary = BackfillSummary {
        from,
        until,
        chunks: chunks.len(),
        rows_upserted: 0,
        events_upserted: 0,
        errors: Vec::new(),
    };

    let total = chunks.len();
    for (i, (chunk_from, chunk_until)) in chunks.into_iter().enumerate() {
        match sync_signal_window(ctx, entity, chunk_from, chunk_until).await {
            Ok(outcome) => {
                summary.rows_upserted += outcome.rows_upserted;
                summary.events_upserted += outcome.events_upserted;
                ctx.metrics.inc_backfill_chunk(true);
            }
            Err(err) => {
                warn!(chunk_from, chunk_until, error = ?err, "backfill chunk failed");
                summary
                    .errors
                    .push(format!("chunk [{chunk_from}, {chunk_until}): {err:#}"));
                ctx.metrics.inc_backfill_chunk(false);
            }
        }

        if i + 1 < total {
            sleep(ctx.config.sync.chunk_pause).await;
        }
    }

    info!(
        chunks = summary.chunks,
        rows = summary.rows_upserted,
        failed = summary.errors.len(),
        "backfill finished"
    );
    summary
}

/// Spawn the background sync loops and return their join handles.
pub fn spawn_all(ctx: AppContext) -> Vec<JoinHandle<()>> {
    let sync = ctx.config.sync.clone();

    vec![
        spawn_loop(
            ctx.clone(),
            NATIONAL_LOOP,
            sync.national_interval,
            Duration::from_secs(120),
            national_cycle,
        ),
        spawn_loop(
            ctx,
            REGIONAL_LOOP,
            sync.regional_interval,
            Duration::from_secs(300),
            regional_cycle,
        ),
    ]
}

fn spawn_loop(
    ctx: AppContext,
    loop_name: &'static str,
    interval: Duration,
    budget: Duration,
    sync_fn: LoopFn,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            loop_name,
            interval = ?interval,
            budget = ?budget,
            "starting sync loop"
        );

        // tokio::time::interval() completes the first tick immediately, so
        // both loops run once on startup before settling into their cadence.
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(err) = run_once(ctx.clone(), loop_name, budget, sync_fn).await {
                error!(loop_name, error = ?err, "sync loop iteration failed");
            }
        }
    })
}

async fn run_once(
    ctx: AppContext,
    loop_name: &'static str,
    budget: Duration,
    sync_fn: LoopFn,
) -> Result<()> {
    let start = Instant::now();
    match sync_fn(ctx.clone()).await {
        Ok(_) => {
            let elapsed = start.elapsed();
            ctx.metrics.observe_duration(loop_name, elapsed);
            if elapsed > budget {
                warn!(loop_name, elapsed = ?elapsed, budget = ?budget, "loop exceeded budget");
            } else {
                info!(loop_name, elapsed = ?elapsed, "loop completed");
            }
            ctx.metrics.record_success(loop_name, true);
            ctx.state.record_loop_success(loop_name).await;
            Ok(())
        }
        Err(err) => {
            ctx.metrics.record_success(loop_name, false);
            ctx.metrics.inc_error(loop_name);
            ctx.state
                .record_loop_failure(loop_name, err.to_string())
                .await;
            Err(err)
        }
    }
}

fn national_cycle(ctx: AppContext) -> LoopFuture {
    Box::pin(async move {
        let until = Utc::now().timestamp();
        let from = until - ctx.config.sync.latest_window.as_secs() as i64;
        ctx.metrics.inc_refresh("scheduled");
        sync_signal_window(&ctx, &ctx.country_entity(), from, until)
            .await
            .map(|_| ())
    })
}

fn regional_cycle(ctx: AppContext) -> LoopFuture {
    Box::pin(async move {
        let until = Utc::now().timestamp();
        let from = until - ctx.config.sync.latest_window.as_secs() as i64;
        ctx.metrics.inc_refresh("scheduled");
        sync_regions(&ctx, from, until).await.map(|_| ())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_gate_uses_refresh_interval() {
        let now = Utc::now();
        let interval = Duration::from_secs(24 * 3600);

        let fresh = now - chrono::Duration::hours(23);
        assert!(!needs_refresh(Some(fresh), now, interval));

        let stale = now - chrono::Duration::hours(25);
        assert!(needs_refresh(Some(stale), now, interval));

        assert!(needs_refresh(None, now, interval), "no rows means refresh");
    }
}
