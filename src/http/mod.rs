use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::app::AppContext;
use crate::cache::PayloadCache;
use crate::classify::{ConnectivityStatus, derive_status};
use crate::series::{Datasource, Entity, EntityType, OutageEvent, SignalPoint, align_series};
use crate::store::{self, OutageScore};
use crate::sync::{self, NATIONAL_LOOP, REGIONAL_LOOP};

/// Cache directive for on-demand (recent) windows.
const LIVE_CACHE_CONTROL: &str = "public, max-age=300";

/// Cache directive for archived windows that change at most once a day.
const ARCHIVE_CACHE_CONTROL: &str = "public, max-age=86400, stale-while-revalidate=604800";

const LOOP_NAMES: &[&str] = &[NATIONAL_LOOP, REGIONAL_LOOP];

/// Normalized payload served to the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityPayload {
    pub signals: Vec<SignalPoint>,
    pub events: Vec<OutageEvent>,
    pub status: ConnectivityStatus,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub fetched_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl ConnectivityPayload {
    fn failure(now: DateTime<Utc>, error: String) -> Self {
        Self {
            signals: Vec::new(),
            events: Vec::new(),
            status: ConnectivityStatus::NoData,
            fetched_at: now,
            error: Some(error),
        }
    }
}

/// One region's stored series for one datasource.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionSeriesPayload {
    pub region: String,
    pub datasource: Datasource,
    pub from_epoch: i64,
    pub step_seconds: i64,
    pub values: Vec<Option<f64>>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub fetched_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncResponse {
    rows_upserted: u64,
    events_upserted: u64,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Clone)]
struct ServeState {
    ctx: AppContext,
    cache: PayloadCache<ConnectivityPayload>,
}

pub fn create_router(ctx: AppContext, cache: PayloadCache<ConnectivityPayload>) -> Router {
    let api = Router::new()
        .route("/signals", get(get_signals))
        .route("/regional", get(get_regional));

    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(ServeState { ctx, cache })
}

async fn get_healthz(State(state): State<ServeState>) -> StatusCode {
    let sync = &state.ctx.config.sync;
    // A loop is allowed to miss one tick before readiness flips.
    let max_staleness = 2 * sync.national_interval.max(sync.regional_interval);
    if state.ctx.state.is_ready(LOOP_NAMES, max_staleness).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn get_metrics(State(state): State<ServeState>) -> Response {
    match state.ctx.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignalsQuery {
    #[serde(default)]
    force: Option<bool>,
    #[serde(default)]
    backfill: Option<bool>,
    entity_type: Option<String>,
    entity_code: Option<String>,
    from: Option<i64>,
    until: Option<i64>,
    token: Option<String>,
}

/// The national endpoint family: forced latest-window sync, chunked historical
/// backfill (both token-gated), and the default staleness-gated read.
async fn get_signals(
    State(state): State<ServeState>,
    Query(query): Query<SignalsQuery>,
    headers: HeaderMap,
) -> Response {
    let ctx = &state.ctx;
    let force = query.force.unwrap_or(false);
    let backfill = query.backfill.unwrap_or(false);

    if (force || backfill) && !authorized(ctx, query.token.as_deref(), &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "invalid or missing sync token".into(),
            }),
        )
            .into_response();
    }

    if force {
        return run_forced_sync(ctx).await;
    }

    if backfill {
        let Some(from) = query.from else {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "backfill requires a `from` epoch".into(),
                }),
            )
                .into_response();
        };
        let until = query.until.unwrap_or_else(|| Utc::now().timestamp());
        ctx.metrics.inc_refresh("backfill");
        let summary = sync::backfill(ctx, &ctx.country_entity(), from, until).await;
        return Json(summary).into_response();
    }

    let entity = match resolve_entity(ctx, query.entity_type.as_deref(), query.entity_code.as_deref())
    {
        Ok(entity) => entity,
        Err(response) => return response,
    };

    let now = Utc::now();
    let until = query.until.unwrap_or_else(|| now.timestamp());
    let from = query
        .from
        .unwrap_or(until - ctx.config.sync.latest_window.as_secs() as i64);

    let payload = serve_window(&state, &entity, from, until, now).await;
    (
        [(header::CACHE_CONTROL, cache_control_for(until, now.timestamp()))],
        Json(payload),
    )
        .into_response()
}

async fn run_forced_sync(ctx: &AppContext) -> Response {
    let until = Utc::now().timestamp();
    let from = until - ctx.config.sync.latest_window.as_secs() as i64;
    ctx.metrics.inc_refresh("forced");

    let response = match sync::sync_signal_window(ctx, &ctx.country_entity(), from, until).await {
        Ok(outcome) => SyncResponse {
            rows_upserted: outcome.rows_upserted,
            events_upserted: outcome.events_upserted,
            error: (!outcome.fetched_any)
                .then(|| "all datasource fetches returned empty".to_string()),
        },
        // Persistence failures are reported, not hidden behind a 5xx: the
        // sync may still have written some rows before failing.
        Err(err) => SyncResponse {
            rows_upserted: 0,
            events_upserted: 0,
            error: Some(format!("{err:#}")),
        },
    };

    Json(response).into_response()
}

fn resolve_entity(
    ctx: &AppContext,
    entity_type: Option<&str>,
    entity_code: Option<&str>,
) -> Result<Entity, Response> {
    let entity_type = match entity_type {
        None => EntityType::Country,
        Some(raw) => EntityType::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: format!("unknown entity_type `{raw}`"),
                }),
            )
                .into_response()
        })?,
    };
    let code = entity_code
        .map(str::to_string)
        .unwrap_or_else(|| ctx.config.country.code.clone());
    Ok(Entity { entity_type, code })
}

/// Staleness-gated serve for one entity window.
///
/// FRESH: serve from store. STALE + refresh ok: serve the merge result
/// directly. STALE + refresh failed with history: serve stale rows with a
/// soft error marker. STALE + refresh failed without history: empty dataset
/// plus an explicit error, distinguishable from "legitimately empty".
async fn serve_window(
    state: &ServeState,
    entity: &Entity,
    from: i64,
    until: i64,
    now: DateTime<Utc>,
) -> ConnectivityPayload {
    let ctx = &state.ctx;
    let cache_key = format!(
        "{}:{}:{}:{}",
        entity.entity_type.as_str(),
        entity.code,
        from,
        until
    );

    let loaded = load_stored_window(ctx, entity, from, until).await;
    let (mut signals, mut events, freshness) = match loaded {
        Ok(parts) => parts,
        Err(err) => {
            warn!(entity = %entity.code, error = ?err, "failed loading stored window");
            if let Some(mut cached) = state.cache.get(&cache_key).await {
                cached.error = Some("durable store unavailable; serving cached data".into());
                return cached;
            }
            return serve_live(state, entity, from, until, now, &cache_key).await;
        }
    };

    let mut error = None;
    let mut fetched_at = freshness.unwrap_or(now);

    // A window with no rows at all (e.g. a never-backfilled historical
    // range) is refreshed on demand even when the entity itself is fresh.
    if signals.is_empty() || sync::needs_refresh(freshness, now, ctx.config.sync.refresh_interval) {
        ctx.metrics.inc_refresh("stale-read");
        match sync::sync_signal_window(ctx, entity, from, until).await {
            Ok(outcome) if outcome.fetched_any => {
                // Serve the merge result directly instead of re-reading rows.
                signals = outcome.rows;
                if let Ok(refreshed) = store::load_events(&ctx.pool, entity, from, until).await {
                    events = refreshed;
                }
                fetched_at = now;
            }
            Ok(_) => {
                error = Some(if signals.is_empty() {
                    "refresh failed and no stored history exists".to_string()
                } else {
                    "upstream refresh failed; serving stale data".to_string()
                });
            }
            Err(err) => {
                error = Some(format!("refresh failed: {err:#}"));
            }
        }
    }

    let status = derive_status(&signals, &events, now);
    let payload = ConnectivityPayload {
        signals,
        events,
        status,
        fetched_at,
        error,
    };
    if payload.error.is_none() {
        state.cache.put(cache_key, payload.clone()).await;
    }
    payload
}

/// Last resort when both the durable store and the fallback cache are out:
/// fetch the window live and serve the anchor-aligned merge directly,
/// bypassing persistence. The dashboard keeps working through a store outage
/// as long as the upstream answers.
async fn serve_live(
    state: &ServeState,
    entity: &Entity,
    from: i64,
    until: i64,
    now: DateTime<Utc>,
    cache_key: &str,
) -> ConnectivityPayload {
    let ctx = &state.ctx;
    ctx.metrics.inc_refresh("live-fallback");
    let (series, events) = sync::fetch_window(ctx, entity, from, until).await;
    if series.is_empty() && events.is_empty() {
        return ConnectivityPayload::failure(
            now,
            "durable store unavailable and upstream refresh failed".into(),
        );
    }

    let signals = align_series(&series);
    let status = derive_status(&signals, &events, now);
    let payload = ConnectivityPayload {
        signals,
        events,
        status,
        fetched_at: now,
        error: Some("durable store unavailable; serving live upstream data".into()),
    };
    state.cache.put(cache_key.to_string(), payload.clone()).await;
    payload
}

async fn load_stored_window(
    ctx: &AppContext,
    entity: &Entity,
    from: i64,
    until: i64,
) -> anyhow::Result<(Vec<SignalPoint>, Vec<OutageEvent>, Option<DateTime<Utc>>)> {
    let signals = store::load_signal_rows(&ctx.pool, entity, from, until).await?;
    let events = store::load_events(&ctx.pool, entity, from, until).await?;
    let freshness = store::latest_updated_at(&ctx.pool, entity).await?;
    Ok((signals, events, freshness))
}

#[derive(Debug, Deserialize)]
struct RegionalQuery {
    #[serde(default)]
    outages: Option<bool>,
    datasource: Option<String>,
    region: Option<String>,
    from: Option<i64>,
    until: Option<i64>,
}

/// Regional variant: either the per-region score list (`outages=true`) or one
/// region's series for a selected datasource.
async fn get_regional(
    State(state): State<ServeState>,
    Query(query): Query<RegionalQuery>,
) -> Response {
    let ctx = &state.ctx;
    let now = Utc::now();

    if query.outages.unwrap_or(false) {
        return match store::load_region_scores(&ctx.pool).await {
            Ok(scores) => region_scores_response(scores),
            Err(err) => {
                warn!(error = ?err, "failed loading region scores");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: format!("failed loading region scores: {err:#}"),
                    }),
                )
                    .into_response()
            }
        };
    }

    let Some(region_code) = query.region else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "regional reads require a `region` code".into(),
            }),
        )
            .into_response();
    };
    if !ctx.config.regions.iter().any(|r| r.code == region_code) {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("unknown region `{region_code}`"),
            }),
        )
            .into_response();
    }

    let datasource = match query.datasource.as_deref() {
        None => Datasource::Bgp,
        Some(raw) => match Datasource::parse(raw) {
            Some(datasource) => datasource,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorBody {
                        error: format!("unknown datasource `{raw}`"),
                    }),
                )
                    .into_response();
            }
        },
    };

    let until = query.until.unwrap_or_else(|| now.timestamp());
    let from = query
        .from
        .unwrap_or(until - ctx.config.sync.latest_window.as_secs() as i64);

    let payload = serve_region_series(ctx, &region_code, datasource, from, until, now).await;
    (
        [(header::CACHE_CONTROL, cache_control_for(until, now.timestamp()))],
        Json(payload),
    )
        .into_response()
}

fn region_scores_response(scores: Vec<OutageScore>) -> Response {
    (
        [(header::CACHE_CONTROL, LIVE_CACHE_CONTROL)],
        Json(scores),
    )
        .into_response()
}

/// Same staleness state machine as the national read, on the region grain.
async fn serve_region_series(
    ctx: &AppContext,
    region_code: &str,
    datasource: Datasource,
    from: i64,
    until: i64,
    now: DateTime<Utc>,
) -> RegionSeriesPayload {
    let stored = match store::load_region_series(&ctx.pool, region_code, datasource).await {
        Ok(stored) => stored,
        Err(err) => {
            warn!(region = region_code, error = ?err, "failed loading stored region series");
            return RegionSeriesPayload {
                region: region_code.to_string(),
                datasource,
                from_epoch: 0,
                step_seconds: 0,
                values: Vec::new(),
                fetched_at: now,
                error: Some(format!("failed loading stored data: {err:#}")),
            };
        }
    };

    let freshness = stored.as_ref().map(|(_, updated_at)| *updated_at);
    if !sync::needs_refresh(freshness, now, ctx.config.sync.refresh_interval) {
        // Freshness guarantees the row exists.
        if let Some((series, updated_at)) = &stored {
            return RegionSeriesPayload {
                region: region_code.to_string(),
                datasource,
                from_epoch: series.from_epoch,
                step_seconds: series.step_seconds,
                values: series.values.clone(),
                fetched_at: *updated_at,
                error: None,
            };
        }
    }

    ctx.metrics.inc_refresh("stale-read");
    match sync::sync_region_series(ctx, region_code, datasource, from, until).await {
        Some(merged) => RegionSeriesPayload {
            region: region_code.to_string(),
            datasource,
            from_epoch: merged.from_epoch,
            step_seconds: merged.step_seconds,
            values: merged.values,
            fetched_at: now,
            error: None,
        },
        None => match stored {
            Some((series, updated_at)) => RegionSeriesPayload {
                region: region_code.to_string(),
                datasource,
                from_epoch: series.from_epoch,
                step_seconds: series.step_seconds,
                values: series.values,
                fetched_at: updated_at,
                error: Some("upstream refresh failed; serving stale data".into()),
            },
            None => RegionSeriesPayload {
                region: region_code.to_string(),
                datasource,
                from_epoch: 0,
                step_seconds: 0,
                values: Vec::new(),
                fetched_at: now,
                error: Some("refresh failed and no stored history exists".into()),
            },
        },
    }
}

fn authorized(ctx: &AppContext, token: Option<&str>, headers: &HeaderMap) -> bool {
    let expected = ctx.config.sync_token.as_str();
    if expected.is_empty() {
        return false;
    }
    let header_token = headers.get("x-sync-token").and_then(|v| v.to_str().ok());
    token == Some(expected) || header_token == Some(expected)
}

/// Windows fully archived (ending more than a day ago) change at most once a
/// day and get the long directive; everything else is on-demand data.
fn cache_control_for(until: i64, now: i64) -> &'static str {
    if until <= now - 86_400 {
        ARCHIVE_CACHE_CONTROL
    } else {
        LIVE_CACHE_CONTROL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archived_windows_get_long_lived_cache_directive() {
        let now = 1_700_000_000;
        assert_eq!(cache_control_for(now, now), LIVE_CACHE_CONTROL);
        assert_eq!(cache_control_for(now - 3_600, now), LIVE_CACHE_CONTROL);
        assert_eq!(
            cache_control_for(now - 86_401, now),
            ARCHIVE_CACHE_CONTROL
        );
    }
}
