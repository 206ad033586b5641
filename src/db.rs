use std::{str::FromStr, time::Duration};

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::info;

use crate::config::AppConfig;

pub type DbPool = PgPool;

const SCHEMA_SQL: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS signal_rows (
    entity_type TEXT NOT NULL,
    entity_code TEXT NOT NULL,
    ts BIGINT NOT NULL,
    bgp DOUBLE PRECISION,
    probing DOUBLE PRECISION,
    telescope DOUBLE PRECISION,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (entity_type, entity_code, ts)
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS region_series (
    region_code TEXT NOT NULL,
    datasource TEXT NOT NULL,
    from_epoch BIGINT NOT NULL,
    step_seconds BIGINT NOT NULL,
    samples DOUBLE PRECISION[] NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (region_code, datasource)
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS outage_events (
    entity_type TEXT NOT NULL,
    entity_code TEXT NOT NULL,
    datasource TEXT NOT NULL,
    start_ts BIGINT NOT NULL,
    duration_seconds BIGINT NOT NULL,
    score DOUBLE PRECISION NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (entity_type, entity_code, datasource, start_ts)
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS region_scores (
    region_code TEXT PRIMARY KEY,
    region_name TEXT NOT NULL,
    score DOUBLE PRECISION NOT NULL,
    severity TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#,
    r#"
CREATE INDEX IF NOT EXISTS outage_events_entity_start
    ON outage_events (entity_type, entity_code, start_ts)
"#,
];

/// Build the Postgres connection pool.
pub async fn create_pool(config: &AppConfig) -> Result<DbPool> {
    let connect_options = PgConnectOptions::from_str(&config.dsn)
        .context("invalid Postgres DSN supplied")?
        .application_name("connmon");

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(connect_options)
        .await
        .context("failed to connect to postgres")?;

    info!("connected to durable store");
    Ok(pool)
}

/// Create the tables connmon owns. Idempotent; safe on every startup.
pub async fn ensure_schema(pool: &DbPool) -> Result<()> {
    for statement in SCHEMA_SQL {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("failed to bootstrap schema")?;
    }
    Ok(())
}
