use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::series::Datasource;

/// Metrics registry for the service, scraped by Prometheus.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Arc<Registry>,
    loops: LoopMetrics,
    pipeline: PipelineMetrics,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("connmon".into()), None)?);

        let loops = LoopMetrics::register(&registry)?;
        let pipeline = PipelineMetrics::register(&registry)?;

        Ok(Self {
            registry,
            loops,
            pipeline,
        })
    }

    /// Observe the execution duration for a sync loop.
    pub fn observe_duration(&self, loop_name: &str, duration: Duration) {
        self.loops
            .sync_duration
            .with_label_values(&[loop_name])
            .observe(duration.as_secs_f64());
    }

    /// Record a success flag for a loop iteration (1=success, 0=failed).
    pub fn record_success(&self, loop_name: &str, success: bool) {
        self.loops
            .last_success
            .with_label_values(&[loop_name])
            .set(if success { 1 } else { 0 });
    }

    /// Increment the error counter for a loop.
    pub fn inc_error(&self, loop_name: &str) {
        self.loops
            .errors_total
            .with_label_values(&[loop_name])
            .inc();
    }

    /// Count a fetch that came back empty (transport failure, error page,
    /// malformed payload, or genuinely no data).
    pub fn inc_fetch_empty(&self, datasource: Datasource) {
        self.pipeline
            .fetch_empty_total
            .with_label_values(&[datasource.as_str()])
            .inc();
    }

    pub fn add_rows_upserted(&self, table: &str, count: u64) {
        self.pipeline
            .rows_upserted_total
            .with_label_values(&[table])
            .inc_by(count);
    }

    pub fn inc_backfill_chunk(&self, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.pipeline
            .backfill_chunks_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Count one refresh cycle by what triggered it.
    pub fn inc_refresh(&self, trigger: &str) {
        self.pipeline
            .refresh_cycles_total
            .with_label_values(&[trigger])
            .inc();
    }

    /// Encode metrics into Prometheus exposition format.
    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct LoopMetrics {
    sync_duration: HistogramVec,
    last_success: IntGaugeVec,
    errors_total: IntCounterVec,
}

impl LoopMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let sync_duration = HistogramVec::new(
            HistogramOpts::new("sync_duration_seconds", "Sync loop execution duration"),
            &["loop"],
        )?;
        registry.register(Box::new(sync_duration.clone()))?;

        let last_success = IntGaugeVec::new(
            Opts::new(
                "last_sync_success",
                "Loop success flag (1=success, 0=failure)",
            ),
            &["loop"],
        )?;
        registry.register(Box::new(last_success.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Total sync loop errors"),
            &["loop"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            sync_duration,
            last_success,
            errors_total,
        })
    }
}

#[derive(Clone)]
struct PipelineMetrics {
    fetch_empty_total: IntCounterVec,
    rows_upserted_total: IntCounterVec,
    backfill_chunks_total: IntCounterVec,
    refresh_cycles_total: IntCounterVec,
}

impl PipelineMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let fetch_empty_total = IntCounterVec::new(
            Opts::new(
                "fetch_empty_total",
                "Upstream fetches that returned no usable data",
            ),
            &["datasource"],
        )?;
        registry.register(Box::new(fetch_empty_total.clone()))?;

        let rows_upserted_total = IntCounterVec::new(
            Opts::new("rows_upserted_total", "Rows written to the durable store"),
            &["table"],
        )?;
        registry.register(Box::new(rows_upserted_total.clone()))?;

        let backfill_chunks_total = IntCounterVec::new(
            Opts::new(
                "backfill_chunks_total",
                "Backfill chunks processed grouped by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(backfill_chunks_total.clone()))?;

        let refresh_cycles_total = IntCounterVec::new(
            Opts::new(
                "refresh_cycles_total",
                "Fetch+merge+upsert cycles grouped by trigger",
            ),
            &["trigger"],
        )?;
        registry.register(Box::new(refresh_cycles_total.clone()))?;

        Ok(Self {
            fetch_empty_total,
            rows_upserted_total,
            backfill_chunks_total,
            refresh_cycles_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_appear_in_exposition_output() {
        let metrics = AppMetrics::new().expect("metrics");
        metrics.inc_fetch_empty(Datasource::Telescope);
        metrics.add_rows_upserted("signal_rows", 12);
        metrics.inc_backfill_chunk(true);
        metrics.inc_backfill_chunk(false);

        let output = metrics.encode().expect("encode");
        assert!(
            output.contains("connmon_fetch_empty_total{datasource=\"telescope\"} 1"),
            "fetch counter missing: {output}"
        );
        assert!(
            output.contains("connmon_rows_upserted_total{table=\"signal_rows\"} 12"),
            "rows counter missing: {output}"
        );
        assert!(output.contains("connmon_backfill_chunks_total{outcome=\"ok\"} 1"));
        assert!(output.contains("connmon_backfill_chunks_total{outcome=\"error\"} 1"));
    }
}
