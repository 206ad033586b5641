use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::config::UpstreamConfig;
use crate::series::{Datasource, Entity, OutageEvent, SignalSeries};

const USER_AGENT: &str = concat!("connmon/", env!("CARGO_PKG_VERSION"));

/// Client for the external measurement service.
///
/// Every fetch path degrades to an empty result on failure (transport
/// errors, non-2xx statuses, HTML error pages, malformed JSON) so callers
/// can always proceed with partial data. Failures never propagate as errors;
/// they are logged and swallowed here.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build upstream HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch one datasource's raw series for an entity over `[from, until)`.
    ///
    /// Returns `None` on any failure, and also when the response simply
    /// carries no series for the requested datasource. When the response
    /// contains the same logical datasource under both its old and new
    /// upstream ids, the last one wins.
    pub async fn fetch_signals(
        &self,
        entity: &Entity,
        datasource: Datasource,
        from: i64,
        until: i64,
    ) -> Option<SignalSeries> {
        let url = format!(
            "{}/signals/raw/{}/{}?from={}&until={}&datasource={}",
            self.base_url,
            entity.entity_type.as_str(),
            entity.code,
            from,
            until,
            datasource.upstream_id(),
        );

        let envelope: SignalEnvelope = self.get_json(&url, "signals").await?;

        let mut matched: Option<SignalSeries> = None;
        for raw in envelope.data.into_iter().flatten() {
            let Some(decoded) = Datasource::from_upstream_id(&raw.datasource) else {
                warn!(datasource = %raw.datasource, "upstream returned unknown datasource; skipping");
                continue;
            };
            if decoded != datasource {
                continue;
            }
            matched = Some(SignalSeries {
                entity: entity.clone(),
                datasource: decoded,
                from_epoch: raw.from,
                step_seconds: raw.step,
                values: raw.values,
            });
        }
        matched
    }

    /// Fetch discrete anomaly events for an entity over `[from, until)`.
    /// Failures map to an empty list.
    pub async fn fetch_events(&self, entity: &Entity, from: i64, until: i64) -> Vec<OutageEvent> {
        let url = format!(
            "{}/outages/events?entityType={}&entityCode={}&from={}&until={}",
            self.base_url,
            entity.entity_type.as_str(),
            entity.code,
            from,
            until,
        );

        let Some(envelope) = self.get_json::<EventEnvelope>(&url, "events").await else {
            return Vec::new();
        };

        envelope
            .data
            .into_iter()
            .filter_map(|raw| {
                let datasource = Datasource::from_upstream_id(&raw.datasource)?;
                Some(OutageEvent {
                    entity_type: entity.entity_type,
                    entity_code: entity.code.clone(),
                    datasource,
                    start_ts: raw.start,
                    duration_seconds: raw.duration,
                    score: raw.score,
                })
            })
            .collect()
    }

    /// Fetch the aggregate outage score for an entity over `[from, until)`.
    ///
    /// The upstream reports one entry per datasource breakdown; the aggregate
    /// is their sum. `None` on failure or when no entry matches the entity.
    pub async fn fetch_outage_summary(
        &self,
        entity: &Entity,
        from: i64,
        until: i64,
    ) -> Option<f64> {
        let url = format!(
            "{}/outages/summary?entityType={}&entityCode={}&from={}&until={}",
            self.base_url,
            entity.entity_type.as_str(),
            entity.code,
            from,
            until,
        );

        let envelope: SummaryEnvelope = self.get_json(&url, "summary").await?;
        let mut total = None;
        for entry in envelope.data {
            if entry.entity_code == entity.code {
                *total.get_or_insert(0.0) += entry.score;
            }
        }
        total
    }

    /// Shared GET-and-decode path. The structural probe rejects HTML error
    /// pages and empty bodies before JSON decoding; status code and
    /// content-type alone are not trusted.
    async fn get_json<T: DeserializeOwned>(&self, url: &str, endpoint: &'static str) -> Option<T> {
        let response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(endpoint, error = %err, "upstream request failed");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(endpoint, %status, "upstream returned non-success status");
            return None;
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                warn!(endpoint, error = %err, "failed reading upstream response body");
                return None;
            }
        };

        if !looks_like_json(&body) {
            warn!(endpoint, "upstream returned a non-JSON body (error page?)");
            return None;
        }

        match serde_json::from_str(&body) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(endpoint, error = %err, "failed to decode upstream payload");
                None
            }
        }
    }
}

/// Structural probe: does this body plausibly start a JSON document?
fn looks_like_json(body: &str) -> bool {
    matches!(body.trim_start().as_bytes().first(), Some(b'{') | Some(b'['))
}

// Envelope shapes decoded at the fetch boundary. The upstream wraps series in
// a nested array; each element is discriminated by its `datasource` field.
// Untyped JSON never leaves this module.

#[derive(Debug, Deserialize)]
struct SignalEnvelope {
    #[serde(default)]
    data: Vec<Vec<RawSeries>>,
}

#[derive(Debug, Deserialize)]
struct RawSeries {
    datasource: String,
    from: i64,
    step: i64,
    #[serde(default)]
    values: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(default)]
    data: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    datasource: String,
    start: i64,
    duration: i64,
    score: f64,
}

#[derive(Debug, Deserialize)]
struct SummaryEnvelope {
    #[serde(default)]
    data: Vec<RawSummary>,
}

#[derive(Debug, Deserialize)]
struct RawSummary {
    #[serde(rename = "entityCode")]
    entity_code: String,
    score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_probe_rejects_html_and_empty_bodies() {
        assert!(!looks_like_json(""));
        assert!(!looks_like_json("   \n"));
        assert!(!looks_like_json("<!DOCTYPE html><html>502</html>"));
        assert!(!looks_like_json("<html><body>error</body></html>"));
        assert!(looks_like_json("{\"data\": []}"));
        assert!(looks_like_json("  [1, 2]"));
    }

    #[test]
    fn signal_envelope_decodes_nested_series() {
        let body = r#"{
            "data": [[
                {"datasource": "bgp", "from": 1000, "step": 300, "values": [1.0, null, 3.0]},
                {"datasource": "ucsd-nt", "from": 1000, "step": 600, "values": [5.0]}
            ]]
        }"#;
        let envelope: SignalEnvelope = serde_json::from_str(body).expect("decode");
        let all: Vec<&RawSeries> = envelope.data.iter().flatten().collect();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].values, vec![Some(1.0), None, Some(3.0)]);
        assert_eq!(
            Datasource::from_upstream_id(&all[1].datasource),
            Some(Datasource::Telescope),
            "legacy telescope id resolves through the alias table"
        );
    }

    #[test]
    fn event_envelope_tolerates_missing_data_key() {
        let envelope: EventEnvelope = serde_json::from_str("{}").expect("decode");
        assert!(envelope.data.is_empty());
    }
}
