use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::metrics::AppMetrics;
use crate::series::Entity;
use crate::state::SharedState;
use crate::upstream::UpstreamClient;

/// Shared application context passed to HTTP handlers and sync loops.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub pool: DbPool,
    pub metrics: AppMetrics,
    pub state: SharedState,
    pub upstream: UpstreamClient,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        pool: DbPool,
        metrics: AppMetrics,
        state: SharedState,
        upstream: UpstreamClient,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pool,
            metrics,
            state,
            upstream,
        }
    }

    /// The configured country as a fetchable entity.
    pub fn country_entity(&self) -> Entity {
        Entity::country(self.config.country.code.clone())
    }
}
