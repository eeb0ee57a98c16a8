use std::sync::Arc;

use crate::config::{Config, StoreBackend};
use crate::db::create_pool as create_db_pool;
use crate::redis::{create_pool as create_redis_pool, RedisPool};
use crate::store::{MemoryTokenStore, PgTokenStore, TokenStore};

/// Shared handles built once at start-up.
#[derive(Clone)]
pub struct PushContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn TokenStore>,
    pub redis_pool: Option<RedisPool>,
}

impl PushContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn TokenStore> = match config.store.backend {
            StoreBackend::Postgres => {
                let db_pool = create_db_pool(&config.database).await?;
                Arc::new(PgTokenStore::new(db_pool))
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory token store; registrations are lost on restart");
                Arc::new(MemoryTokenStore::new())
            }
        };

        let redis_pool = match &config.redis {
            Some(redis_config) => Some(create_redis_pool(redis_config).await?),
            None => {
                tracing::info!("REDIS_URL not set, token locks are process-local");
                None
            }
        };

        Ok(PushContext {
            config: Arc::new(config),
            store,
            redis_pool,
        })
    }

    /// Context over an arbitrary store, without Redis.
    pub fn with_store(config: Config, store: Arc<dyn TokenStore>) -> Self {
        PushContext {
            config: Arc::new(config),
            store,
            redis_pool: None,
        }
    }
}
