//! Per-token mutual exclusion.
//!
//! Every registry mutation runs while holding the lock for its raw token
//! value. `LocalTokenLock` serializes within one process; `RedisTokenLock`
//! extends this across instances with a leased `SET NX PX` key.

use async_trait::async_trait;
use push_core::error::{PushError, Result};
use push_core::redis::{get_connection, RedisPool};
use push_core::token_preview;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[async_trait]
pub trait TokenLock: Send + Sync {
    async fn acquire(&self, token: &str) -> Result<TokenGuard>;
}

/// Held lock on one raw token value. Call [`TokenGuard::release`] when done;
/// a dropped Redis guard only lets its lease expire.
pub struct TokenGuard {
    inner: GuardInner,
}

enum GuardInner {
    Local {
        guard: OwnedMutexGuard<()>,
        key: String,
        table: LockTable,
    },
    Redis {
        key: String,
        owner: String,
        pool: RedisPool,
    },
    Released,
}

impl TokenGuard {
    pub async fn release(mut self) {
        match std::mem::replace(&mut self.inner, GuardInner::Released) {
            GuardInner::Local { guard, key, table } => release_local(guard, &key, &table),
            GuardInner::Redis { key, owner, pool } => {
                if let Err(e) = release_redis(&pool, &key, &owner).await {
                    tracing::warn!("Failed to release token lock {}: {}", key, e);
                }
            }
            GuardInner::Released => {}
        }
    }
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.inner, GuardInner::Released) {
            GuardInner::Local { guard, key, table } => release_local(guard, &key, &table),
            GuardInner::Redis { key, .. } => {
                tracing::warn!(
                    "Token lock {} dropped without release, lease will expire",
                    key
                );
            }
            GuardInner::Released => {}
        }
    }
}

fn release_local(guard: OwnedMutexGuard<()>, key: &str, table: &LockTable) {
    drop(guard);
    let mut table = table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(slot) = table.get(key) {
        // Only the table itself still references an idle slot.
        if Arc::strong_count(slot) == 1 {
            table.remove(key);
        }
    }
}

/// Process-local lock: one async mutex per raw token value, created on demand
/// and discarded once nobody holds or waits for it.
#[derive(Default, Clone)]
pub struct LocalTokenLock {
    table: LockTable,
}

impl LocalTokenLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of token values currently locked or awaited.
    pub fn in_use(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl TokenLock for LocalTokenLock {
    async fn acquire(&self, token: &str) -> Result<TokenGuard> {
        let slot = {
            let mut table = self
                .table
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            table.entry(token.to_string()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        Ok(TokenGuard {
            inner: GuardInner::Local {
                guard,
                key: token.to_string(),
                table: self.table.clone(),
            },
        })
    }
}

const RELEASE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

/// Cross-instance lock leased in Redis.
pub struct RedisTokenLock {
    pool: RedisPool,
    ttl: Duration,
    retries: u32,
    retry_delay: Duration,
    instance_id: String,
}

impl RedisTokenLock {
    pub fn new(pool: RedisPool, ttl: Duration, retries: u32) -> Self {
        Self {
            pool,
            ttl,
            retries: retries.max(1),
            retry_delay: Duration::from_millis(20),
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    fn lock_key(token: &str) -> String {
        format!("push:token-lock:{}", token)
    }
}

#[async_trait]
impl TokenLock for RedisTokenLock {
    async fn acquire(&self, token: &str) -> Result<TokenGuard> {
        let key = Self::lock_key(token);
        let owner = format!("{}:{}", self.instance_id, Uuid::new_v4());
        let ttl_ms = self.ttl.as_millis() as u64;
        let mut conn = get_connection(&self.pool).await?;

        for attempt in 1..=self.retries {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&owner)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;

            if acquired.is_some() {
                tracing::trace!("Acquired token lock on attempt {}", attempt);
                return Ok(TokenGuard {
                    inner: GuardInner::Redis {
                        key,
                        owner,
                        pool: self.pool.clone(),
                    },
                });
            }
            tokio::time::sleep(self.retry_delay).await;
        }

        Err(PushError::Lock(format!(
            "gave up waiting for lock on token {} after {} attempts",
            token_preview(token),
            self.retries
        )))
    }
}

async fn release_redis(pool: &RedisPool, key: &str, owner: &str) -> redis::RedisResult<()> {
    let mut conn = get_connection(pool).await?;
    let released: i32 = redis::Script::new(RELEASE_SCRIPT)
        .key(key)
        .arg(owner)
        .invoke_async(&mut conn)
        .await?;
    if released == 0 {
        tracing::warn!("Token lock {} had already expired or changed owner", key);
    }
    Ok(())
}
