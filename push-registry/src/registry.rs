use chrono::Utc;
use push_core::error::{GatewayError, PushError, Result};
use push_core::store::TokenStore;
use push_core::types::{DeviceToken, NewDeviceToken, Platform, TokenStats, UserId};
use push_core::{token_preview, FailureKind, FailurePolicy, PushContext};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::lock::{LocalTokenLock, RedisTokenLock, TokenLock};

/// Rejects token values that no vendor SDK would produce.
pub fn validate_token_shape(token: &str, min_len: usize, max_len: usize) -> Result<()> {
    let len = token.chars().count();
    if len < min_len || len > max_len {
        return Err(PushError::Validation(format!(
            "token length {len} outside {min_len}..={max_len}"
        )));
    }
    if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(PushError::validation(
            "token must not contain whitespace or control characters",
        ));
    }
    Ok(())
}

/// Owns device-token records and their lifecycle.
///
/// Every mutation runs under the per-token lock for the raw token value, so
/// concurrent dispatches to one device never lose a failure or success update.
#[derive(Clone)]
pub struct TokenRegistry {
    store: Arc<dyn TokenStore>,
    locks: Arc<dyn TokenLock>,
    policy: FailurePolicy,
    token_min_length: usize,
    token_max_length: usize,
}

impl TokenRegistry {
    pub fn new(store: Arc<dyn TokenStore>, locks: Arc<dyn TokenLock>, policy: FailurePolicy) -> Self {
        let defaults = push_core::config::RegistryConfig::default();
        Self {
            store,
            locks,
            policy,
            token_min_length: defaults.token_min_length,
            token_max_length: defaults.token_max_length,
        }
    }

    /// Registry over an in-process lock table.
    pub fn local(store: Arc<dyn TokenStore>, policy: FailurePolicy) -> Self {
        Self::new(store, Arc::new(LocalTokenLock::new()), policy)
    }

    pub fn from_context(ctx: &PushContext) -> Self {
        let locks: Arc<dyn TokenLock> = match (&ctx.redis_pool, &ctx.config.redis) {
            (Some(pool), Some(redis)) => {
                tracing::info!("Using Redis token locks (ttl {}ms)", redis.lock_ttl_ms);
                Arc::new(RedisTokenLock::new(
                    pool.clone(),
                    Duration::from_millis(redis.lock_ttl_ms),
                    redis.lock_retries,
                ))
            }
            _ => Arc::new(LocalTokenLock::new()),
        };
        let registry = &ctx.config.registry;
        Self::new(ctx.store.clone(), locks, FailurePolicy::from_config(registry))
            .with_token_bounds(registry.token_min_length, registry.token_max_length)
    }

    pub fn with_token_bounds(mut self, min_len: usize, max_len: usize) -> Self {
        self.token_min_length = min_len.max(1);
        self.token_max_length = max_len.max(self.token_min_length);
        self
    }

    pub fn policy(&self) -> &FailurePolicy {
        &self.policy
    }

    pub fn validate_token(&self, token: &str) -> Result<()> {
        validate_token_shape(token, self.token_min_length, self.token_max_length)
    }

    /// Runs `op` under the lock for `token`, retrying once when the store
    /// reports a conflicting active registration.
    async fn locked<T, F, Fut>(&self, token: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.locks.acquire(token).await?;
        let mut outcome = op().await;
        if matches!(outcome, Err(PushError::Conflict)) {
            tracing::debug!(
                "Conflict on token {}, retrying once",
                token_preview(token)
            );
            outcome = op().await;
        }
        guard.release().await;
        outcome
    }

    pub async fn register(
        &self,
        user_id: UserId,
        token: &str,
        platform: Platform,
        device_info: Option<Value>,
    ) -> Result<DeviceToken> {
        self.validate_token(token)?;
        self.locked(token, move || {
            self.register_locked(user_id, token, platform, device_info.clone())
        })
        .await
    }

    async fn register_locked(
        &self,
        user_id: UserId,
        token: &str,
        platform: Platform,
        device_info: Option<Value>,
    ) -> Result<DeviceToken> {
        let records = self.store.find_by_token(token).await?;
        let now = Utc::now();

        if let Some(active) = records.iter().find(|r| r.is_active) {
            if active.user_id == user_id {
                let mut refreshed = active.clone();
                refreshed.platform = platform;
                refreshed.device_info = merge_device_info(refreshed.device_info.take(), device_info);
                refreshed.last_used_at = now;
                tracing::debug!(
                    "Refreshed token {} for user {}",
                    token_preview(token),
                    user_id
                );
                return self.store.update(&refreshed).await;
            }

            let mut previous = active.clone();
            previous.is_active = false;
            self.store.update(&previous).await?;
            tracing::info!(
                "Token {} transferred from user {} to user {}",
                token_preview(token),
                previous.user_id,
                user_id
            );
        }

        if let Some(own) = records.iter().find(|r| r.user_id == user_id && !r.is_active) {
            let mut revived = own.clone();
            revived.is_active = true;
            revived.platform = platform;
            revived.device_info = merge_device_info(revived.device_info.take(), device_info);
            revived.last_used_at = now;
            revived.failure_count = 0;
            revived.last_failure_at = None;
            revived.failure_reason = None;
            tracing::info!(
                "Reactivated token {} for user {}",
                token_preview(token),
                user_id
            );
            return self.store.update(&revived).await;
        }

        let created = self
            .store
            .create(NewDeviceToken {
                user_id,
                token: token.to_string(),
                platform,
                device_info,
            })
            .await?;
        tracing::info!(
            "Registered {} token {} for user {}",
            platform,
            token_preview(token),
            user_id
        );
        Ok(created)
    }

    /// Removes the caller's records for `token`.
    ///
    /// Only rows owned by `user_id` are deleted. History rows left behind by
    /// earlier owners after a transfer stay in place.
    pub async fn unregister(&self, user_id: UserId, token: &str) -> Result<()> {
        self.locked(token, move || self.unregister_locked(user_id, token))
            .await
    }

    async fn unregister_locked(&self, user_id: UserId, token: &str) -> Result<()> {
        let records = self.store.find_by_token(token).await?;
        if records.is_empty() {
            return Err(PushError::NotFound);
        }

        let owned: Vec<&DeviceToken> = records.iter().filter(|r| r.user_id == user_id).collect();
        if owned.is_empty() {
            return Err(PushError::Ownership { user_id });
        }

        let was_active = owned.iter().any(|r| r.is_active);
        for record in &owned {
            self.store.delete(record.id).await?;
        }
        tracing::info!(
            "Unregistered {} token {} for user {} ({} records)",
            if was_active { "active" } else { "inactive" },
            token_preview(token),
            user_id,
            owned.len()
        );
        Ok(())
    }

    pub async fn find_active_by_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
        let mut records = self.store.find_by_user(user_id).await?;
        records.retain(|r| r.is_active);
        Ok(records)
    }

    pub async fn find_by_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
        self.store.find_by_user(user_id).await
    }

    /// Active records only.
    pub async fn find_by_user_and_platform(
        &self,
        user_id: UserId,
        platform: Platform,
    ) -> Result<Vec<DeviceToken>> {
        let mut records = self
            .store
            .find_by_user_and_platform(user_id, platform)
            .await?;
        records.retain(|r| r.is_active);
        Ok(records)
    }

    /// The record a send to `token` acts on: the active one, else the newest.
    pub async fn find_by_token(&self, token: &str) -> Result<Option<DeviceToken>> {
        let records = self.store.find_by_token(token).await?;
        Ok(pick_current(records))
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<DeviceToken>> {
        self.store.find_by_id(id).await
    }

    /// Applies a gateway failure to the token's health.
    ///
    /// Permanent failures deactivate at once; transient ones deactivate when
    /// the consecutive-failure counter reaches the policy threshold. Validation
    /// and ownership signals leave the record untouched.
    pub async fn record_failure(&self, token: &str, err: &GatewayError) -> Result<DeviceToken> {
        let kind = self.policy.classify_error(err);
        self.locked(token, move || self.record_failure_locked(token, err, kind))
            .await
    }

    async fn record_failure_locked(
        &self,
        token: &str,
        err: &GatewayError,
        kind: FailureKind,
    ) -> Result<DeviceToken> {
        let records = self.store.find_by_token(token).await?;
        let mut record = pick_current(records).ok_or(PushError::NotFound)?;
        if !kind.affects_token_health() {
            return Ok(record);
        }

        record.failure_count = record.failure_count.saturating_add(1);
        record.last_failure_at = Some(Utc::now());
        record.failure_reason = Some(err.to_string());

        if record.is_active && self.policy.should_deactivate(kind, record.failure_count) {
            record.is_active = false;
            tracing::warn!(
                "Deactivating token {} of user {} after {:?} failure #{}: {}",
                token_preview(token),
                record.user_id,
                kind,
                record.failure_count,
                err
            );
        }
        self.store.update(&record).await
    }

    pub async fn record_success(&self, token: &str) -> Result<DeviceToken> {
        self.locked(token, move || self.record_success_locked(token))
            .await
    }

    async fn record_success_locked(&self, token: &str) -> Result<DeviceToken> {
        let records = self.store.find_by_token(token).await?;
        let mut record = pick_current(records).ok_or(PushError::NotFound)?;
        record.failure_count = 0;
        record.last_failure_at = None;
        record.failure_reason = None;
        record.last_used_at = Utc::now();
        self.store.update(&record).await
    }

    pub async fn stats(&self) -> Result<TokenStats> {
        let counts = self.store.platform_counts().await?;
        Ok(TokenStats::from_counts(&counts))
    }
}

fn pick_current(records: Vec<DeviceToken>) -> Option<DeviceToken> {
    let mut newest = None;
    for record in records {
        if record.is_active {
            return Some(record);
        }
        if newest.is_none() {
            newest = Some(record);
        }
    }
    newest
}

/// Object fields of `incoming` overlay `existing`; any other value replaces it.
fn merge_device_info(existing: Option<Value>, incoming: Option<Value>) -> Option<Value> {
    match (existing, incoming) {
        (Some(Value::Object(mut base)), Some(Value::Object(patch))) => {
            for (key, value) in patch {
                base.insert(key, value);
            }
            Some(Value::Object(base))
        }
        (existing, None) => existing,
        (_, incoming) => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use push_core::types::PlatformCount;
    use push_core::MemoryTokenStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry() -> (TokenRegistry, Arc<MemoryTokenStore>) {
        let store = Arc::new(MemoryTokenStore::new());
        let registry = TokenRegistry::local(store.clone(), FailurePolicy::new(5));
        (registry, store)
    }

    fn transient() -> GatewayError {
        GatewayError::new("UNAVAILABLE", "gateway busy")
    }

    #[test]
    fn test_token_shape() {
        assert!(validate_token_shape("tokA", 4, 4096).is_ok());
        assert!(validate_token_shape("abc", 4, 4096).is_err());
        assert!(validate_token_shape("tok A", 4, 4096).is_err());
        assert!(validate_token_shape(&"x".repeat(11), 4, 10).is_err());
    }

    #[test]
    fn test_merge_device_info() {
        let merged = merge_device_info(
            Some(json!({"model": "Pixel 8", "os": "14"})),
            Some(json!({"os": "15", "app": "2.1.0"})),
        );
        assert_eq!(merged, Some(json!({"model": "Pixel 8", "os": "15", "app": "2.1.0"})));
        assert_eq!(
            merge_device_info(Some(json!({"model": "x"})), None),
            Some(json!({"model": "x"}))
        );
        assert_eq!(
            merge_device_info(Some(json!({"model": "x"})), Some(json!("raw"))),
            Some(json!("raw"))
        );
    }

    #[tokio::test]
    async fn test_register_rejects_malformed_token() {
        let (registry, store) = registry();
        let err = registry
            .register(1, "a b", Platform::Android, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::Validation(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_ownership_transfer() {
        let (registry, store) = registry();
        let first = registry
            .register(1, "tokA", Platform::Android, None)
            .await
            .unwrap();
        let second = registry
            .register(2, "tokA", Platform::Android, None)
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.user_id, 2);
        assert!(second.is_active);

        let old = store.find_by_id(first.id).await.unwrap().unwrap();
        assert!(!old.is_active);

        let active: Vec<_> = store
            .find_by_token("tokA")
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, 2);

        assert!(registry.find_active_by_user(1).await.unwrap().is_empty());
        assert_eq!(registry.find_active_by_user(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_idempotent_refresh() {
        let (registry, store) = registry();
        let first = registry
            .register(1, "tokA", Platform::Android, Some(json!({"os": "14"})))
            .await
            .unwrap();
        registry.record_failure("tokA", &transient()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let refreshed = registry
            .register(1, "tokA", Platform::Android, Some(json!({"app": "1.2"})))
            .await
            .unwrap();

        assert_eq!(refreshed.id, first.id);
        assert!(refreshed.last_used_at > first.last_used_at);
        assert_eq!(refreshed.failure_count, 1);
        assert_eq!(refreshed.device_info, Some(json!({"os": "14", "app": "1.2"})));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_reregistration_reactivates() {
        let (registry, store) = registry();
        let record = registry
            .register(1, "tokA", Platform::Android, None)
            .await
            .unwrap();
        let err = GatewayError::new("Unregistered", "gone");
        let failed = registry.record_failure("tokA", &err).await.unwrap();
        assert!(!failed.is_active);

        let revived = registry
            .register(1, "tokA", Platform::Android, None)
            .await
            .unwrap();
        assert_eq!(revived.id, record.id);
        assert!(revived.is_active);
        assert_eq!(revived.failure_count, 0);
        assert!(revived.failure_reason.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_deactivates_immediately() {
        let (registry, _) = registry();
        registry
            .register(1, "tokA", Platform::Ios, None)
            .await
            .unwrap();

        let err = GatewayError::new("BadDeviceToken", "token is malformed");
        let record = registry.record_failure("tokA", &err).await.unwrap();
        assert!(!record.is_active);
        assert_eq!(record.failure_count, 1);
        assert_eq!(
            record.failure_reason.as_deref(),
            Some("BadDeviceToken: token is malformed")
        );
        assert!(registry.find_active_by_user(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_deactivation_resets_on_success() {
        let (registry, _) = registry();
        registry
            .register(1, "tokA", Platform::Android, None)
            .await
            .unwrap();

        for _ in 0..4 {
            registry.record_failure("tokA", &transient()).await.unwrap();
        }
        let reset = registry.record_success("tokA").await.unwrap();
        assert_eq!(reset.failure_count, 0);
        assert!(reset.last_failure_at.is_none());

        let mut record = reset;
        for _ in 0..4 {
            record = registry.record_failure("tokA", &transient()).await.unwrap();
        }
        assert!(record.is_active);
        assert_eq!(record.failure_count, 4);

        let record = registry.record_failure("tokA", &transient()).await.unwrap();
        assert!(!record.is_active);
        assert_eq!(record.failure_count, 5);
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_token_untouched() {
        let (registry, _) = registry();
        let before = registry
            .register(1, "tokA", Platform::Android, None)
            .await
            .unwrap();
        let err = GatewayError::new("PayloadTooLarge", "too big");
        let after = registry.record_failure("tokA", &err).await.unwrap();
        assert_eq!(after.failure_count, before.failure_count);
        assert!(after.is_active);
    }

    #[tokio::test]
    async fn test_record_on_unknown_token() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.record_success("nope").await,
            Err(PushError::NotFound)
        ));
        assert!(registry.find_by_token("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unregister_ownership() {
        let (registry, store) = registry();
        registry
            .register(1, "tokA", Platform::Android, None)
            .await
            .unwrap();

        let err = registry.unregister(2, "tokA").await.unwrap_err();
        assert!(matches!(err, PushError::Ownership { user_id: 2 }));
        assert_eq!(store.len().await, 1);

        assert!(matches!(
            registry.unregister(1, "missing").await,
            Err(PushError::NotFound)
        ));

        registry.unregister(1, "tokA").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unregister_stale_record_keeps_new_owner() {
        let (registry, _) = registry();
        registry
            .register(1, "tokA", Platform::Android, None)
            .await
            .unwrap();
        registry
            .register(2, "tokA", Platform::Android, None)
            .await
            .unwrap();

        registry.unregister(1, "tokA").await.unwrap();
        let current = registry.find_by_token("tokA").await.unwrap().unwrap();
        assert_eq!(current.user_id, 2);
        assert!(current.is_active);
    }

    #[tokio::test]
    async fn test_unregister_keeps_previous_owner_history() {
        let (registry, store) = registry();
        registry
            .register(1, "shared", Platform::Android, None)
            .await
            .unwrap();
        registry
            .register(2, "shared", Platform::Android, None)
            .await
            .unwrap();

        registry.unregister(2, "shared").await.unwrap();

        let remaining = store.find_by_token("shared").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].user_id, 1);
        assert!(!remaining[0].is_active);
        assert_eq!(registry.find_by_user(1).await.unwrap().len(), 1);
        assert!(registry.find_by_user(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_by_user_and_platform_is_active_only() {
        let (registry, _) = registry();
        registry
            .register(1, "ios-one", Platform::Ios, None)
            .await
            .unwrap();
        registry
            .register(1, "ios-two", Platform::Ios, None)
            .await
            .unwrap();
        registry
            .register(1, "droid", Platform::Android, None)
            .await
            .unwrap();
        registry
            .record_failure("ios-two", &GatewayError::new("Unregistered", "gone"))
            .await
            .unwrap();

        let ios = registry
            .find_by_user_and_platform(1, Platform::Ios)
            .await
            .unwrap();
        assert_eq!(ios.len(), 1);
        assert_eq!(ios[0].token, "ios-one");
        assert_eq!(registry.find_by_user(1).await.unwrap().len(), 3);

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.by_platform[&Platform::Ios].inactive, 1);
    }

    /// Store that reports a conflict on the first create only.
    struct ConflictOnce {
        inner: MemoryTokenStore,
        tripped: AtomicBool,
    }

    #[async_trait]
    impl TokenStore for ConflictOnce {
        async fn create(&self, token: NewDeviceToken) -> Result<DeviceToken> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(PushError::Conflict);
            }
            self.inner.create(token).await
        }
        async fn update(&self, token: &DeviceToken) -> Result<DeviceToken> {
            self.inner.update(token).await
        }
        async fn find_by_id(&self, id: i64) -> Result<Option<DeviceToken>> {
            self.inner.find_by_id(id).await
        }
        async fn find_by_token(&self, token: &str) -> Result<Vec<DeviceToken>> {
            self.inner.find_by_token(token).await
        }
        async fn find_by_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
            self.inner.find_by_user(user_id).await
        }
        async fn find_by_user_and_platform(
            &self,
            user_id: UserId,
            platform: Platform,
        ) -> Result<Vec<DeviceToken>> {
            self.inner.find_by_user_and_platform(user_id, platform).await
        }
        async fn delete_by_token(&self, token: &str) -> Result<u64> {
            self.inner.delete_by_token(token).await
        }
        async fn delete(&self, id: i64) -> Result<bool> {
            self.inner.delete(id).await
        }
        async fn platform_counts(&self) -> Result<Vec<PlatformCount>> {
            self.inner.platform_counts().await
        }
    }

    #[tokio::test]
    async fn test_conflict_is_retried_once() {
        let store = Arc::new(ConflictOnce {
            inner: MemoryTokenStore::new(),
            tripped: AtomicBool::new(false),
        });
        let registry = TokenRegistry::local(store.clone(), FailurePolicy::default());
        let record = registry
            .register(1, "tokA", Platform::Web, None)
            .await
            .unwrap();
        assert!(record.is_active);
        assert_eq!(store.inner.len().await, 1);
    }
}
