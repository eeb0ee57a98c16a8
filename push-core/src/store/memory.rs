use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

use super::TokenStore;
use crate::error::{PushError, Result};
use crate::types::{DeviceToken, NewDeviceToken, Platform, PlatformCount, UserId};

/// In-process token store.
///
/// Rejects a second active record for the same raw token value, mirroring the
/// partial unique index of the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    records: RwLock<BTreeMap<i64, DeviceToken>>,
    next_id: AtomicI64,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn collect<'a>(
        records: impl Iterator<Item = &'a DeviceToken>,
    ) -> Vec<DeviceToken> {
        let mut found: Vec<DeviceToken> = records.cloned().collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        found
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn create(&self, token: NewDeviceToken) -> Result<DeviceToken> {
        let mut records = self.records.write().await;
        if records
            .values()
            .any(|r| r.is_active && r.token == token.token)
        {
            return Err(PushError::Conflict);
        }

        let now = Utc::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = DeviceToken {
            id,
            user_id: token.user_id,
            token: token.token,
            platform: token.platform,
            device_info: token.device_info,
            is_active: true,
            last_used_at: now,
            failure_count: 0,
            last_failure_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        records.insert(id, record.clone());
        Ok(record)
    }

    async fn update(&self, token: &DeviceToken) -> Result<DeviceToken> {
        let mut records = self.records.write().await;
        if token.is_active
            && records
                .values()
                .any(|r| r.is_active && r.token == token.token && r.id != token.id)
        {
            return Err(PushError::Conflict);
        }

        let existing = records.get_mut(&token.id).ok_or(PushError::NotFound)?;
        let mut updated = token.clone();
        updated.created_at = existing.created_at;
        updated.updated_at = Utc::now();
        *existing = updated.clone();
        Ok(updated)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<DeviceToken>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn find_by_token(&self, token: &str) -> Result<Vec<DeviceToken>> {
        let records = self.records.read().await;
        Ok(Self::collect(records.values().filter(|r| r.token == token)))
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
        let records = self.records.read().await;
        Ok(Self::collect(records.values().filter(|r| r.user_id == user_id)))
    }

    async fn find_by_user_and_platform(
        &self,
        user_id: UserId,
        platform: Platform,
    ) -> Result<Vec<DeviceToken>> {
        let records = self.records.read().await;
        Ok(Self::collect(
            records
                .values()
                .filter(|r| r.user_id == user_id && r.platform == platform),
        ))
    }

    async fn delete_by_token(&self, token: &str) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.token != token);
        Ok((before - records.len()) as u64)
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        Ok(self.records.write().await.remove(&id).is_some())
    }

    async fn platform_counts(&self) -> Result<Vec<PlatformCount>> {
        let records = self.records.read().await;
        let mut counts: HashMap<(Platform, bool), u64> = HashMap::new();
        for record in records.values() {
            *counts.entry((record.platform, record.is_active)).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((platform, is_active), count)| PlatformCount {
                platform,
                is_active,
                count,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_token(user_id: UserId, token: &str) -> NewDeviceToken {
        NewDeviceToken {
            user_id,
            token: token.to_string(),
            platform: Platform::Android,
            device_info: None,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_second_active_record() {
        let store = MemoryTokenStore::new();
        let first = store.create(new_token(1, "tok-1")).await.unwrap();
        assert!(first.is_active);
        assert_eq!(first.failure_count, 0);

        let err = store.create(new_token(2, "tok-1")).await.unwrap_err();
        assert!(matches!(err, PushError::Conflict));

        let mut deactivated = first.clone();
        deactivated.is_active = false;
        store.update(&deactivated).await.unwrap();

        let second = store.create(new_token(2, "tok-1")).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(store.find_by_token("tok-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_unknown_record() {
        let store = MemoryTokenStore::new();
        let mut record = store.create(new_token(1, "tok-1")).await.unwrap();
        store.delete(record.id).await.unwrap();
        record.failure_count = 3;
        assert!(matches!(
            store.update(&record).await,
            Err(PushError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_queries_and_counts() {
        let store = MemoryTokenStore::new();
        store.create(new_token(1, "a")).await.unwrap();
        store
            .create(NewDeviceToken {
                platform: Platform::Ios,
                ..new_token(1, "b")
            })
            .await
            .unwrap();
        store.create(new_token(2, "c")).await.unwrap();

        assert_eq!(store.find_by_user(1).await.unwrap().len(), 2);
        let ios = store
            .find_by_user_and_platform(1, Platform::Ios)
            .await
            .unwrap();
        assert_eq!(ios.len(), 1);
        assert_eq!(ios[0].token, "b");

        let counts = store.platform_counts().await.unwrap();
        let android: u64 = counts
            .iter()
            .filter(|c| c.platform == Platform::Android)
            .map(|c| c.count)
            .sum();
        assert_eq!(android, 2);

        assert_eq!(store.delete_by_token("a").await.unwrap(), 1);
        assert_eq!(store.len().await, 2);
    }
}
