//! Persistent token store.
//!
//! Stores only persist and query; the active-token invariant is enforced by
//! the registry's per-token lock, backed in Postgres by a partial unique
//! index (`UNIQUE (token) WHERE is_active`) that surfaces as
//! [`PushError::Conflict`](crate::error::PushError::Conflict).

mod memory;
mod postgres;

pub use memory::MemoryTokenStore;
pub use postgres::PgTokenStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{DeviceToken, NewDeviceToken, Platform, PlatformCount, UserId};

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Inserts an active record with a zeroed failure counter.
    async fn create(&self, token: NewDeviceToken) -> Result<DeviceToken>;

    /// Persists every mutable field of `token` (matched by id) and bumps `updated_at`.
    async fn update(&self, token: &DeviceToken) -> Result<DeviceToken>;

    async fn find_by_id(&self, id: i64) -> Result<Option<DeviceToken>>;

    /// All records, active or not, carrying this raw token value, newest first.
    async fn find_by_token(&self, token: &str) -> Result<Vec<DeviceToken>>;

    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>>;

    async fn find_by_user_and_platform(
        &self,
        user_id: UserId,
        platform: Platform,
    ) -> Result<Vec<DeviceToken>>;

    /// Removes every record carrying this raw token value.
    async fn delete_by_token(&self, token: &str) -> Result<u64>;

    async fn delete(&self, id: i64) -> Result<bool>;

    async fn platform_counts(&self) -> Result<Vec<PlatformCount>>;
}
