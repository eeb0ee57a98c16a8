use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use std::sync::Arc;

use super::TokenStore;
use crate::db::{DbConnection, DbPool};
use crate::error::{PushError, Result};
use crate::schema::device_tokens;
use crate::types::{DeviceToken, NewDeviceToken, Platform, PlatformCount, UserId};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = device_tokens)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct DeviceTokenRow {
    id: i64,
    user_id: i64,
    token: String,
    platform: String,
    device_info: Option<serde_json::Value>,
    is_active: bool,
    last_used_at: DateTime<Utc>,
    failure_count: i32,
    last_failure_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeviceTokenRow> for DeviceToken {
    type Error = PushError;

    fn try_from(row: DeviceTokenRow) -> Result<Self> {
        let platform = row
            .platform
            .parse::<Platform>()
            .map_err(|_| PushError::Storage(format!("unknown platform in row {}", row.id)))?;
        Ok(DeviceToken {
            id: row.id,
            user_id: row.user_id,
            token: row.token,
            platform,
            device_info: row.device_info,
            is_active: row.is_active,
            last_used_at: row.last_used_at,
            failure_count: row.failure_count.max(0) as u32,
            last_failure_at: row.last_failure_at,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = device_tokens)]
struct NewDeviceTokenRow<'a> {
    user_id: i64,
    token: &'a str,
    platform: &'a str,
    device_info: Option<serde_json::Value>,
    is_active: bool,
    failure_count: i32,
}

fn into_tokens(rows: Vec<DeviceTokenRow>) -> Result<Vec<DeviceToken>> {
    rows.into_iter().map(DeviceToken::try_from).collect()
}

/// Postgres-backed store over a diesel-async deadpool pool.
#[derive(Clone)]
pub struct PgTokenStore {
    pool: Arc<DbPool>,
}

impl PgTokenStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .await
            .map_err(|e| PushError::Storage(format!("failed to get connection: {e}")))
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn create(&self, token: NewDeviceToken) -> Result<DeviceToken> {
        let mut conn = self.conn().await?;
        let row = diesel::insert_into(device_tokens::table)
            .values(NewDeviceTokenRow {
                user_id: token.user_id,
                token: &token.token,
                platform: token.platform.as_str(),
                device_info: token.device_info.clone(),
                is_active: true,
                failure_count: 0,
            })
            .returning(DeviceTokenRow::as_returning())
            .get_result(&mut conn)
            .await?;
        row.try_into()
    }

    async fn update(&self, token: &DeviceToken) -> Result<DeviceToken> {
        let mut conn = self.conn().await?;
        let row = diesel::update(device_tokens::table.find(token.id))
            .set((
                device_tokens::user_id.eq(token.user_id),
                device_tokens::platform.eq(token.platform.as_str()),
                device_tokens::device_info.eq(token.device_info.clone()),
                device_tokens::is_active.eq(token.is_active),
                device_tokens::last_used_at.eq(token.last_used_at),
                device_tokens::failure_count
                    .eq(i32::try_from(token.failure_count).unwrap_or(i32::MAX)),
                device_tokens::last_failure_at.eq(token.last_failure_at),
                device_tokens::failure_reason.eq(token.failure_reason.as_deref()),
                device_tokens::updated_at.eq(Utc::now()),
            ))
            .returning(DeviceTokenRow::as_returning())
            .get_result(&mut conn)
            .await?;
        row.try_into()
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<DeviceToken>> {
        let mut conn = self.conn().await?;
        let row = device_tokens::table
            .find(id)
            .select(DeviceTokenRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(DeviceToken::try_from).transpose()
    }

    async fn find_by_token(&self, token: &str) -> Result<Vec<DeviceToken>> {
        let mut conn = self.conn().await?;
        let rows = device_tokens::table
            .filter(device_tokens::token.eq(token))
            .order((device_tokens::created_at.desc(), device_tokens::id.desc()))
            .select(DeviceTokenRow::as_select())
            .load(&mut conn)
            .await?;
        into_tokens(rows)
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
        let mut conn = self.conn().await?;
        let rows = device_tokens::table
            .filter(device_tokens::user_id.eq(user_id))
            .order((device_tokens::created_at.desc(), device_tokens::id.desc()))
            .select(DeviceTokenRow::as_select())
            .load(&mut conn)
            .await?;
        into_tokens(rows)
    }

    async fn find_by_user_and_platform(
        &self,
        user_id: UserId,
        platform: Platform,
    ) -> Result<Vec<DeviceToken>> {
        let mut conn = self.conn().await?;
        let rows = device_tokens::table
            .filter(device_tokens::user_id.eq(user_id))
            .filter(device_tokens::platform.eq(platform.as_str()))
            .order((device_tokens::created_at.desc(), device_tokens::id.desc()))
            .select(DeviceTokenRow::as_select())
            .load(&mut conn)
            .await?;
        into_tokens(rows)
    }

    async fn delete_by_token(&self, token: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(device_tokens::table.filter(device_tokens::token.eq(token)))
            .execute(&mut conn)
            .await?;
        Ok(deleted as u64)
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(device_tokens::table.find(id))
            .execute(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn platform_counts(&self) -> Result<Vec<PlatformCount>> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, bool, i64)> = device_tokens::table
            .group_by((device_tokens::platform, device_tokens::is_active))
            .select((device_tokens::platform, device_tokens::is_active, count_star()))
            .load(&mut conn)
            .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for (platform, is_active, count) in rows {
            match platform.parse::<Platform>() {
                Ok(platform) => counts.push(PlatformCount {
                    platform,
                    is_active,
                    count: count.max(0) as u64,
                }),
                Err(_) => tracing::warn!("Skipping unknown platform in token counts: {}", platform),
            }
        }
        Ok(counts)
    }
}
