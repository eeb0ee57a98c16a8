use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::PushError;
use crate::policy::FailureKind;

pub type UserId = i64;

/// Upper bound on the serialized size of a push payload (title, body and data).
pub const MAX_PAYLOAD_BYTES: usize = 4096;

/// Shortened form of a raw token for log lines.
pub fn token_preview(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    if prefix.len() < token.len() {
        format!("{prefix}...")
    } else {
        prefix
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    Web,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Android, Platform::Ios, Platform::Web];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Web => "web",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            "web" => Ok(Platform::Web),
            other => Err(PushError::Validation(format!("unsupported platform: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub id: i64,
    pub user_id: UserId,
    pub token: String,
    pub platform: Platform,
    pub device_info: Option<serde_json::Value>,
    pub is_active: bool,
    pub last_used_at: DateTime<Utc>,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeviceToken {
    pub user_id: UserId,
    pub token: String,
    pub platform: Platform,
    pub device_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Maps a notification's domain priority onto a push priority.
    pub fn from_domain(priority: &str) -> Self {
        match priority.trim().to_ascii_lowercase().as_str() {
            "urgent" | "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(PushError::Validation(format!("unsupported priority: {other}"))),
        }
    }
}

/// Canonical push message handed to a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub sound: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<u32>,
}

impl Default for PushMessage {
    fn default() -> Self {
        Self {
            title: String::new(),
            body: String::new(),
            data: HashMap::new(),
            image_url: None,
            sound: "default".to_string(),
            priority: Priority::Normal,
            badge: None,
        }
    }
}

impl PushMessage {
    /// Shape checks applied before any gateway call.
    pub fn validate(&self) -> Result<(), PushError> {
        if self.title.trim().is_empty() && self.body.trim().is_empty() {
            return Err(PushError::validation("message needs a title or a body"));
        }
        if self.data.keys().any(|k| k.trim().is_empty()) {
            return Err(PushError::validation("message data keys must not be empty"));
        }
        let size = self.title.len()
            + self.body.len()
            + self
                .data
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>();
        if size > MAX_PAYLOAD_BYTES {
            return Err(PushError::Validation(format!(
                "message payload is {size} bytes, limit is {MAX_PAYLOAD_BYTES}"
            )));
        }
        Ok(())
    }
}

/// Outcome of one delivery attempt to one target (token or topic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResult {
    pub target: String,
    pub message_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl PushResult {
    pub fn delivered(target: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message_id: message_id.into(),
            success: true,
            error_code: None,
            error_message: None,
            failure_kind: None,
        }
    }

    pub fn failed(
        target: impl Into<String>,
        kind: FailureKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            message_id: String::new(),
            success: false,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            failure_kind: Some(kind),
        }
    }

    pub fn cancelled(target: impl Into<String>) -> Self {
        let err = PushError::Cancelled;
        Self::failed(target, FailureKind::Cancelled, err.code(), err.to_string())
    }
}

/// Aggregate of a fan-out to the devices of one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub results: Vec<PushResult>,
    pub total_sent: usize,
    pub success_count: usize,
    pub failure_count: usize,
}

impl BatchResult {
    pub fn from_results(results: Vec<PushResult>) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            total_sent: results.len(),
            failure_count: results.len() - success_count,
            success_count,
            results,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Aggregate of a fan-out to many users.
///
/// Every requested user has an entry in `results`; users whose tokens could
/// not be resolved map to an empty sequence and are listed in `unresolved`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiUserResult {
    pub results: HashMap<UserId, Vec<PushResult>>,
    pub unresolved: HashMap<UserId, String>,
    pub total_users: usize,
    pub total_sent: usize,
    pub success_count: usize,
    pub failure_count: usize,
}

impl MultiUserResult {
    pub fn record(&mut self, user_id: UserId, batch: BatchResult) {
        self.total_sent += batch.total_sent;
        self.success_count += batch.success_count;
        self.failure_count += batch.failure_count;
        self.results.insert(user_id, batch.results);
    }

    pub fn record_unresolved(&mut self, user_id: UserId, reason: String) {
        self.results.insert(user_id, Vec::new());
        self.unresolved.insert(user_id, reason);
    }
}

/// Read-only notification record supplied by the upstream producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    #[serde(rename = "type", alias = "notification_type")]
    pub notification_type: String,
    #[serde(default)]
    pub category: String,
    pub title: String,
    #[serde(alias = "body")]
    pub message: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub action_url: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub related_id: Option<String>,
    #[serde(default)]
    pub related_type: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCount {
    pub platform: Platform,
    pub is_active: bool,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformStats {
    pub active: u64,
    pub inactive: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStats {
    pub total: u64,
    pub active: u64,
    pub inactive: u64,
    pub by_platform: HashMap<Platform, PlatformStats>,
}

impl TokenStats {
    pub fn from_counts(counts: &[PlatformCount]) -> Self {
        let mut stats = TokenStats::default();
        for platform in Platform::ALL {
            stats.by_platform.insert(platform, PlatformStats::default());
        }
        for count in counts {
            let entry = stats.by_platform.entry(count.platform).or_default();
            if count.is_active {
                entry.active += count.count;
                stats.active += count.count;
            } else {
                entry.inactive += count.count;
                stats.inactive += count.count;
            }
            stats.total += count.count;
        }
        stats
    }
}
