//! Message Composer: canonical push messages from ad-hoc requests and from
//! notification records.

use push_core::{Notification, Priority, PushMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Raw send request as accepted from callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub sound: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub badge: Option<u32>,
}

/// Ad-hoc sends default to `high` priority, unlike notification-derived ones.
pub fn from_request(request: &MessageRequest) -> PushMessage {
    let data = request
        .data
        .iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key.clone(), s.clone())),
            _ => None,
        })
        .collect();

    PushMessage {
        title: request.title.clone(),
        body: request.body.clone(),
        data,
        image_url: request.image_url.clone().filter(|url| !url.is_empty()),
        sound: request
            .sound
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "default".to_string()),
        priority: request.priority.unwrap_or(Priority::High),
        badge: request.badge,
    }
}

pub fn from_notification(notification: &Notification) -> PushMessage {
    let mut data = HashMap::new();
    data.insert("notification_id".to_string(), notification.id.to_string());
    data.insert("type".to_string(), notification.notification_type.clone());
    data.insert("category".to_string(), notification.category.clone());

    let optional = [
        ("action_url", &notification.action_url),
        ("related_id", &notification.related_id),
        ("related_type", &notification.related_type),
    ];
    for (key, value) in optional {
        if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
            data.insert(key.to_string(), value.clone());
        }
    }

    PushMessage {
        title: notification.title.clone(),
        body: notification.message.clone(),
        data,
        image_url: notification.icon.clone().filter(|icon| !icon.is_empty()),
        sound: "default".to_string(),
        priority: Priority::from_domain(&notification.priority),
        badge: None,
    }
}
