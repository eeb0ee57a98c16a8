use a2::request::payload::Payload;
use a2::{
    Client, Endpoint, LocalizedNotificationBuilder, NotificationBuilder, NotificationOptions,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use push_core::config::DeliveryConfig;
use push_core::{token_preview, GatewayError, Priority, PushMessage};
use std::fs;

use crate::gateway::PushGateway;

/// Code reported for topic sends, which APNs has no notion of.
pub const TOPIC_UNSUPPORTED: &str = "TOPIC_UNSUPPORTED";

pub struct ApnsGateway {
    client: Client,
    bundle_id: String,
}

impl ApnsGateway {
    /// `None` when key id or team id are missing.
    pub fn new(config: &DeliveryConfig) -> Result<Option<Self>> {
        let (key_id, team_id) = match (&config.apns_key_id, &config.apns_team_id) {
            (Some(key_id), Some(team_id)) => (key_id, team_id),
            _ => {
                tracing::warn!("APNs delivery disabled (missing configuration)");
                return Ok(None);
            }
        };

        tracing::info!("Initializing APNs client");

        let key_content = if let Some(key_content_base64) = &config.apns_key_content {
            use base64::Engine;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(key_content_base64.trim())
                .map_err(|e| anyhow!("Failed to decode base64 APNs key: {}", e))?;
            String::from_utf8(decoded)
                .map_err(|e| anyhow!("Failed to convert APNs key to UTF-8: {}", e))?
        } else if let Some(key_path) = &config.apns_key_path {
            fs::read_to_string(key_path)
                .map_err(|e| anyhow!("Failed to read APNs key file {}: {}", key_path, e))?
        } else {
            return Err(anyhow!(
                "Either APNS_KEY_PATH or APNS_KEY_CONTENT must be provided"
            ));
        };

        let endpoint = if config.apns_sandbox {
            Endpoint::Sandbox
        } else {
            Endpoint::Production
        };

        let client = Client::token(key_content.as_bytes(), key_id, team_id, endpoint)
            .map_err(|e| anyhow!("Failed to create APNs client: {}", e))?;

        tracing::info!(
            "APNs client initialized ({})",
            if config.apns_sandbox { "sandbox" } else { "production" }
        );
        Ok(Some(Self {
            client,
            bundle_id: config.apns_bundle_id.clone().unwrap_or_default(),
        }))
    }
}

/// Device tokens are 32 bytes, hex encoded.
pub fn is_apns_token(token: &str) -> bool {
    token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit())
}

fn apns_priority(priority: Priority) -> a2::Priority {
    match priority {
        Priority::High => a2::Priority::High,
        Priority::Normal | Priority::Low => a2::Priority::Normal,
    }
}

/// Alert with title and body, custom `data` and `image_url` beside `aps`.
fn build_payload<'a>(
    token: &'a str,
    message: &'a PushMessage,
    bundle_id: &'a str,
) -> Result<Payload<'a>, GatewayError> {
    let mut builder = LocalizedNotificationBuilder::new(&message.title, &message.body);
    builder.set_sound(&message.sound);
    if let Some(badge) = message.badge {
        builder.set_badge(badge);
    }
    if message.image_url.is_some() {
        builder.set_mutable_content();
    }

    let mut options = NotificationOptions::default();
    if !bundle_id.is_empty() {
        options.apns_topic = Some(bundle_id);
    }
    options.apns_priority = Some(apns_priority(message.priority));

    let mut payload = builder.build(token, options);
    if !message.data.is_empty() {
        payload
            .add_custom_data("data", &message.data)
            .map_err(|e| GatewayError::new("InvalidMessage", e.to_string()))?;
    }
    if let Some(image_url) = &message.image_url {
        payload
            .add_custom_data("image_url", image_url)
            .map_err(|e| GatewayError::new("InvalidMessage", e.to_string()))?;
    }
    Ok(payload)
}

fn map_error(err: a2::Error) -> GatewayError {
    match err {
        a2::Error::ResponseError(response) => match response.error {
            Some(body) => GatewayError::new(
                format!("{:?}", body.reason),
                format!("APNs rejected the notification (status {})", response.code),
            ),
            None => GatewayError::new(
                format!("HTTP{}", response.code),
                "APNs returned an error status without a reason",
            ),
        },
        other => GatewayError::new("ConnectionError", other.to_string()),
    }
}

#[async_trait]
impl PushGateway for ApnsGateway {
    fn name(&self) -> &'static str {
        "apns"
    }

    async fn send_to_token(
        &self,
        token: &str,
        message: &PushMessage,
    ) -> Result<String, GatewayError> {
        let payload = build_payload(token, message, &self.bundle_id)?;
        let response = self.client.send(payload).await.map_err(map_error)?;

        tracing::debug!(
            "APNs notification sent to device {} (status {})",
            token_preview(token),
            response.code
        );
        Ok(response.apns_id.unwrap_or_default())
    }

    async fn send_to_topic(
        &self,
        topic: &str,
        _message: &PushMessage,
    ) -> Result<String, GatewayError> {
        Err(GatewayError::new(
            TOPIC_UNSUPPORTED,
            format!("APNs cannot deliver to topic {}", topic),
        ))
    }

    async fn validate_token(&self, token: &str) -> Result<bool, GatewayError> {
        Ok(is_apns_token(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        assert!(is_apns_token(&"ab".repeat(32)));
        assert!(!is_apns_token(&"zz".repeat(32)));
        assert!(!is_apns_token("abcdef"));
    }

    #[test]
    fn test_payload_carries_alert_and_custom_data() {
        let mut message = PushMessage {
            title: "Build finished".to_string(),
            body: "All checks passed".to_string(),
            badge: Some(3),
            image_url: Some("https://example.com/ok.png".to_string()),
            ..Default::default()
        };
        message
            .data
            .insert("screen".to_string(), "builds".to_string());
        let token = "ab".repeat(32);

        let payload = build_payload(&token, &message, "com.example.app").unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&payload.to_json_string().unwrap()).unwrap();

        assert_eq!(json["aps"]["alert"]["title"], "Build finished");
        assert_eq!(json["aps"]["alert"]["body"], "All checks passed");
        assert_eq!(json["aps"]["sound"], "default");
        assert_eq!(json["aps"]["badge"], 3);
        assert_eq!(json["data"]["screen"], "builds");
        assert_eq!(json["image_url"], "https://example.com/ok.png");
    }

    #[test]
    fn test_missing_credentials_disable_gateway() {
        let config = DeliveryConfig {
            apns_key_id: Some("KEY123".to_string()),
            ..Default::default()
        };
        assert!(ApnsGateway::new(&config).unwrap().is_none());
    }

    #[test]
    fn test_missing_key_material_is_an_error() {
        let config = DeliveryConfig {
            apns_key_id: Some("KEY123".to_string()),
            apns_team_id: Some("TEAM123".to_string()),
            ..Default::default()
        };
        assert!(ApnsGateway::new(&config).is_err());
    }
}
