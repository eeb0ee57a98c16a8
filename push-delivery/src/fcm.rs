use async_trait::async_trait;
use fcm::{Client, FcmError, FcmResponse, MessageBuilder, NotificationBuilder};
use push_core::config::DeliveryConfig;
use push_core::{token_preview, GatewayError, Priority, PushMessage};
use std::collections::HashMap;

use crate::gateway::PushGateway;

/// FCM legacy HTTP API.
pub struct FcmGateway {
    client: Client,
    server_key: String,
}

impl FcmGateway {
    /// `None` when no server key is configured.
    pub fn new(config: &DeliveryConfig) -> Option<Self> {
        let server_key = config.fcm_server_key.clone()?;
        tracing::info!("Initializing FCM client");
        Some(Self {
            client: Client::new(),
            server_key,
        })
    }

    async fn deliver(
        &self,
        to: &str,
        message: &PushMessage,
        dry_run: bool,
    ) -> Result<FcmResponse, GatewayError> {
        let badge = message.badge.map(|b| b.to_string());

        let mut notification = NotificationBuilder::new();
        notification.title(&message.title);
        notification.body(&message.body);
        notification.sound(&message.sound);
        if let Some(badge) = &badge {
            notification.badge(badge);
        }
        if let Some(image_url) = &message.image_url {
            notification.icon(image_url);
        }

        let mut data: HashMap<&str, &str> = message
            .data
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if let Some(image_url) = &message.image_url {
            data.entry("image_url").or_insert(image_url.as_str());
        }

        let mut builder = MessageBuilder::new(&self.server_key, to);
        builder.notification(notification.finalize());
        builder
            .data(&data)
            .map_err(|e| GatewayError::new("InvalidMessage", e.to_string()))?;
        builder.priority(match message.priority {
            Priority::High => fcm::Priority::High,
            Priority::Normal | Priority::Low => fcm::Priority::Normal,
        });
        if dry_run {
            builder.dry_run(true);
        }

        self.client.send(builder.finalize()).await.map_err(map_error)
    }
}

fn map_error(err: FcmError) -> GatewayError {
    match err {
        FcmError::Unauthorized => GatewayError::new("Unauthorized", "FCM rejected the server key"),
        FcmError::InvalidMessage(reason) => GatewayError::new("InvalidMessage", reason),
        other => GatewayError::new("ServerUnavailable", other.to_string()),
    }
}

/// Pulls the message id or the per-recipient error out of a response.
fn interpret(response: FcmResponse) -> Result<String, GatewayError> {
    if let Some(reason) = response.error {
        return Err(GatewayError::new(
            format!("{:?}", reason),
            "FCM rejected the message",
        ));
    }

    if let Some(result) = response.results.and_then(|r| r.into_iter().next()) {
        if let Some(reason) = result.error {
            return Err(GatewayError::new(
                format!("{:?}", reason),
                "FCM rejected the registration token",
            ));
        }
        if let Some(id) = result.message_id {
            return Ok(id);
        }
    }

    Ok(response
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_default())
}

#[async_trait]
impl PushGateway for FcmGateway {
    fn name(&self) -> &'static str {
        "fcm"
    }

    async fn send_to_token(
        &self,
        token: &str,
        message: &PushMessage,
    ) -> Result<String, GatewayError> {
        let response = self.deliver(token, message, false).await?;
        let message_id = interpret(response)?;
        tracing::debug!(
            "FCM notification sent to device {} ({})",
            token_preview(token),
            message_id
        );
        Ok(message_id)
    }

    async fn send_to_topic(
        &self,
        topic: &str,
        message: &PushMessage,
    ) -> Result<String, GatewayError> {
        let to = format!("/topics/{}", topic);
        let response = self.deliver(&to, message, false).await?;
        interpret(response)
    }

    /// Dry-run send: FCM checks the token without delivering anything.
    async fn validate_token(&self, token: &str) -> Result<bool, GatewayError> {
        let dry_run_message = PushMessage {
            title: "validate".to_string(),
            ..Default::default()
        };
        let response = self.deliver(token, &dry_run_message, true).await?;
        match interpret(response) {
            Ok(_) => Ok(true),
            Err(err) if is_token_rejection(&err.code) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn is_token_rejection(code: &str) -> bool {
    matches!(
        code,
        "InvalidRegistration" | "NotRegistered" | "MissingRegistration" | "MismatchSenderId"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_requires_server_key() {
        assert!(FcmGateway::new(&DeliveryConfig::default()).is_none());
        let config = DeliveryConfig {
            fcm_server_key: Some("server-key".to_string()),
            ..Default::default()
        };
        assert!(FcmGateway::new(&config).is_some());
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(map_error(FcmError::Unauthorized).code, "Unauthorized");
        let invalid = map_error(FcmError::InvalidMessage("bad json".to_string()));
        assert_eq!(invalid.code, "InvalidMessage");
        assert_eq!(invalid.message, "bad json");
    }

    #[test]
    fn test_token_rejections() {
        assert!(is_token_rejection("NotRegistered"));
        assert!(!is_token_rejection("Unavailable"));
    }
}
