use async_trait::async_trait;
use push_core::{token_preview, GatewayError, PushMessage};
use uuid::Uuid;

use crate::gateway::PushGateway;

/// Gateway that only logs. Used when no vendor credentials are configured.
#[derive(Debug, Default, Clone)]
pub struct LogGateway;

impl LogGateway {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PushGateway for LogGateway {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send_to_token(
        &self,
        token: &str,
        message: &PushMessage,
    ) -> Result<String, GatewayError> {
        let message_id = Uuid::new_v4().to_string();
        tracing::info!(
            "[log push] token={} title={:?} priority={} data_keys={} id={}",
            token_preview(token),
            message.title,
            message.priority.as_str(),
            message.data.len(),
            message_id
        );
        Ok(message_id)
    }

    async fn send_to_topic(
        &self,
        topic: &str,
        message: &PushMessage,
    ) -> Result<String, GatewayError> {
        let message_id = Uuid::new_v4().to_string();
        tracing::info!(
            "[log push] topic={} title={:?} id={}",
            topic,
            message.title,
            message_id
        );
        Ok(message_id)
    }

    async fn validate_token(&self, _token: &str) -> Result<bool, GatewayError> {
        Ok(true)
    }
}
