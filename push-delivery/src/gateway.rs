use async_trait::async_trait;
use push_core::config::DeliveryConfig;
use push_core::{GatewayError, Platform, PushMessage};
use std::collections::HashMap;
use std::sync::Arc;

use crate::apns::ApnsGateway;
use crate::fcm::FcmGateway;
use crate::log::LogGateway;

/// Transport to one vendor push service.
///
/// Failures carry the vendor's own error code so the Failure Policy can
/// classify them.
#[async_trait]
pub trait PushGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the gateway-assigned message id.
    async fn send_to_token(&self, token: &str, message: &PushMessage)
        -> Result<String, GatewayError>;

    async fn send_to_topic(&self, topic: &str, message: &PushMessage)
        -> Result<String, GatewayError>;

    async fn validate_token(&self, token: &str) -> Result<bool, GatewayError>;
}

/// Picks the gateway for a token's platform.
#[derive(Clone)]
pub struct GatewayRouter {
    default: Arc<dyn PushGateway>,
    by_platform: HashMap<Platform, Arc<dyn PushGateway>>,
}

impl GatewayRouter {
    pub fn new(default: Arc<dyn PushGateway>) -> Self {
        Self {
            default,
            by_platform: HashMap::new(),
        }
    }

    pub fn with_platform(mut self, platform: Platform, gateway: Arc<dyn PushGateway>) -> Self {
        self.by_platform.insert(platform, gateway);
        self
    }

    /// FCM (or the log gateway without credentials) for everything, APNs for
    /// `ios` when its credentials are present.
    pub fn from_config(config: &DeliveryConfig) -> anyhow::Result<Self> {
        let default: Arc<dyn PushGateway> = match FcmGateway::new(config) {
            Some(fcm) => Arc::new(fcm),
            None => {
                tracing::warn!("FCM not configured, falling back to log-only delivery");
                Arc::new(LogGateway::new())
            }
        };

        let mut router = Self::new(default);
        if let Some(apns) = ApnsGateway::new(config)? {
            router = router.with_platform(Platform::Ios, Arc::new(apns));
        }

        tracing::info!(
            "Push gateways: default={}, ios={}",
            router.default.name(),
            router.route(Some(Platform::Ios)).name()
        );
        Ok(router)
    }

    pub fn route(&self, platform: Option<Platform>) -> &Arc<dyn PushGateway> {
        platform
            .and_then(|p| self.by_platform.get(&p))
            .unwrap_or(&self.default)
    }

    pub fn default_gateway(&self) -> &Arc<dyn PushGateway> {
        &self.default
    }
}
