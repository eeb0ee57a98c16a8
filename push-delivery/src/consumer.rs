use anyhow::{anyhow, Result};
use push_core::config::RedpandaConfig;
use push_core::redpanda::create_consumer;
use push_core::{Notification, UserId};
use rdkafka::consumer::Consumer;
use rdkafka::Message;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::composer::from_notification;
use crate::dispatcher::Dispatcher;

/// Job published on the delivery topic by the notification producer.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryJob {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub user_ids: Option<Vec<UserId>>,
    pub notification: Notification,
}

impl DeliveryJob {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let job: DeliveryJob = serde_json::from_slice(payload)?;
        if job.recipients().is_empty() {
            return Err(anyhow!("Delivery job has no user_id or user_ids"));
        }
        Ok(job)
    }

    pub fn recipients(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.user_id.into_iter().collect();
        if let Some(more) = &self.user_ids {
            users.extend(more.iter().copied());
        }
        users
    }
}

pub async fn run(
    config: RedpandaConfig,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!("Starting delivery consumer");

    let consumer = create_consumer(&config)?;
    consumer.subscribe(&[config.delivery_topic.as_str()])?;

    tracing::info!("Subscribed to topic: {}", config.delivery_topic);

    let mut error_count = 0u32;
    let mut last_error_log = std::time::Instant::now();

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Delivery consumer shutting down");
                return Ok(());
            }
            received = consumer.recv() => received,
        };

        match received {
            Ok(message) => {
                error_count = 0;
                if let Some(payload) = message.payload() {
                    if let Err(e) = handle_delivery(&dispatcher, payload, &shutdown).await {
                        tracing::error!("Error processing delivery job: {}", e);
                    }
                }
            }
            Err(e) => {
                error_count += 1;
                // Log at most every 30 seconds
                if error_count == 1 || last_error_log.elapsed().as_secs() >= 30 {
                    tracing::warn!(
                        "Error receiving message from Redpanda (error count: {}): {}",
                        error_count,
                        e
                    );
                    last_error_log = std::time::Instant::now();
                }
                tokio::time::sleep(backoff(error_count)).await;
            }
        }
    }
}

/// 1s, 2s, 4s ... capped at 30s.
fn backoff(error_count: u32) -> Duration {
    let exponent = error_count.saturating_sub(1).min(5);
    Duration::from_secs(1 << exponent).min(Duration::from_secs(30))
}

pub async fn handle_delivery(
    dispatcher: &Dispatcher,
    payload: &[u8],
    shutdown: &CancellationToken,
) -> Result<()> {
    let job = DeliveryJob::parse(payload)?;
    let message = from_notification(&job.notification);
    let users = job.recipients();

    if let [user_id] = users.as_slice() {
        let batch = dispatcher
            .send_to_user_until(*user_id, &message, shutdown)
            .await?;
        tracing::debug!(
            "Notification {} to user {}: {}/{} delivered",
            job.notification.id,
            user_id,
            batch.success_count,
            batch.total_sent
        );
    } else {
        let result = dispatcher
            .send_to_multiple_users_until(&users, &message, shutdown)
            .await?;
        tracing::debug!(
            "Notification {} to {} users: {}/{} delivered",
            job.notification.id,
            result.total_users,
            result.success_count,
            result.total_sent
        );
    }
    Ok(())
}
