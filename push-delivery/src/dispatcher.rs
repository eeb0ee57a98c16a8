//! Fan-out engine.
//!
//! Resolves targets through the registry, sends through the gateway router
//! and feeds every per-token outcome back into the registry. Fan-out is
//! bounded by two semaphores' worth of configuration: devices in flight per
//! user and users in flight per multi-user send.

use futures::stream::{self, StreamExt};
use push_core::config::DispatchConfig;
use push_core::error::{PushError, Result};
use push_core::{
    token_preview, BatchResult, DeviceToken, FailureKind, MultiUserResult, PushMessage,
    PushResult, UserId,
};
use push_registry::TokenRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::gateway::GatewayRouter;

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<TokenRegistry>,
    gateways: Arc<GatewayRouter>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TokenRegistry>,
        gateways: Arc<GatewayRouter>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            gateways,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<TokenRegistry> {
        &self.registry
    }

    fn check_token(&self, token: &str) -> Result<()> {
        self.registry.validate_token(token)
    }

    /// Sends to one raw token.
    ///
    /// Malformed tokens and messages are rejected with `Err` before any
    /// gateway call. Delivery failures come back as an unsuccessful
    /// `PushResult` and, for registered tokens, update the token's health.
    pub async fn send_to_device(&self, token: &str, message: &PushMessage) -> Result<PushResult> {
        self.check_token(token)?;
        message.validate()?;

        let record = match self.registry.find_by_token(token).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    "Token lookup failed for {}, sending without health tracking: {}",
                    token_preview(token),
                    e
                );
                None
            }
        };
        Ok(self.deliver(token, record.as_ref(), message).await)
    }

    async fn deliver(
        &self,
        token: &str,
        record: Option<&DeviceToken>,
        message: &PushMessage,
    ) -> PushResult {
        let gateway = self.gateways.route(record.map(|r| r.platform));

        match gateway.send_to_token(token, message).await {
            Ok(message_id) => {
                tracing::debug!(
                    "Delivered to {} via {}",
                    token_preview(token),
                    gateway.name()
                );
                if record.is_some() {
                    if let Err(e) = self.registry.record_success(token).await {
                        tracing::warn!(
                            "Failed to record success for {}: {}",
                            token_preview(token),
                            e
                        );
                    }
                }
                PushResult::delivered(token, message_id)
            }
            Err(err) => {
                let kind = self.registry.policy().classify_error(&err);
                tracing::warn!(
                    "Delivery to {} via {} failed ({:?}): {}",
                    token_preview(token),
                    gateway.name(),
                    kind,
                    err
                );
                if record.is_some() && kind.affects_token_health() {
                    if let Err(e) = self.registry.record_failure(token, &err).await {
                        tracing::warn!(
                            "Failed to record failure for {}: {}",
                            token_preview(token),
                            e
                        );
                    }
                }
                PushResult::failed(token, kind, err.code, err.message)
            }
        }
    }

    pub async fn send_to_user(&self, user_id: UserId, message: &PushMessage) -> Result<BatchResult> {
        self.send_to_user_until(user_id, message, &CancellationToken::new())
            .await
    }

    /// Sends to every active device of `user_id`.
    ///
    /// A user without devices yields an empty batch. Once `cancel` fires no
    /// new sends start; in-flight ones finish and the rest are reported as
    /// cancelled, so the batch always holds one result per device.
    pub async fn send_to_user_until(
        &self,
        user_id: UserId,
        message: &PushMessage,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        message.validate()?;
        let devices = self.registry.find_active_by_user(user_id).await?;
        if devices.is_empty() {
            tracing::debug!("User {} has no active devices", user_id);
            return Ok(BatchResult::default());
        }

        let results = self.fan_out(devices, Arc::new(message.clone()), cancel).await;
        let batch = BatchResult::from_results(results);
        tracing::info!(
            "Sent to user {}: {}/{} delivered",
            user_id,
            batch.success_count,
            batch.total_sent
        );
        Ok(batch)
    }

    async fn fan_out(
        &self,
        devices: Vec<DeviceToken>,
        message: Arc<PushMessage>,
        cancel: &CancellationToken,
    ) -> Vec<PushResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.device_concurrency.max(1)));
        let mut slots: Vec<Option<PushResult>> = vec![None; devices.len()];
        let mut tasks = JoinSet::new();

        for (index, device) in devices.iter().cloned().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let dispatcher = self.clone();
            let message = message.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = match dispatcher.check_token(&device.token) {
                    Ok(()) => {
                        dispatcher
                            .deliver(&device.token, Some(&device), &message)
                            .await
                    }
                    Err(e) => PushResult::failed(
                        &device.token,
                        FailureKind::Validation,
                        e.code(),
                        e.to_string(),
                    ),
                };
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => tracing::error!("Device send task failed: {}", e),
            }
        }

        let cancelled = cancel.is_cancelled();
        slots
            .into_iter()
            .zip(devices)
            .map(|(slot, device)| {
                slot.unwrap_or_else(|| {
                    if cancelled {
                        PushResult::cancelled(device.token)
                    } else {
                        PushResult::failed(
                            device.token,
                            FailureKind::Transient,
                            "DISPATCH_TASK_FAILED",
                            "send task ended without a result",
                        )
                    }
                })
            })
            .collect()
    }

    pub async fn send_to_multiple_users(
        &self,
        user_ids: &[UserId],
        message: &PushMessage,
    ) -> Result<MultiUserResult> {
        self.send_to_multiple_users_until(user_ids, message, &CancellationToken::new())
            .await
    }

    /// Sends to each distinct user in `user_ids`. A user whose devices cannot
    /// be resolved gets an empty result and an `unresolved` entry; the others
    /// are unaffected.
    pub async fn send_to_multiple_users_until(
        &self,
        user_ids: &[UserId],
        message: &PushMessage,
        cancel: &CancellationToken,
    ) -> Result<MultiUserResult> {
        message.validate()?;

        let mut seen = HashSet::new();
        let users: Vec<UserId> = user_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        let outcomes: Vec<(UserId, Result<BatchResult>)> = stream::iter(users.iter().copied())
            .map(move |user_id| async move {
                (
                    user_id,
                    self.send_to_user_until(user_id, message, cancel).await,
                )
            })
            .buffer_unordered(self.config.user_concurrency.max(1))
            .collect()
            .await;

        let mut result = MultiUserResult {
            total_users: users.len(),
            ..Default::default()
        };
        for (user_id, outcome) in outcomes {
            match outcome {
                Ok(batch) => result.record(user_id, batch),
                Err(e) => {
                    tracing::warn!("Could not send to user {}: {}", user_id, e);
                    result.record_unresolved(user_id, e.to_string());
                }
            }
        }

        tracing::info!(
            "Multi-user send: {} users, {}/{} delivered",
            result.total_users,
            result.success_count,
            result.total_sent
        );
        Ok(result)
    }

    /// Single gateway call. Never touches any token record.
    pub async fn send_to_topic(&self, topic: &str, message: &PushMessage) -> Result<PushResult> {
        validate_topic(topic)?;
        message.validate()?;

        let gateway = self.gateways.default_gateway();
        match gateway.send_to_topic(topic, message).await {
            Ok(message_id) => Ok(PushResult::delivered(topic, message_id)),
            Err(err) => {
                let kind = self.registry.policy().classify_error(&err);
                tracing::warn!("Topic send to {} failed ({:?}): {}", topic, kind, err);
                Ok(PushResult::failed(topic, kind, err.code, err.message))
            }
        }
    }

    /// `Ok(false)` for malformed or rejected tokens. A gateway error means the
    /// answer is unknown and comes back as `Err`.
    pub async fn validate_token(&self, token: &str) -> Result<bool> {
        if self.check_token(token).is_err() {
            return Ok(false);
        }

        let platform = match self.registry.find_by_token(token).await {
            Ok(record) => record.map(|r| r.platform),
            Err(_) => None,
        };
        let gateway = self.gateways.route(platform);
        gateway.validate_token(token).await.map_err(|err| {
            tracing::warn!(
                "Could not validate token {} via {}: {}",
                token_preview(token),
                gateway.name(),
                err
            );
            PushError::TransientDelivery {
                code: err.code,
                message: err.message,
            }
        })
    }
}

/// FCM topic names: `[a-zA-Z0-9-_.~%]+`.
pub fn validate_topic(topic: &str) -> Result<()> {
    let valid = !topic.is_empty()
        && topic.len() <= 900
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '%'));
    if valid {
        Ok(())
    } else {
        Err(PushError::Validation(format!("invalid topic name: {topic:?}")))
    }
}
