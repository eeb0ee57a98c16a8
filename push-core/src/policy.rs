//! Failure Policy: classification of gateway error signals.
//!
//! Classification is a lookup in a table keyed by the normalized gateway
//! code (ASCII alphanumerics, lower-cased), so `registration-token-not-registered`,
//! `RegistrationTokenNotRegistered` and `REGISTRATION_TOKEN_NOT_REGISTERED`
//! all hit the same entry. Operators extend the table through configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::RegistryConfig;
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, rate limit, gateway outage. Counts toward the threshold.
    Transient,
    /// Token unregistered, malformed or bound to another sender.
    Permanent,
    /// Token belongs to another user.
    Ownership,
    /// Message or token rejected before any network call.
    Validation,
    /// Caller cancelled the fan-out before this send started.
    Cancelled,
}

impl FailureKind {
    /// Whether a failure of this kind is recorded against the token.
    pub fn affects_token_health(self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::Permanent)
    }
}

const DEFAULT_TABLE: &[(&str, FailureKind)] = &[
    // FCM
    ("unregistered", FailureKind::Permanent),
    ("notregistered", FailureKind::Permanent),
    ("registrationtokennotregistered", FailureKind::Permanent),
    ("invalidregistration", FailureKind::Permanent),
    ("invalidregistrationtoken", FailureKind::Permanent),
    ("missingregistration", FailureKind::Permanent),
    ("mismatchsenderid", FailureKind::Permanent),
    ("senderidmismatch", FailureKind::Permanent),
    ("mismatchedcredential", FailureKind::Permanent),
    ("invalidpackagename", FailureKind::Permanent),
    ("unavailable", FailureKind::Transient),
    ("internal", FailureKind::Transient),
    ("internalservererror", FailureKind::Transient),
    ("internalerror", FailureKind::Transient),
    ("quotaexceeded", FailureKind::Transient),
    ("messageratexceeded", FailureKind::Transient),
    ("devicemessageratexceeded", FailureKind::Transient),
    ("topicsmessageratexceeded", FailureKind::Transient),
    ("serverunavailable", FailureKind::Transient),
    ("unauthorized", FailureKind::Transient),
    ("invalidmessage", FailureKind::Validation),
    ("invalidparameters", FailureKind::Validation),
    ("invaliddatakey", FailureKind::Validation),
    ("invalidttl", FailureKind::Validation),
    ("messagetoobig", FailureKind::Validation),
    // APNs
    ("baddevicetoken", FailureKind::Permanent),
    ("devicetokennotfortopic", FailureKind::Permanent),
    ("topicdisallowed", FailureKind::Permanent),
    ("expiredprovidertoken", FailureKind::Transient),
    ("toomanyrequests", FailureKind::Transient),
    ("toomanyprovidertokenupdates", FailureKind::Transient),
    ("serviceunavailable", FailureKind::Transient),
    ("shutdown", FailureKind::Transient),
    ("payloadempty", FailureKind::Validation),
    ("payloadtoolarge", FailureKind::Validation),
    ("badtopic", FailureKind::Validation),
    ("badpriority", FailureKind::Validation),
    // Local signals
    ("timeout", FailureKind::Transient),
    ("connectionerror", FailureKind::Transient),
    ("topicunsupported", FailureKind::Validation),
    ("tokenowned", FailureKind::Ownership),
    ("notowner", FailureKind::Ownership),
];

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone)]
pub struct FailurePolicy {
    table: HashMap<String, FailureKind>,
    threshold: u32,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl FailurePolicy {
    pub fn new(threshold: u32) -> Self {
        let table = DEFAULT_TABLE
            .iter()
            .map(|(code, kind)| (code.to_string(), *kind))
            .collect();
        Self {
            table,
            threshold: threshold.max(1),
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.failure_threshold)
            .with_codes(&config.permanent_error_codes, FailureKind::Permanent)
            .with_codes(&config.transient_error_codes, FailureKind::Transient)
    }

    /// Adds or overrides table entries.
    pub fn with_codes<S: AsRef<str>>(mut self, codes: &[S], kind: FailureKind) -> Self {
        for code in codes {
            let key = normalize(code.as_ref());
            if !key.is_empty() {
                self.table.insert(key, kind);
            }
        }
        self
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Unknown codes are treated as transient: they count toward the
    /// threshold but never deactivate on their own.
    pub fn classify(&self, code: &str) -> FailureKind {
        self.table
            .get(&normalize(code))
            .copied()
            .unwrap_or(FailureKind::Transient)
    }

    pub fn classify_error(&self, err: &GatewayError) -> FailureKind {
        self.classify(&err.code)
    }

    /// Whether a token that just failed with `kind`, and now has
    /// `failure_count` consecutive failures, must be deactivated.
    pub fn should_deactivate(&self, kind: FailureKind, failure_count: u32) -> bool {
        match kind {
            FailureKind::Permanent => true,
            FailureKind::Transient => failure_count >= self.threshold,
            FailureKind::Ownership | FailureKind::Validation | FailureKind::Cancelled => false,
        }
    }
}

fn normalize(code: &str) -> String {
    code.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
