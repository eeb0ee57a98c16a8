pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod policy;
pub mod redis;
pub mod redpanda;
pub mod schema;
pub mod store;
pub mod types;

pub use config::Config;
pub use context::PushContext;
pub use db::DbPool;
pub use error::{GatewayError, PushError};
pub use policy::{FailureKind, FailurePolicy};
pub use redis::RedisPool;
pub use redpanda::RedpandaConsumer;
pub use store::{MemoryTokenStore, PgTokenStore, TokenStore};
pub use types::{
    BatchResult, DeviceToken, MultiUserResult, NewDeviceToken, Notification, Platform,
    PlatformCount, PlatformStats, Priority, PushMessage, PushResult, TokenStats, UserId,
    token_preview,
};
