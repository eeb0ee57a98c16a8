//! Device-token lifecycle: registration, ownership transfer and health tracking.

pub mod lock;
pub mod registry;

pub use lock::{LocalTokenLock, RedisTokenLock, TokenGuard, TokenLock};
pub use registry::{validate_token_shape, TokenRegistry};
