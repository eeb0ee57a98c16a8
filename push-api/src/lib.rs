//! HTTP surface over the registry and dispatcher.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use server::{router, run};
pub use state::ApiState;
