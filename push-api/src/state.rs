use push_delivery::Dispatcher;
use push_registry::TokenRegistry;
use std::sync::Arc;

/// Handles shared by every request.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<TokenRegistry>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: Arc<str>,
}

impl ApiState {
    pub fn new(dispatcher: Dispatcher, jwt_secret: &str) -> Self {
        Self {
            registry: dispatcher.registry().clone(),
            dispatcher,
            jwt_secret: Arc::from(jwt_secret),
        }
    }
}
