//! Push transport and fan-out: vendor gateways, message composition, the
//! dispatcher and the delivery-job consumer.

pub mod apns;
pub mod composer;
pub mod consumer;
pub mod dispatcher;
pub mod fcm;
pub mod gateway;
pub mod log;

pub use composer::{from_notification, from_request, MessageRequest};
pub use consumer::{run, DeliveryJob};
pub use dispatcher::Dispatcher;
pub use gateway::{GatewayRouter, PushGateway};
pub use log::LogGateway;
