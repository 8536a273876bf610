//! Core abstractions for the messaging gateway.
//!
//! This crate provides the fundamental building blocks:
//! - `CanonicalMessage` - Transport-agnostic envelope routed over the bus
//! - `MessageBus` / `MemoryBus` - Publish/subscribe capability
//! - `MiddlewareStack` - Ordered message transformations
//! - Object storage trait

pub mod bus;
pub mod message;
pub mod middleware;
pub mod traits;

pub use bus::{MemoryBus, RoutingKey};
pub use message::{AckEvent, CanonicalMessage, DeliveryReport, Direction, SessionEvent};
pub use middleware::{
    AddressTranslator, DEFAULT_ENDPOINT, Middleware, MiddlewareConfig, MiddlewareStack,
};
pub use traits::{BusError, MessageBus, ObjectStore, ObjectStoreError, Subscription, consume};
