//! The shared store every server instance talks to: atomic counters,
//! per-field hash counters and publish/subscribe channels.

mod error;
mod memory;
mod redis_store;
mod store;

pub use error::FleetError;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::{with_timeout, FleetStore, Subscription};
