//! service-core: Shared infrastructure for micros microservices.
pub mod config;
pub mod error;
pub mod observability;

pub use serde;
pub use serde_json;

