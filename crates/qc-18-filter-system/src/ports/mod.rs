//! Ports Layer
//!
//! Traits the filter system depends on. The only outbound dependency is the
//! upstream event bus.

pub mod outbound;

pub use outbound::UpstreamBus;
