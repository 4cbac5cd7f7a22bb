//! Service Layer
//!
//! The event system (client handle plus control loop) and the polling
//! filter registry built on top of it.

mod event_loop;
pub mod event_system;
pub mod filter_manager;

pub use event_system::{EventSystem, TopicRegistration};
pub use filter_manager::{FilterChanges, FilterId, FilterManager};
