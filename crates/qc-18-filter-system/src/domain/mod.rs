//! Domain Layer
//!
//! Subscription kinds, log matching criteria, the subscription value object
//! and configuration. No I/O; the control loop lives in `service/`.

pub mod config;
pub mod criteria;
pub mod kind;
pub mod subscription;

pub use config::FilterSystemConfig;
pub use criteria::{BlockSpec, BlockTag, FilterCriteria};
pub use kind::SubscriptionKind;
pub use subscription::{
    Notification, Subscription, SubscriptionId, SubscriptionReceiver, Unsubscriber,
};
