//! # Shared Types Crate
//!
//! Value types that cross the boundary between the upstream event bus and
//! the subscription layer built on top of it.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: `Log`, `Header` and the primitive aliases are
//!   defined once here and re-used by every crate in the workspace.
//! - **Wire Conventions**: all types serialize the way Ethereum JSON-RPC
//!   clients expect them (camelCase keys, `0x`-prefixed hex for byte data).

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod entities;

pub use entities::*;
