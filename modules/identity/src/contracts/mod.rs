//! Contract types for events emitted by the identity module
//!
//! Field names must match the published JSON exactly; consumers in other
//! modules decode these payloads.

pub mod user_created_v1;

pub use user_created_v1::*;
