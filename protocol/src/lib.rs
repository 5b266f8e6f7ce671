//! bankcoord protocol messages
//!
//! Newline-terminated ASCII messages exchanged between clients and the
//! coordinator, and between the coordinator and branches.

pub mod messages;

pub use messages::*;
