//! bankcoord Coordinator
//!
//! Mediates multi-account transactions across independent branches: locks
//! resources with read/write semantics, refuses lock waits that would
//! deadlock, and commits or aborts atomically with two-phase commit.

pub mod coordinator;
pub mod config;
pub mod rag;
pub mod lock_manager;
pub mod transaction;
pub mod commit_processor;
pub mod participant_manager;
pub mod session;
pub mod state;
pub mod metrics;

pub use coordinator::Coordinator;
pub use config::{CoordinatorConfig, LockGranularity};
