//! bankcoord Reference Branch
//!
//! An in-memory account ledger served over the branch line protocol. The
//! coordinator talks to any process that honours the same contract; this one
//! exists so the whole system can run and be tested locally.

pub mod config;
pub mod handler;
pub mod ledger;
pub mod server;

pub use config::BranchConfig;
pub use handler::{CallbackHandler, LedgerHandler, RequestHandler};
pub use ledger::Ledger;
pub use server::BranchServer;
