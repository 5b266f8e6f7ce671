//! bankcoord common types
//!
//! Shared identifiers, transaction states, lock modes and the error type used
//! by the coordinator and the reference branch.

pub mod identifiers;
pub mod transaction;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use transaction::*;
pub use error::*;
pub use time::*;
