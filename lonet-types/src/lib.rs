//! Address type and well-defined error taxonomy shared by every lonet crate.
//!
//! This is the one leaf of the workspace: `virtnet`, `lonet-registry` and the
//! `lonet` adapter all depend on it, it depends on nothing of its own.

mod addr;
mod error;

pub use addr::{Addr, AddrParseError};
pub use error::{deepest_cause, AnyError, VirtnetError};
