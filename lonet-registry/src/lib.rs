//! On-disk SQLite registry shared by every subnetwork joined to the same
//! lonet network, mapping virtual hostnames to the real loopback address
//! currently serving them.

mod error;
mod pool;
mod registry;

pub use error::{RegistryError, RegistryInnerError};
pub use pool::ConnectionPool;
pub use registry::Registry;
