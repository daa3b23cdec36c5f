// Consistency tokens (zookies) and the bounded-wait consistency manager.

pub mod error;
pub mod manager;
pub mod zookie;

pub use error::{ConsistencyError, Result};
pub use manager::{ConsistencyConfig, ConsistencyManager, DefaultConsistency};
pub use zookie::{Zookie, ZookieSigner};
