pub mod affinity;
pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod locks;
pub mod models;
pub mod retry;
pub mod store;

pub use affinity::StrengthLabel;
pub use config::RapportConfig;
pub use error::{RapportError, Result};
pub use locks::KeyedLocks;
pub use retry::RetryPolicy;
pub use store::{PgRelationshipStore, RelationshipStore};
