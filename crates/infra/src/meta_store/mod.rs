//! Versioned key/value metadata store boundary.

mod in_memory;
mod key;
mod postgres;
mod r#trait;

pub use in_memory::InMemoryMetaStore;
pub use key::MetaKey;
pub use postgres::PostgresMetaStore;
pub use r#trait::{MetaStore, MetaStoreError, MetaWrite, VersionedValue};
