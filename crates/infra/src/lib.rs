//! Infrastructure layer: metadata store, transactions, job persistence,
//! admission, maintenance scheduling and the service facade.

pub mod admission;
pub mod config;
pub mod executable;
pub mod maintenance;
pub mod meta_store;
pub mod offset;
pub mod orchestrator;
pub mod retry;
pub mod service;
pub mod transaction;


pub use config::{ConfigError, MaintenanceConfig, OrchestratorConfig};
pub use meta_store::{InMemoryMetaStore, MetaKey, MetaStore, MetaStoreError, PostgresMetaStore};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorError};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use service::{JobService, JobView, ServiceError};
pub use transaction::{run_in_transaction, Transaction, TransactionError};
