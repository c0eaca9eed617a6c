//! rf-store: backends for the external collaborators of the pipeline.
//!
//! - [`ledger`]: the durable job record ([`JobLedger`]) with in-memory and
//!   SQLite implementations.
//! - [`object`]: the media [`ObjectStore`] with in-memory and filesystem
//!   implementations, plus the capability-checked [`ScopedObjectStore`].
//! - [`vault`]: the [`SecretVault`] and its capability-checked
//!   [`ScopedVault`].

pub mod ledger;
pub mod migrations;
pub mod object;
pub mod pool;
pub mod vault;

pub use ledger::{JobLedger, MemoryLedger, SqliteLedger};
pub use object::{FsObjectStore, MemoryObjectStore, ObjectStore, ScopedObjectStore};
pub use pool::{get_conn, init_memory_pool, init_pool, DbPool, PooledConnection};
pub use vault::{MemoryVault, ScopedVault, SecretVault};
