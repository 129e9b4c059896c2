//! Persistent job store: trait, typed queries, and backends.

pub mod libsql_backend;
pub mod mem;
pub mod migrations;
pub mod query;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use mem::MemStore;
pub use query::{ResultFilter, Shard, WuFilter};
pub use traits::JobStore;
