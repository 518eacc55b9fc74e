//! Persistence layer: schema, typed rows, and the async `Store` trait.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;
pub mod types;

pub use libsql_backend::LibSqlStore;
pub use traits::Store;
