//! hearth — a persistent conversational agent core.
//!
//! Everything the agent does is durable: dialogue becomes message rows,
//! answering becomes tasks and steps in a libSQL-backed queue, and every
//! inference call leaves a metric. A process restart loses nothing except
//! work in flight, which startup recovery settles as failed.

pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod queue;
pub mod session;
pub mod steps;
pub mod store;
pub mod tokens;
pub mod vector;

pub use error::{Error, Result};

/// Crate version, stamped into rows written by this process.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
