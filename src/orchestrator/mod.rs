//! Task execution: workers and the answer composition pipeline.

pub mod composer;
pub mod worker;

pub use composer::ResponseComposer;
pub use worker::Worker;
