// Public modules
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod json;
pub mod observer;
pub mod orchestrator;
pub mod payload;
pub mod pipeline;
pub mod run;
pub mod store;

// Public modules for CLI access
pub mod defaults;
pub mod paths;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
