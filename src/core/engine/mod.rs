//! External collaborators of the run worker.
//!
//! - `checkout` - source snapshot acquisition
//! - `runtime` - language runtime provisioning
//! - `executor` - single pipeline step execution
//!
//! Each concern is a trait with one local, shell-based implementation. The
//! orchestrator only sees the traits.

pub mod checkout;
pub mod executor;
pub mod runtime;

pub use checkout::{GitCheckout, SourceCheckout};
pub use executor::{step_environment, ShellStepExecutor, StepExecution, StepExecutor, StepInvocation};
pub use runtime::{RuntimeProvisioner, ShellRuntimeProvisioner};
