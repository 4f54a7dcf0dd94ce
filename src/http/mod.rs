//! The HTTP Action Executor (§4.3): invokes one rendered action or
//! compensation request and classifies the outcome for the retry policy.

mod executor;

pub use executor::{ExecutionOptions, HttpActionExecutor, HttpExecutionResult};
