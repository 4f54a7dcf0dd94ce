//! The two outbox message handlers that drive a run forward: the step
//! executor (§4.6) and the compensation scheduler (§4.7). Both are stateless
//! — every decision is read fresh from the store on each dispatch.

mod compensation;
mod step_executor;

pub use compensation::CompensationScheduler;
pub use step_executor::StepExecutor;
