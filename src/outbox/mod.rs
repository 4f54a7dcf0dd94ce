//! The transactional outbox poller: the leased claim loop of §4.5 that
//! turns pending `outbox` rows into dispatch calls against
//! [`crate::engine::StepExecutor`] and [`crate::engine::CompensationScheduler`].

mod poller;

pub use poller::{OutboxPoller, PollerMetrics};
