//! The store seam of §4.1: [`SagaStore`] plus its Postgres and in-memory
//! implementations.

pub mod memory;
pub mod postgres;
mod store;

pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use store::{
    AttemptRecord, CancelOutcome, CompensationFailureOutcome, OutboxMetrics, ReserveOutcome,
    SagaStore, StepFailureOutcome, StoreError,
};
