//! `relay-core` — the durable work record model.
//!
//! This crate contains the **pure domain** of the engine: identifiers, the
//! execution-record state machine shared by events, requests and sagas, the
//! retry/backoff policy, and the saga sub-process model. No storage, no
//! threads, no IO.

pub mod id;
pub mod kind;
pub mod policy;
pub mod record;
pub mod saga;

pub use id::RecordId;
pub use kind::WorkKind;
pub use policy::RetryPolicy;
pub use record::{ExecutionRecord, RecordState};
pub use saga::{SagaStep, StepState};
