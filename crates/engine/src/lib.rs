//! `relay-engine` — supervisors, scheduling, and coordination.
//!
//! This crate turns the record model from `relay-core` into a running
//! engine: per-kind supervisors that create and dispatch records, the
//! handler/interceptor registry, the saga process context, a delayed-dispatch
//! pool, the compensation scheduler, and the storage/lock traits the
//! `relay-store` crate implements for Postgres. In-memory implementations of
//! both traits live here for tests and single-node deployments.

pub mod error;
pub mod handler;
pub mod ledger;
pub mod lock;
pub mod pool;
pub mod saga;
pub mod scheduler;
pub mod supervisor;
pub mod work;

pub use error::EngineError;
pub use handler::{Handler, Interceptor, Registry, SagaHandler};
pub use ledger::{InMemoryLedger, Ledger, LedgerError};
pub use lock::{InMemoryLocker, LockRow, Locker};
pub use pool::DelayPool;
pub use saga::SagaContext;
pub use scheduler::{CompensationScheduler, SchedulerConfig, SchedulerHandle};
pub use supervisor::{Engine, EngineConfig, Supervisor};
pub use work::Work;
