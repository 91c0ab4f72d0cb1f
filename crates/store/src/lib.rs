//! `relay-store` — Postgres implementations of the engine's storage traits.
//!
//! Provides [`PostgresLedger`] and [`PostgresLocker`], backed by sqlx. The
//! engine's traits are synchronous (its supervisors and scheduler live on
//! plain threads), so both implementations own a small single-threaded tokio
//! runtime and bridge each call with `block_on`.

pub mod ledger;
pub mod locker;
pub mod schema;

pub use ledger::PostgresLedger;
pub use locker::PostgresLocker;
