//! Per-kind supervisors and the engine that wires them together.
//!
//! A supervisor is the execution façade for one work kind: it validates
//! input, creates the durable record, resolves the handler and dispatches,
//! and persists the outcome. The `Engine` owns one supervisor per kind plus
//! the shared registry, ledger and delay pool; supervisors reach their
//! siblings through it when a payload belongs to another kind.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use relay_core::{ExecutionRecord, RecordId, WorkKind};

use crate::error::EngineError;
use crate::handler::Registry;
use crate::ledger::Ledger;
use crate::pool::DelayPool;
use crate::saga::SagaContext;
use crate::work::Work;

/// Resume fast-forward iteration cap. Defends against a backoff policy that
/// never advances `next_try_time`.
const MAX_RESUME_FAST_FORWARD: u32 = 65535;

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Owning service name; records and lock keys are scoped by it.
    pub svc_name: String,
    /// Worker threads in the delayed-dispatch pool.
    pub delay_pool_size: usize,
    /// Schedules due within this window start executing right away instead
    /// of waiting for the compensation scheduler.
    pub schedule_threshold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            svc_name: "relay".to_string(),
            delay_pool_size: 4,
            schedule_threshold: Duration::from_secs(120),
        }
    }
}

impl EngineConfig {
    pub fn with_svc_name(mut self, svc_name: impl Into<String>) -> Self {
        self.svc_name = svc_name.into();
        self
    }

    pub fn with_delay_pool_size(mut self, size: usize) -> Self {
        self.delay_pool_size = size;
        self
    }

    pub fn with_schedule_threshold(mut self, threshold: Duration) -> Self {
        self.schedule_threshold = threshold;
        self
    }
}

/// The wired engine: three supervisors over a shared registry, ledger and
/// delay pool. Construct with [`Engine::new`]; everything is explicit
/// dependency injection, there are no process-wide singletons.
pub struct Engine {
    config: EngineConfig,
    registry: Registry,
    ledger: Arc<dyn Ledger>,
    pool: DelayPool,
    event: Supervisor,
    request: Supervisor,
    saga: Supervisor,
}

impl Engine {
    pub fn new(config: EngineConfig, registry: Registry, ledger: Arc<dyn Ledger>) -> Arc<Self> {
        let pool = DelayPool::new(config.delay_pool_size);
        Arc::new_cyclic(|weak: &Weak<Engine>| Engine {
            event: Supervisor::new(weak.clone(), WorkKind::Event),
            request: Supervisor::new(weak.clone(), WorkKind::Request),
            saga: Supervisor::new(weak.clone(), WorkKind::Saga),
            config,
            registry,
            ledger,
            pool,
        })
    }

    pub fn events(&self) -> &Supervisor {
        &self.event
    }

    pub fn requests(&self) -> &Supervisor {
        &self.request
    }

    pub fn sagas(&self) -> &Supervisor {
        &self.saga
    }

    pub fn supervisor(&self, kind: WorkKind) -> &Supervisor {
        match kind {
            WorkKind::Event => &self.event,
            WorkKind::Request => &self.request,
            WorkKind::Saga => &self.saga,
        }
    }

    pub fn svc_name(&self) -> &str {
        &self.config.svc_name
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Route by the payload's own kind.
    pub fn send(&self, work: Work) -> Result<Value, EngineError> {
        self.supervisor(work.kind).send(work)
    }

    /// Stop the delay pool. Records already persisted stay in the ledger
    /// and are picked up by compensation on the next start.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

/// Execution façade for one work kind.
pub struct Supervisor {
    engine: Weak<Engine>,
    kind: WorkKind,
}

impl Supervisor {
    fn new(engine: Weak<Engine>, kind: WorkKind) -> Self {
        Self { engine, kind }
    }

    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    fn engine(&self) -> Result<Arc<Engine>, EngineError> {
        self.engine.upgrade().ok_or(EngineError::Shutdown)
    }

    /// Execute synchronously: record, dispatch inline, persist the outcome,
    /// return the handler's result (or propagate its failure).
    pub fn send(&self, work: Work) -> Result<Value, EngineError> {
        let engine = self.engine()?;
        if work.kind != self.kind {
            // Not ours; hand off to the sibling that owns this kind.
            return engine.supervisor(work.kind).send(work);
        }
        self.validate(&engine, &work)?;

        let now = Utc::now();
        let mut record = self.create_record(&engine, &work, now);
        if !record.begin(now) {
            engine.ledger().save(&record)?;
            return Err(EngineError::NotEligible(record.id));
        }
        engine.ledger().save(&record)?;
        debug!(record_id = %record.id, work_type = %work.work_type, kind = %self.kind, "dispatching inline");
        self.dispatch(&engine, work, record)
    }

    /// Create the record for execution at `at`; due (or nearly due)
    /// schedules begin immediately on the delay pool. Returns the record id.
    pub fn schedule(&self, work: Work, at: DateTime<Utc>) -> Result<RecordId, EngineError> {
        let engine = self.engine()?;
        if work.kind != self.kind {
            return engine.supervisor(work.kind).schedule(work, at);
        }
        self.validate(&engine, &work)?;

        let mut record = self.create_record(&engine, &work, at);
        let now = Utc::now();
        let threshold =
            chrono::Duration::from_std(engine.config.schedule_threshold).unwrap_or_default();
        if at <= now + threshold {
            record.begin(at);
        }
        engine.ledger().save(&record)?;
        let id = record.id;
        if record.is_running() {
            debug!(record_id = %id, work_type = %work.work_type, at = %at, "arming delayed dispatch");
            self.spawn_dispatch(&engine, work, record, at);
        }
        Ok(id)
    }

    /// Execute asynchronously, as soon as a worker is free.
    pub fn send_async(&self, work: Work) -> Result<RecordId, EngineError> {
        self.schedule(work, Utc::now())
    }

    /// Execute after `delay`.
    pub fn send_delayed(&self, work: Work, delay: Duration) -> Result<RecordId, EngineError> {
        self.schedule(
            work,
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
        )
    }

    /// Stored result of a completed record; `None` while it is still
    /// pending (or the id is unknown).
    pub fn result(&self, id: RecordId) -> Result<Option<Value>, EngineError> {
        let engine = self.engine()?;
        Ok(engine.ledger().get_by_id(id)?.and_then(|r| r.result))
    }

    /// Operator-triggered retry: reload and re-dispatch unconditionally,
    /// ignoring `next_try_time`.
    pub fn retry(&self, id: RecordId) -> Result<Value, EngineError> {
        let engine = self.engine()?;
        let record = engine
            .ledger()
            .get_by_id(id)?
            .ok_or(EngineError::NotFound(id))?;
        if record.kind != self.kind {
            return engine.supervisor(record.kind).retry(id);
        }
        info!(record_id = %id, work_type = %record.work_type, "operator retry");
        let work = Work::from_record(&record);
        self.dispatch(&engine, work, record)
    }

    /// Cancel a pending record. In-flight dispatches past `begin` are not
    /// interrupted; cancellation only stops future attempts.
    pub fn cancel(&self, id: RecordId) -> Result<bool, EngineError> {
        let engine = self.engine()?;
        let mut record = engine
            .ledger()
            .get_by_id(id)?
            .ok_or(EngineError::NotFound(id))?;
        let cancelled = record.cancel(Utc::now());
        if cancelled {
            engine.ledger().save(&record)?;
        }
        Ok(cancelled)
    }

    /// Re-drive an overdue record on behalf of the compensation scheduler.
    ///
    /// Fast-forwards the record through `begin` cycles until its
    /// `next_try_time` clears `min_next_try_time` or it goes invalid, then
    /// persists it and dispatches if an attempt actually started. The
    /// fast-forward is capped; a backoff policy that fails to advance the
    /// clock is a configuration bug, not a reason to spin.
    pub fn resume(
        &self,
        mut record: ExecutionRecord,
        min_next_try_time: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let engine = self.engine()?;
        let now = Utc::now();

        record.begin(record.next_try_time.min(now));
        let mut remaining = MAX_RESUME_FAST_FORWARD;
        while record.is_valid() && record.next_try_time < min_next_try_time {
            let at = record.next_try_time;
            record.begin(at);
            remaining -= 1;
            if remaining == 0 {
                return Err(EngineError::ResumeStalled(record.id));
            }
        }
        engine.ledger().save(&record)?;

        if record.is_running() {
            let work = Work::from_record(&record);
            debug!(record_id = %record.id, work_type = %work.work_type, "resuming record");
            self.spawn_dispatch(&engine, work, record, Utc::now());
        } else if record.is_invalid() {
            warn!(record_id = %record.id, state = %record.state, "record is a dead end, not resuming");
        } else {
            debug!(record_id = %record.id, state = %record.state, "record not resumable");
        }
        Ok(())
    }

    /// Overdue records owned by this service and kind.
    pub fn get_by_next_try_time(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, EngineError> {
        let engine = self.engine()?;
        let records =
            engine
                .ledger()
                .get_by_next_try_time(engine.svc_name(), self.kind, before, limit)?;
        Ok(records)
    }

    /// Move terminal records past their expiry into the archive store.
    pub fn archive_by_expire_at(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, EngineError> {
        let engine = self.engine()?;
        let moved =
            engine
                .ledger()
                .archive_by_expire_at(engine.svc_name(), self.kind, before, limit)?;
        Ok(moved)
    }

    fn validate(&self, engine: &Engine, work: &Work) -> Result<(), EngineError> {
        let outcome = match self.kind {
            WorkKind::Saga => engine
                .registry()
                .saga_handler_for(&work.work_type)
                .ok_or_else(|| EngineError::HandlerNotFound(work.work_type.clone()))?
                .validate(&work.payload),
            _ => engine
                .registry()
                .handler_for(&work.work_type)
                .ok_or_else(|| EngineError::HandlerNotFound(work.work_type.clone()))?
                .validate(&work.payload),
        };
        outcome.map_err(EngineError::Validation)
    }

    fn create_record(
        &self,
        engine: &Engine,
        work: &Work,
        schedule_at: DateTime<Utc>,
    ) -> ExecutionRecord {
        ExecutionRecord::init(
            self.kind,
            work.work_type.clone(),
            work.payload.clone(),
            engine.svc_name(),
            schedule_at,
            engine.registry().policy_for(&work.work_type),
        )
    }

    /// Run the handler and persist the outcome onto the record.
    fn dispatch(
        &self,
        engine: &Arc<Engine>,
        work: Work,
        record: ExecutionRecord,
    ) -> Result<Value, EngineError> {
        match self.kind {
            WorkKind::Saga => self.dispatch_saga(engine, work, record),
            _ => self.dispatch_plain(engine, work, record),
        }
    }

    fn dispatch_plain(
        &self,
        engine: &Arc<Engine>,
        work: Work,
        mut record: ExecutionRecord,
    ) -> Result<Value, EngineError> {
        let outcome = invoke(engine, &work);
        let now = Utc::now();
        match outcome {
            Ok(value) => {
                record.end(now, value.clone());
                engine.ledger().save(&record)?;
                debug!(record_id = %record.id, work_type = %work.work_type, "dispatch succeeded");
                Ok(value)
            }
            Err(err) => {
                record.occurred_exception(now, &err.to_string());
                engine.ledger().save(&record)?;
                warn!(record_id = %record.id, work_type = %work.work_type, error = %err, "dispatch failed");
                Err(err)
            }
        }
    }

    fn dispatch_saga(
        &self,
        engine: &Arc<Engine>,
        work: Work,
        record: ExecutionRecord,
    ) -> Result<Value, EngineError> {
        let handler = engine
            .registry()
            .saga_handler_for(&work.work_type)
            .ok_or_else(|| EngineError::HandlerNotFound(work.work_type.clone()))?;
        let record_id = record.id;

        // The context is confined to this dispatch; it dies (and gives the
        // record back) whether the handler returns or fails.
        let ctx = SagaContext::new(engine.clone(), record);
        let outcome = (|| {
            for interceptor in engine.registry().interceptors_for(&work.work_type) {
                interceptor.pre_dispatch(&work)?;
            }
            let value = handler.exec(&ctx, work.payload.clone())?;
            for interceptor in engine.registry().interceptors_for(&work.work_type) {
                interceptor.post_dispatch(&work, &value)?;
            }
            Ok::<_, EngineError>(value)
        })();

        let mut record = ctx.into_record();
        let now = Utc::now();
        match outcome {
            Ok(value) => {
                record.end(now, value.clone());
                engine.ledger().save(&record)?;
                debug!(record_id = %record_id, work_type = %work.work_type, "saga succeeded");
                Ok(value)
            }
            Err(err) => {
                record.occurred_exception(now, &err.to_string());
                engine.ledger().save(&record)?;
                warn!(record_id = %record_id, work_type = %work.work_type, error = %err, "saga failed");
                Err(err)
            }
        }
    }

    fn spawn_dispatch(
        &self,
        engine: &Arc<Engine>,
        work: Work,
        record: ExecutionRecord,
        at: DateTime<Utc>,
    ) {
        let weak = Arc::downgrade(engine);
        let kind = self.kind;
        engine.pool.schedule_at(at, move || {
            let Some(engine) = weak.upgrade() else {
                return;
            };
            let record_id = record.id;
            if let Err(err) = engine.supervisor(kind).dispatch(&engine, work, record) {
                // Already captured onto the record; nothing to propagate to.
                debug!(record_id = %record_id, error = %err, "background dispatch failed");
            }
        });
    }
}

/// Interceptors around handler, all resolved from the explicit registry.
fn invoke(engine: &Engine, work: &Work) -> Result<Value, EngineError> {
    let handler = engine
        .registry()
        .handler_for(&work.work_type)
        .ok_or_else(|| EngineError::HandlerNotFound(work.work_type.clone()))?;
    for interceptor in engine.registry().interceptors_for(&work.work_type) {
        interceptor.pre_dispatch(work)?;
    }
    let value = handler.exec(work.payload.clone())?;
    for interceptor in engine.registry().interceptors_for(&work.work_type) {
        interceptor.post_dispatch(work, &value)?;
    }
    Ok(value)
}
