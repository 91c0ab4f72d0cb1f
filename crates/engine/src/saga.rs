//! Explicit saga execution context.
//!
//! The context is handed to every [`SagaHandler`](crate::handler::SagaHandler)
//! invocation by reference. It carries the engine (for sub-request dispatch)
//! and the saga's own record, and is the only way a handler touches step
//! state. Nothing here is ambient; a handler without a context cannot run a
//! sub-process.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use relay_core::{ExecutionRecord, RecordId};

use crate::error::EngineError;
use crate::supervisor::Engine;
use crate::work::Work;

/// Per-dispatch saga context. Lives exactly as long as one handler
/// invocation; [`into_record`](SagaContext::into_record) returns the record
/// to the supervisor afterwards.
pub struct SagaContext {
    engine: Arc<Engine>,
    record: Mutex<ExecutionRecord>,
}

impl SagaContext {
    pub(crate) fn new(engine: Arc<Engine>, record: ExecutionRecord) -> Self {
        Self {
            engine,
            record: Mutex::new(record),
        }
    }

    /// Id of the saga record this context belongs to.
    pub fn record_id(&self) -> RecordId {
        self.record.lock().unwrap().id
    }

    /// Run a named sub-process exactly once per saga.
    ///
    /// On the first call for `process_code` the step is persisted, the work
    /// is dispatched as a request, and the outcome lands on the step. Every
    /// later call (same run or a compensation re-run of the whole saga)
    /// returns the cached result without touching the handler again.
    pub fn exec_process(
        &self,
        process_code: &str,
        work: Work,
    ) -> Result<Value, EngineError> {
        {
            let record = self.record.lock().unwrap();
            if record.is_step_executed(process_code) {
                debug!(record_id = %record.id, process_code, "step already executed, serving cached result");
                return Ok(record.step_result(process_code).unwrap_or(Value::Null));
            }
        }

        let now = Utc::now();
        {
            let mut record = self.record.lock().unwrap();
            record.begin_step(now, process_code, work.payload.clone());
            self.engine.ledger().save(&record)?;
        }

        let outcome = self.engine.requests().send(work);

        let mut record = self.record.lock().unwrap();
        match outcome {
            Ok(value) => {
                record.end_step(Utc::now(), process_code, value.clone());
                self.engine.ledger().save(&record)?;
                Ok(value)
            }
            Err(err) => {
                record.step_occurred_exception(Utc::now(), process_code, &err.to_string());
                self.engine.ledger().save(&record)?;
                Err(err)
            }
        }
    }

    pub(crate) fn into_record(self) -> ExecutionRecord {
        self.record.into_inner().unwrap()
    }
}
