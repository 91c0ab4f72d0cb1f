//! Saga sub-process model.
//!
//! A saga record owns a list of named steps. Each step is recorded before its
//! first execution and caches its result forever after, which is what makes
//! re-running a resumed saga from the top safe: already-executed steps short
//! circuit to the cached result instead of invoking their handler again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::ExecutionRecord;

/// Execution state of one saga step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Init,
    Executing,
    Executed,
    Exception,
}

/// A named, idempotently re-enterable step within a saga record.
///
/// Owned exclusively by its parent record; never addressed independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStep {
    /// Stable step name within the saga.
    pub process_code: String,
    pub state: StepState,
    pub param: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub tried_count: u32,
    pub last_try_time: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn step(&self, process_code: &str) -> Option<&SagaStep> {
        self.processes
            .iter()
            .find(|p| p.process_code == process_code)
    }

    fn step_mut(&mut self, process_code: &str) -> Option<&mut SagaStep> {
        self.processes
            .iter_mut()
            .find(|p| p.process_code == process_code)
    }

    /// Whether the step already ran to completion. Once this returns `true`
    /// the stored result is authoritative and the step must not re-run.
    pub fn is_step_executed(&self, process_code: &str) -> bool {
        self.step(process_code)
            .is_some_and(|p| p.state == StepState::Executed)
    }

    pub fn step_result(&self, process_code: &str) -> Option<Value> {
        self.step(process_code).and_then(|p| p.result.clone())
    }

    /// Record a step attempt starting. Creates the step entry on first use.
    pub fn begin_step(&mut self, now: DateTime<Utc>, process_code: &str, param: Value) {
        match self.step_mut(process_code) {
            Some(step) => {
                step.state = StepState::Executing;
                step.param = param;
                step.tried_count += 1;
                step.last_try_time = now;
            }
            None => self.processes.push(SagaStep {
                process_code: process_code.to_string(),
                state: StepState::Executing,
                param,
                result: None,
                error: None,
                tried_count: 1,
                last_try_time: now,
            }),
        }
    }

    /// Record a step finishing successfully; the result becomes the cached
    /// answer for every later re-entry.
    pub fn end_step(&mut self, now: DateTime<Utc>, process_code: &str, result: Value) {
        if let Some(step) = self.step_mut(process_code) {
            step.state = StepState::Executed;
            step.result = Some(result);
            step.error = None;
            step.last_try_time = now;
        }
    }

    /// Record a step failure.
    pub fn step_occurred_exception(
        &mut self,
        now: DateTime<Utc>,
        process_code: &str,
        error: &str,
    ) {
        if let Some(step) = self.step_mut(process_code) {
            if step.state == StepState::Executed {
                return;
            }
            step.state = StepState::Exception;
            step.error = Some(error.to_string());
            step.last_try_time = now;
        }
    }
}
