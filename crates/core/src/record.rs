//! The execution-record state machine.
//!
//! One persisted shape backs all three work kinds. The record owns its retry
//! accounting: every attempt goes through [`ExecutionRecord::begin`], which is
//! the single place where exhaustion, expiry and backoff gating are decided.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::RecordId;
use crate::kind::WorkKind;
use crate::policy::RetryPolicy;
use crate::saga::SagaStep;

/// Execution state of a record.
///
/// Valid states may still run ([`RecordState::is_valid`]); invalid states are
/// dead ends reached through cancellation, expiry or retry exhaustion; the
/// per-kind success state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Created, not yet attempted.
    Init,
    /// A request/saga attempt is in flight.
    Executing,
    /// An event delivery attempt is in flight.
    Delivering,
    /// Terminal success (request/saga).
    Executed,
    /// Terminal success (event).
    Delivered,
    /// Cancelled by the caller before completion.
    Cancelled,
    /// Past its absolute deadline.
    Expired,
    /// Out of retry attempts.
    Exhausted,
    /// Last attempt failed; eligible for retry.
    Exception,
}

impl RecordState {
    /// States from which another attempt may begin.
    pub fn is_valid(&self) -> bool {
        matches!(
            self,
            RecordState::Init
                | RecordState::Executing
                | RecordState::Delivering
                | RecordState::Exception
        )
    }

    /// Dead-end states that never run again but did not succeed.
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            RecordState::Cancelled | RecordState::Expired | RecordState::Exhausted
        )
    }

    /// Terminal success.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordState::Executed | RecordState::Delivered)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RecordState::Executing | RecordState::Delivering)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Init => "init",
            RecordState::Executing => "executing",
            RecordState::Delivering => "delivering",
            RecordState::Executed => "executed",
            RecordState::Delivered => "delivered",
            RecordState::Cancelled => "cancelled",
            RecordState::Expired => "expired",
            RecordState::Exhausted => "exhausted",
            RecordState::Exception => "exception",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "init" => Some(RecordState::Init),
            "executing" => Some(RecordState::Executing),
            "delivering" => Some(RecordState::Delivering),
            "executed" => Some(RecordState::Executed),
            "delivered" => Some(RecordState::Delivered),
            "cancelled" => Some(RecordState::Cancelled),
            "expired" => Some(RecordState::Expired),
            "exhausted" => Some(RecordState::Exhausted),
            "exception" => Some(RecordState::Exception),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted unit of work: event, request or saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique id, assigned at creation.
    pub id: RecordId,
    /// Logical category (decides owning supervisor and state names).
    pub kind: WorkKind,
    /// Payload type name; the handler-resolution key.
    pub work_type: String,
    /// Serialized input.
    pub payload: Value,
    /// Owning service; records are scoped per service instance name.
    pub svc_name: String,
    pub created_at: DateTime<Utc>,
    /// When the record first becomes eligible to run.
    pub schedule_at: DateTime<Utc>,
    /// Absolute deadline; past this the record is abandoned.
    pub expire_at: DateTime<Utc>,
    pub state: RecordState,
    pub try_limit: u32,
    pub tried_count: u32,
    pub last_try_time: DateTime<Utc>,
    /// The compensation scheduler's sort key; only meaningful while the
    /// record is non-terminal.
    pub next_try_time: DateTime<Utc>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Retry configuration resolved at creation time.
    pub policy: RetryPolicy,
    /// Saga sub-steps; empty for events and requests.
    pub processes: Vec<SagaStep>,
}

impl ExecutionRecord {
    /// Create a fresh record scheduled at `schedule_at`.
    pub fn init(
        kind: WorkKind,
        work_type: impl Into<String>,
        payload: Value,
        svc_name: impl Into<String>,
        schedule_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        let expire_at = schedule_at
            + chrono::Duration::from_std(policy.expire_after).unwrap_or_default();
        let next_try_time =
            schedule_at + chrono::Duration::from_std(policy.next_interval(0)).unwrap_or_default();
        Self {
            id: RecordId::new(),
            kind,
            work_type: work_type.into(),
            payload,
            svc_name: svc_name.into(),
            created_at: schedule_at,
            schedule_at,
            expire_at,
            state: RecordState::Init,
            try_limit: policy.try_limit,
            tried_count: 0,
            last_try_time: schedule_at,
            next_try_time,
            result: None,
            error: None,
            policy,
            processes: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    pub fn is_invalid(&self) -> bool {
        self.state.is_invalid()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Try to begin an attempt at `now`.
    ///
    /// Returns `true` when the attempt may proceed; on `false` the record is
    /// either not eligible yet, or just transitioned to a dead-end state
    /// (`Exhausted`/`Expired`) that the caller must persist.
    pub fn begin(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_valid() {
            return false;
        }
        if self.tried_count >= self.try_limit {
            self.state = RecordState::Exhausted;
            return false;
        }
        if now > self.expire_at {
            self.state = RecordState::Expired;
            return false;
        }
        // Not due yet, unless this is the attempt the record was created for
        // (last_try_time still carries the schedule time then).
        if now != self.last_try_time && now < self.next_try_time {
            return false;
        }
        self.state = self.kind.running_state();
        self.last_try_time = now;
        self.tried_count += 1;
        self.next_try_time = now
            + chrono::Duration::from_std(self.policy.next_interval(self.tried_count))
                .unwrap_or_default();
        true
    }

    /// Finish the record successfully.
    pub fn end(&mut self, now: DateTime<Utc>, result: Value) {
        if self.is_terminal() {
            return;
        }
        self.state = self.kind.success_state();
        self.last_try_time = now;
        self.result = Some(result);
        self.error = None;
    }

    /// Capture a failed attempt. Retry bookkeeping stays untouched; the next
    /// `begin` re-evaluates exhaustion and expiry.
    pub fn occurred_exception(&mut self, now: DateTime<Utc>, error: &str) {
        if self.is_terminal() {
            return;
        }
        self.state = RecordState::Exception;
        self.last_try_time = now;
        self.error = Some(error.to_string());
    }

    /// Cancel the record; only possible while it is still valid.
    pub fn cancel(&mut self, _now: DateTime<Utc>) -> bool {
        if self.is_terminal() || self.is_invalid() {
            return false;
        }
        self.state = RecordState::Cancelled;
        true
    }
}
