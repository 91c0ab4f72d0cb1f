//! Logical work kinds.

use serde::{Deserialize, Serialize};

use crate::record::RecordState;

/// The three kinds of work the engine executes.
///
/// All three share the same record shape and state machine; the kind decides
/// which supervisor owns the record and which running/success state names it
/// passes through (events "deliver", requests and sagas "execute").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Fire-and-forget notification.
    Event,
    /// Request/response command.
    Request,
    /// Multi-step orchestration with idempotent sub-processes.
    Saga,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Event => "event",
            WorkKind::Request => "request",
            WorkKind::Saga => "saga",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "event" => Some(WorkKind::Event),
            "request" => Some(WorkKind::Request),
            "saga" => Some(WorkKind::Saga),
            _ => None,
        }
    }

    /// State a record of this kind enters when an attempt begins.
    pub fn running_state(&self) -> RecordState {
        match self {
            WorkKind::Event => RecordState::Delivering,
            WorkKind::Request | WorkKind::Saga => RecordState::Executing,
        }
    }

    /// Terminal success state for this kind.
    pub fn success_state(&self) -> RecordState {
        match self {
            WorkKind::Event => RecordState::Delivered,
            WorkKind::Request | WorkKind::Saga => RecordState::Executed,
        }
    }
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
