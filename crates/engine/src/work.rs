//! Work submission envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_core::{ExecutionRecord, WorkKind};

/// A unit of work submitted to a supervisor: kind, payload type name, and
/// the serialized payload itself.
///
/// The type name is the handler-resolution key; a `Work` with a type nobody
/// registered is a configuration error at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub kind: WorkKind,
    pub work_type: String,
    pub payload: Value,
}

impl Work {
    pub fn new(kind: WorkKind, work_type: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            work_type: work_type.into(),
            payload,
        }
    }

    /// Fire-and-forget event.
    pub fn event(work_type: impl Into<String>, payload: Value) -> Self {
        Self::new(WorkKind::Event, work_type, payload)
    }

    /// Request/response command.
    pub fn request(work_type: impl Into<String>, payload: Value) -> Self {
        Self::new(WorkKind::Request, work_type, payload)
    }

    /// Multi-step saga.
    pub fn saga(work_type: impl Into<String>, payload: Value) -> Self {
        Self::new(WorkKind::Saga, work_type, payload)
    }

    /// Rebuild the submission from a persisted record (for retry/resume).
    pub fn from_record(record: &ExecutionRecord) -> Self {
        Self {
            kind: record.kind,
            work_type: record.work_type.clone(),
            payload: record.payload.clone(),
        }
    }
}
