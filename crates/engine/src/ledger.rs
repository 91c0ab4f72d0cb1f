//! Record persistence abstraction.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use relay_core::{ExecutionRecord, RecordId, WorkKind};

/// Ledger error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("record not found: {0}")]
    NotFound(RecordId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistence contract for execution records.
///
/// `save` is an upsert: supervisors construct records in memory and persist
/// them before and after every transition. Queries are scoped by owning
/// service and kind because every deployment only ever drives its own
/// records.
pub trait Ledger: Send + Sync {
    fn save(&self, record: &ExecutionRecord) -> Result<(), LedgerError>;

    fn get_by_id(&self, id: RecordId) -> Result<Option<ExecutionRecord>, LedgerError>;

    /// Overdue candidates for compensation: records in a valid state with
    /// `next_try_time` before `before`, ascending by `next_try_time`.
    fn get_by_next_try_time(
        &self,
        svc_name: &str,
        kind: WorkKind,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, LedgerError>;

    /// Move terminal records (success or dead-end) with `expire_at` before
    /// `before` into the archive store. Returns how many moved.
    fn archive_by_expire_at(
        &self,
        svc_name: &str,
        kind: WorkKind,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, LedgerError>;
}

/// In-memory ledger for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    live: RwLock<HashMap<RecordId, ExecutionRecord>>,
    archived: RwLock<HashMap<RecordId, ExecutionRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all live records (test helper).
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.live.read().unwrap().values().cloned().collect()
    }

    /// Snapshot of all archived records (test helper).
    pub fn archived(&self) -> Vec<ExecutionRecord> {
        self.archived.read().unwrap().values().cloned().collect()
    }
}

impl Ledger for InMemoryLedger {
    fn save(&self, record: &ExecutionRecord) -> Result<(), LedgerError> {
        self.live
            .write()
            .unwrap()
            .insert(record.id, record.clone());
        Ok(())
    }

    fn get_by_id(&self, id: RecordId) -> Result<Option<ExecutionRecord>, LedgerError> {
        Ok(self.live.read().unwrap().get(&id).cloned())
    }

    fn get_by_next_try_time(
        &self,
        svc_name: &str,
        kind: WorkKind,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, LedgerError> {
        let live = self.live.read().unwrap();
        let mut due: Vec<_> = live
            .values()
            .filter(|r| {
                r.svc_name == svc_name
                    && r.kind == kind
                    && r.is_valid()
                    && r.next_try_time < before
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_try_time);
        due.truncate(limit);
        Ok(due)
    }

    fn archive_by_expire_at(
        &self,
        svc_name: &str,
        kind: WorkKind,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, LedgerError> {
        let mut live = self.live.write().unwrap();
        let mut ids: Vec<_> = live
            .values()
            .filter(|r| {
                r.svc_name == svc_name
                    && r.kind == kind
                    && !r.is_valid()
                    && r.expire_at < before
            })
            .map(|r| (r.expire_at, r.id))
            .collect();
        ids.sort();
        ids.truncate(limit);

        let mut archived = self.archived.write().unwrap();
        for (_, id) in &ids {
            if let Some(record) = live.remove(id) {
                archived.insert(*id, record);
            }
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{RecordState, RetryPolicy};
    use std::time::Duration;

    fn record_at(
        svc: &str,
        kind: WorkKind,
        next_try_in_secs: i64,
        state: RecordState,
    ) -> ExecutionRecord {
        let now = Utc::now();
        let mut record = ExecutionRecord::init(
            kind,
            "test.work",
            serde_json::json!({}),
            svc,
            now,
            RetryPolicy::default(),
        );
        record.next_try_time = now + chrono::Duration::seconds(next_try_in_secs);
        record.state = state;
        record
    }

    #[test]
    fn next_try_time_query_filters_and_sorts() {
        let ledger = InMemoryLedger::new();
        let before = Utc::now() + chrono::Duration::minutes(5);

        let due_late = record_at("svc-a", WorkKind::Request, 120, RecordState::Exception);
        let due_soon = record_at("svc-a", WorkKind::Request, 10, RecordState::Init);
        // All of these must be excluded.
        let not_due = record_at("svc-a", WorkKind::Request, 600, RecordState::Init);
        let wrong_svc = record_at("svc-b", WorkKind::Request, 10, RecordState::Init);
        let wrong_kind = record_at("svc-a", WorkKind::Event, 10, RecordState::Init);
        let cancelled = record_at("svc-a", WorkKind::Request, 10, RecordState::Cancelled);
        let done = record_at("svc-a", WorkKind::Request, 10, RecordState::Executed);

        for r in [&due_late, &due_soon, &not_due, &wrong_svc, &wrong_kind, &cancelled, &done] {
            ledger.save(r).unwrap();
        }

        let due = ledger
            .get_by_next_try_time("svc-a", WorkKind::Request, before, 10)
            .unwrap();

        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, due_soon.id);
        assert_eq!(due[1].id, due_late.id);
    }

    #[test]
    fn next_try_time_query_honors_limit() {
        let ledger = InMemoryLedger::new();
        for _ in 0..5 {
            ledger
                .save(&record_at("svc-a", WorkKind::Event, 1, RecordState::Init))
                .unwrap();
        }

        let due = ledger
            .get_by_next_try_time(
                "svc-a",
                WorkKind::Event,
                Utc::now() + chrono::Duration::minutes(5),
                3,
            )
            .unwrap();
        assert_eq!(due.len(), 3);
    }

    #[test]
    fn archive_moves_exactly_the_terminal_records() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();

        let make = |state: RecordState, expired: bool| {
            let mut r = record_at("svc-a", WorkKind::Request, 0, state);
            r.expire_at = if expired {
                now - chrono::Duration::days(10)
            } else {
                now + chrono::Duration::days(10)
            };
            ledger.save(&r).unwrap();
            r.id
        };

        let executed = make(RecordState::Executed, true);
        let cancelled = make(RecordState::Cancelled, true);
        let expired = make(RecordState::Expired, true);
        let exhausted = make(RecordState::Exhausted, true);
        let executed_fresh = make(RecordState::Executed, false);
        let still_retrying = make(RecordState::Exception, true);
        let pending = make(RecordState::Init, true);

        let moved = ledger
            .archive_by_expire_at("svc-a", WorkKind::Request, now, 100)
            .unwrap();
        assert_eq!(moved, 4);

        let archived: Vec<_> = ledger.archived().iter().map(|r| r.id).collect();
        for id in [executed, cancelled, expired, exhausted] {
            assert!(archived.contains(&id));
            assert!(ledger.get_by_id(id).unwrap().is_none());
        }
        for id in [executed_fresh, still_retrying, pending] {
            assert!(ledger.get_by_id(id).unwrap().is_some());
        }
    }

    #[test]
    fn archive_respects_batch_size_and_drains() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        for _ in 0..7 {
            let mut r = record_at("svc-a", WorkKind::Saga, 0, RecordState::Executed);
            r.expire_at = now - chrono::Duration::days(1);
            ledger.save(&r).unwrap();
        }

        assert_eq!(
            ledger.archive_by_expire_at("svc-a", WorkKind::Saga, now, 3).unwrap(),
            3
        );
        assert_eq!(
            ledger.archive_by_expire_at("svc-a", WorkKind::Saga, now, 3).unwrap(),
            3
        );
        assert_eq!(
            ledger.archive_by_expire_at("svc-a", WorkKind::Saga, now, 3).unwrap(),
            1
        );
        assert_eq!(
            ledger.archive_by_expire_at("svc-a", WorkKind::Saga, now, 3).unwrap(),
            0
        );
    }

    #[test]
    fn retry_policy_edge_case_zero_limit_record_is_archivable_after_begin() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let mut record = ExecutionRecord::init(
            WorkKind::Request,
            "t",
            serde_json::json!({}),
            "svc-a",
            now - chrono::Duration::days(2),
            RetryPolicy::new(0, Duration::from_secs(60)),
        );
        assert!(!record.begin(now));
        assert_eq!(record.state, RecordState::Exhausted);
        ledger.save(&record).unwrap();

        let moved = ledger
            .archive_by_expire_at("svc-a", WorkKind::Request, now, 10)
            .unwrap();
        assert_eq!(moved, 1);
    }
}
