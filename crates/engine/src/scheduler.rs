//! Compensation and archival scheduler.
//!
//! Periodically sweeps the ledger for records whose `next_try_time` has
//! passed without completion and re-drives them through their supervisor,
//! and moves long-dead records into the archive store. Both sweeps take a
//! distributed lock per service/kind so that only one instance of a
//! horizontally scaled service works a batch at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use relay_core::WorkKind;

use crate::lock::Locker;
use crate::supervisor::Engine;

const KINDS: [WorkKind; 3] = [WorkKind::Event, WorkKind::Request, WorkKind::Saga];

/// Consecutive archive failures tolerated before the sweep for a kind is
/// abandoned until the next cycle.
const ARCHIVE_FAIL_LIMIT: u32 = 3;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Records fetched per compensation batch.
    pub batch_size: usize,
    /// Records moved per archive statement.
    pub archive_batch_size: usize,
    /// Compensation picks up records due within this window, and resumed
    /// records are fast-forwarded past it so the next sweep skips them.
    pub lookahead: Duration,
    /// Lease length for the per-batch distributed lock.
    pub lock_ttl: Duration,
    /// Archive cutoff: dead records with `expire_at` before now plus this
    /// many days are moved out. Dead records never run again, so the
    /// forward-looking window clears those whose deadline is still ahead.
    pub expire_days: i64,
    /// Compensation sweep period.
    pub compense_every: Duration,
    /// Archive sweep period.
    pub archive_every: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            archive_batch_size: 100,
            lookahead: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(30),
            expire_days: 7,
            compense_every: Duration::from_secs(30),
            archive_every: Duration::from_secs(3600),
        }
    }
}

impl SchedulerConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_archive_batch_size(mut self, archive_batch_size: usize) -> Self {
        self.archive_batch_size = archive_batch_size;
        self
    }

    pub fn with_lookahead(mut self, lookahead: Duration) -> Self {
        self.lookahead = lookahead;
        self
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_expire_days(mut self, expire_days: i64) -> Self {
        self.expire_days = expire_days;
        self
    }

    pub fn with_compense_every(mut self, compense_every: Duration) -> Self {
        self.compense_every = compense_every;
        self
    }

    pub fn with_archive_every(mut self, archive_every: Duration) -> Self {
        self.archive_every = archive_every;
        self
    }
}

/// Drives compensation and archival over one engine.
pub struct CompensationScheduler {
    engine: Arc<Engine>,
    locker: Arc<dyn Locker>,
    config: SchedulerConfig,
    compensation_running: AtomicBool,
}

impl CompensationScheduler {
    pub fn new(engine: Arc<Engine>, locker: Arc<dyn Locker>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            locker,
            config,
            compensation_running: AtomicBool::new(false),
        }
    }

    /// One compensation sweep across all kinds. Batches repeat per kind
    /// until a fetch comes back empty or the lock is held elsewhere.
    ///
    /// Re-entrant calls (a slow sweep still running when the next tick
    /// fires) return immediately.
    pub fn compense(&self) {
        if self
            .compensation_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("compensation sweep already in progress, skipping");
            return;
        }

        for kind in KINDS {
            while self.compense_batch(kind) {}
        }

        self.compensation_running.store(false, Ordering::SeqCst);
    }

    /// Returns `true` when the fetch produced any records; the sweep keeps
    /// fetching until a batch comes back empty. Resumed records are
    /// fast-forwarded past the lookahead window, so each record appears in
    /// at most one non-empty batch per sweep.
    fn compense_batch(&self, kind: WorkKind) -> bool {
        let owner = owner_token();
        let key = format!("{}:compense:{}", self.engine.svc_name(), kind);
        if !self.locker.acquire(&key, &owner, self.config.lock_ttl) {
            debug!(%kind, "compensation lock held elsewhere, skipping batch");
            return false;
        }

        let supervisor = self.engine.supervisor(kind);
        let min_next_try_time =
            Utc::now() + chrono::Duration::from_std(self.config.lookahead).unwrap_or_default();
        let batch = match supervisor.get_by_next_try_time(min_next_try_time, self.config.batch_size)
        {
            Ok(batch) => batch,
            Err(err) => {
                warn!(%kind, error = %err, "compensation fetch failed");
                self.locker.release(&key, &owner);
                return false;
            }
        };

        let fetched = batch.len();
        for record in batch {
            let id = record.id;
            if let Err(err) = supervisor.resume(record, min_next_try_time) {
                warn!(%kind, record_id = %id, error = %err, "resume failed");
            }
        }
        self.locker.release(&key, &owner);

        if fetched > 0 {
            debug!(%kind, count = fetched, "compensated batch");
        }
        fetched > 0
    }

    /// One archive sweep across all kinds.
    pub fn archive(&self) {
        let before = Utc::now() + chrono::Duration::days(self.config.expire_days);
        for kind in KINDS {
            let owner = owner_token();
            let key = format!("{}:archive:{}", self.engine.svc_name(), kind);
            if !self.locker.acquire(&key, &owner, self.config.lock_ttl) {
                debug!(%kind, "archive lock held elsewhere, skipping");
                continue;
            }

            let supervisor = self.engine.supervisor(kind);
            let mut total = 0usize;
            let mut fail_count = 0u32;
            loop {
                match supervisor.archive_by_expire_at(before, self.config.archive_batch_size) {
                    Ok(0) => break,
                    Ok(moved) => {
                        total += moved;
                        fail_count = 0;
                    }
                    Err(err) => {
                        fail_count += 1;
                        error!(%kind, error = %err, fail_count, "archive batch failed");
                        if fail_count >= ARCHIVE_FAIL_LIMIT {
                            break;
                        }
                    }
                }
            }
            self.locker.release(&key, &owner);

            if total > 0 {
                info!(%kind, archived = total, "archived expired records");
            }
        }
    }

    /// Start the periodic sweeps on background threads. The returned handle
    /// stops them on [`SchedulerHandle::shutdown`] or drop.
    pub fn spawn(self) -> SchedulerHandle {
        let scheduler = Arc::new(self);
        let (compense_tx, compense_rx) = mpsc::channel::<()>();
        let (archive_tx, archive_rx) = mpsc::channel::<()>();

        let compense_handle = {
            let scheduler = scheduler.clone();
            std::thread::Builder::new()
                .name("relay-compense".to_string())
                .spawn(move || {
                    loop {
                        match compense_rx.recv_timeout(scheduler.config.compense_every) {
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                            Err(RecvTimeoutError::Timeout) => scheduler.compense(),
                        }
                    }
                })
                .expect("failed to spawn compensation thread")
        };

        let archive_handle = {
            let scheduler = scheduler.clone();
            std::thread::Builder::new()
                .name("relay-archive".to_string())
                .spawn(move || {
                    loop {
                        match archive_rx.recv_timeout(scheduler.config.archive_every) {
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                            Err(RecvTimeoutError::Timeout) => scheduler.archive(),
                        }
                    }
                })
                .expect("failed to spawn archive thread")
        };

        SchedulerHandle {
            compense_tx: Some(compense_tx),
            archive_tx: Some(archive_tx),
            threads: vec![compense_handle, archive_handle],
        }
    }
}

/// Random per-batch lock credential; only the acquiring sweep can release.
fn owner_token() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

/// Stops the scheduler threads when shut down or dropped.
pub struct SchedulerHandle {
    compense_tx: Option<Sender<()>>,
    archive_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.compense_tx.take() {
            let _ = tx.send(());
        }
        if let Some(tx) = self.archive_tx.take() {
            let _ = tx.send(());
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Registry;
    use crate::ledger::{InMemoryLedger, Ledger, LedgerError};
    use crate::lock::InMemoryLocker;
    use crate::supervisor::EngineConfig;
    use chrono::{DateTime, Utc};
    use relay_core::{ExecutionRecord, RecordId, RecordState, RetryPolicy};
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;

    fn overdue_record(work_type: &str) -> ExecutionRecord {
        let now = Utc::now();
        let mut record = ExecutionRecord::init(
            WorkKind::Request,
            work_type,
            Value::Null,
            "relay",
            now - chrono::Duration::minutes(10),
            RetryPolicy::default(),
        );
        record.next_try_time = now - chrono::Duration::minutes(5);
        record
    }

    fn wait_for_state(
        ledger: &InMemoryLedger,
        id: RecordId,
        state: RecordState,
    ) -> ExecutionRecord {
        for _ in 0..100 {
            if let Some(record) = ledger.get_by_id(id).unwrap() {
                if record.state == state {
                    return record;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("record {id} never reached {state}");
    }

    #[test]
    fn compense_drives_an_overdue_record_to_completion() {
        let mut registry = Registry::new();
        registry.register_handler("stuck.work", |_: Value| Ok(serde_json::json!("recovered")));
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = Engine::new(EngineConfig::default(), registry, ledger.clone());

        let record = overdue_record("stuck.work");
        let id = record.id;
        ledger.save(&record).unwrap();

        let scheduler = CompensationScheduler::new(
            engine.clone(),
            Arc::new(InMemoryLocker::new()),
            SchedulerConfig::default(),
        );
        scheduler.compense();

        let record = wait_for_state(&ledger, id, RecordState::Executed);
        assert_eq!(record.result, Some(serde_json::json!("recovered")));
        engine.shutdown();
    }

    #[test]
    fn compense_drains_past_a_partial_batch() {
        let mut registry = Registry::new();
        registry.register_handler("stuck.work", |_: Value| Ok(Value::Null));
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = Engine::new(EngineConfig::default(), registry, ledger.clone());

        // Three overdue records against a batch size of two: the sweep must
        // keep fetching through the one-record batch until a fetch comes
        // back empty.
        let ids: Vec<_> = (0..3)
            .map(|_| {
                let record = overdue_record("stuck.work");
                let id = record.id;
                ledger.save(&record).unwrap();
                id
            })
            .collect();

        let scheduler = CompensationScheduler::new(
            engine.clone(),
            Arc::new(InMemoryLocker::new()),
            SchedulerConfig::default().with_batch_size(2),
        );
        scheduler.compense();

        for id in ids {
            wait_for_state(&ledger, id, RecordState::Executed);
        }
        engine.shutdown();
    }

    #[test]
    fn compense_skips_when_the_lock_is_held_elsewhere() {
        let mut registry = Registry::new();
        registry.register_handler("stuck.work", |_: Value| Ok(Value::Null));
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = Engine::new(EngineConfig::default(), registry, ledger.clone());

        let record = overdue_record("stuck.work");
        let id = record.id;
        ledger.save(&record).unwrap();

        let locker = Arc::new(InMemoryLocker::new());
        // Another instance holds the request-kind compensation lock.
        assert!(locker.acquire("relay:compense:request", "other-node", Duration::from_secs(60)));

        let scheduler =
            CompensationScheduler::new(engine.clone(), locker, SchedulerConfig::default());
        scheduler.compense();

        assert_eq!(ledger.get_by_id(id).unwrap().unwrap().state, RecordState::Init);
        engine.shutdown();
    }

    #[test]
    fn archive_moves_expired_dead_records() {
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = Engine::new(EngineConfig::default(), Registry::new(), ledger.clone());

        let now = Utc::now();
        let mut dead = ExecutionRecord::init(
            WorkKind::Request,
            "old.work",
            Value::Null,
            "relay",
            now - chrono::Duration::days(30),
            RetryPolicy::default(),
        );
        dead.state = RecordState::Exhausted;
        let dead_id = dead.id;
        ledger.save(&dead).unwrap();

        // Still-live records stay untouched however old they are.
        let live = ExecutionRecord::init(
            WorkKind::Request,
            "old.work",
            Value::Null,
            "relay",
            now - chrono::Duration::days(30),
            RetryPolicy::default(),
        );
        let live_id = live.id;
        ledger.save(&live).unwrap();

        let scheduler = CompensationScheduler::new(
            engine.clone(),
            Arc::new(InMemoryLocker::new()),
            SchedulerConfig::default(),
        );
        scheduler.archive();

        assert!(ledger.get_by_id(dead_id).unwrap().is_none());
        assert!(ledger.get_by_id(live_id).unwrap().is_some());
        assert!(ledger.archived().iter().any(|r| r.id == dead_id));
        engine.shutdown();
    }

    #[test]
    fn archive_gives_up_after_repeated_failures() {
        struct FailingLedger {
            inner: InMemoryLedger,
            archive_calls: AtomicU32,
        }

        impl Ledger for FailingLedger {
            fn save(&self, record: &ExecutionRecord) -> Result<(), LedgerError> {
                self.inner.save(record)
            }
            fn get_by_id(&self, id: RecordId) -> Result<Option<ExecutionRecord>, LedgerError> {
                self.inner.get_by_id(id)
            }
            fn get_by_next_try_time(
                &self,
                svc_name: &str,
                kind: WorkKind,
                before: DateTime<Utc>,
                limit: usize,
            ) -> Result<Vec<ExecutionRecord>, LedgerError> {
                self.inner.get_by_next_try_time(svc_name, kind, before, limit)
            }
            fn archive_by_expire_at(
                &self,
                _svc_name: &str,
                _kind: WorkKind,
                _before: DateTime<Utc>,
                _limit: usize,
            ) -> Result<usize, LedgerError> {
                self.archive_calls.fetch_add(1, Ordering::SeqCst);
                Err(LedgerError::Storage("disk full".to_string()))
            }
        }

        let ledger = Arc::new(FailingLedger {
            inner: InMemoryLedger::new(),
            archive_calls: AtomicU32::new(0),
        });
        let engine = Engine::new(EngineConfig::default(), Registry::new(), ledger.clone());

        let scheduler = CompensationScheduler::new(
            engine.clone(),
            Arc::new(InMemoryLocker::new()),
            SchedulerConfig::default(),
        );
        scheduler.archive();

        // Three strikes per kind, then the sweep moves on.
        assert_eq!(
            ledger.archive_calls.load(Ordering::SeqCst),
            3 * KINDS.len() as u32
        );
        engine.shutdown();
    }

    #[test]
    fn overlapping_sweeps_do_not_stack() {
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = Engine::new(EngineConfig::default(), Registry::new(), ledger.clone());
        let scheduler = CompensationScheduler::new(
            engine.clone(),
            Arc::new(InMemoryLocker::new()),
            SchedulerConfig::default(),
        );

        scheduler.compensation_running.store(true, Ordering::SeqCst);
        // Returns without touching the flag another sweep owns.
        scheduler.compense();
        assert!(scheduler.compensation_running.load(Ordering::SeqCst));
        engine.shutdown();
    }

    #[test]
    fn spawned_scheduler_ticks_on_its_own() {
        let mut registry = Registry::new();
        registry.register_handler("stuck.work", |_: Value| Ok(Value::Null));
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = Engine::new(EngineConfig::default(), registry, ledger.clone());

        let record = overdue_record("stuck.work");
        let id = record.id;
        ledger.save(&record).unwrap();

        let config = SchedulerConfig::default()
            .with_compense_every(Duration::from_millis(50))
            .with_archive_every(Duration::from_secs(3600));
        let handle = CompensationScheduler::new(
            engine.clone(),
            Arc::new(InMemoryLocker::new()),
            config,
        )
        .spawn();

        wait_for_state(&ledger, id, RecordState::Executed);
        handle.shutdown();
        engine.shutdown();
    }
}
