//! Lease-based distributed lock.
//!
//! One row per lock key. A lock is advisory: holders get a lease until
//! `unlock_at`, an expired lease is up for grabs by any owner, and the same
//! owner may re-acquire (reenter) its own unexpired lease. Release only
//! takes effect for the matching owner while the lease is still live.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// The persisted shape of one lock.
#[derive(Debug, Clone)]
pub struct LockRow {
    pub owner: String,
    pub lock_at: DateTime<Utc>,
    pub unlock_at: DateTime<Utc>,
}

/// Mutual exclusion across service instances.
///
/// Both operations answer with a plain bool: lock contention is an expected
/// outcome ("someone else is doing this work"), not an error.
pub trait Locker: Send + Sync {
    fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> bool;

    fn release(&self, key: &str, owner: &str) -> bool;
}

/// In-memory locker for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryLocker {
    rows: Mutex<HashMap<String, LockRow>>,
}

impl InMemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Locker for InMemoryLocker {
    fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        let now = Utc::now();
        let unlock_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let mut rows = self.rows.lock().unwrap();

        match rows.get_mut(key) {
            None => {
                rows.insert(
                    key.to_string(),
                    LockRow {
                        owner: owner.to_string(),
                        lock_at: now,
                        unlock_at,
                    },
                );
                true
            }
            // Steal an expired lease or reenter our own.
            Some(row) if row.unlock_at < now || row.owner == owner => {
                row.owner = owner.to_string();
                row.lock_at = now;
                row.unlock_at = unlock_at;
                true
            }
            Some(_) => false,
        }
    }

    fn release(&self, key: &str, owner: &str) -> bool {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(key) {
            Some(row) if row.owner == owner && row.unlock_at > now => {
                row.unlock_at = now;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn second_owner_blocked_until_lease_expires() {
        let locker = InMemoryLocker::new();

        assert!(locker.acquire("k", "alpha", TTL));
        assert!(!locker.acquire("k", "beta", TTL));

        // Force the lease into the past and try again.
        locker.rows.lock().unwrap().get_mut("k").unwrap().unlock_at =
            Utc::now() - chrono::Duration::seconds(1);
        assert!(locker.acquire("k", "beta", TTL));
    }

    #[test]
    fn same_owner_reenters() {
        let locker = InMemoryLocker::new();
        assert!(locker.acquire("k", "alpha", TTL));
        assert!(locker.acquire("k", "alpha", TTL));
    }

    #[test]
    fn release_requires_matching_owner_and_live_lease() {
        let locker = InMemoryLocker::new();
        assert!(locker.acquire("k", "alpha", TTL));

        assert!(!locker.release("k", "beta"));
        assert!(!locker.release("missing", "alpha"));
        assert!(locker.release("k", "alpha"));

        // The lease ended at release time; releasing again fails.
        assert!(!locker.release("k", "alpha"));
        // And the key is free for the next acquirer.
        assert!(locker.acquire("k", "beta", TTL));
    }

    #[test]
    fn release_after_expiry_fails() {
        let locker = InMemoryLocker::new();
        assert!(locker.acquire("k", "alpha", Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(30));
        assert!(!locker.release("k", "alpha"));
    }

    #[test]
    fn keys_are_independent() {
        let locker = InMemoryLocker::new();
        assert!(locker.acquire("compense", "alpha", TTL));
        assert!(locker.acquire("archive", "beta", TTL));
        assert!(!locker.acquire("compense", "beta", TTL));
    }
}
