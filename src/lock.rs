//! Process-wide advisory lock with a maximum lifetime.
//!
//! Holding the lock is advisory: a holder that outlives the TTL loses it to
//! the next caller, and its late `release` is ignored because the token no
//! longer matches.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Holder {
    token: Uuid,
    acquired_at: DateTime<Utc>,
}

/// Proof of ownership returned by a successful acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken {
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TtlLock {
    ttl: Duration,
    holder: Mutex<Option<Holder>>,
}

impl TtlLock {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(30)),
            holder: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn try_acquire(&self) -> Option<LockToken> {
        self.try_acquire_at(Utc::now())
    }

    /// Acquire unless a holder younger than the TTL exists. A stale holder is
    /// reclaimed.
    pub fn try_acquire_at(&self, now: DateTime<Utc>) -> Option<LockToken> {
        let mut guard = self.holder.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = *guard {
            if now - current.acquired_at < self.ttl {
                return None;
            }
            warn!(
                acquired_at = %current.acquired_at,
                ttl_secs = self.ttl.num_seconds(),
                "reclaiming stale sync lock"
            );
        }
        let holder = Holder {
            token: Uuid::new_v4(),
            acquired_at: now,
        };
        *guard = Some(holder);
        Some(LockToken {
            token: holder.token,
            acquired_at: holder.acquired_at,
        })
    }

    /// Release if `token` still owns the lock. Returns whether it did.
    pub fn release(&self, token: &LockToken) -> bool {
        let mut guard = self.holder.lock().unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(current) if current.token == token.token => {
                *guard = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.is_held_at(Utc::now())
    }

    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.held_since_at(now).is_some()
    }

    /// Acquisition time of a live (non-stale) holder.
    pub fn held_since_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let guard = self.holder.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .filter(|h| now - h.acquired_at < self.ttl)
            .map(|h| h.acquired_at)
    }
}
