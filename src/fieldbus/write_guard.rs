//! Write guard: dedupe, per-register interval and global rate cap.
//!
//! The guard serializes every write attempt through one mutex doing constant
//! work; the bus write itself happens after the decision, outside the lock.
//! Attempts are never queued: a rejected write is reported back to the
//! caller, which may retry on its next tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::domain::WriteCounterSnapshot;

/// Guard policy knobs; hot-reloadable, so passed in per attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteGuardConfig {
    pub per_reg_min_s: f64,
    pub global_writes_per_s: f64,
    pub dedupe_window_s: f64,
}

impl Default for WriteGuardConfig {
    fn default() -> Self {
        Self {
            per_reg_min_s: 0.25,
            global_writes_per_s: 5.0,
            dedupe_window_s: 30.0,
        }
    }
}

/// Why a write was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    Dedup,
    ThrottlePerReg,
    ThrottleGlobal,
}

impl DropCause {
    pub fn as_str(self) -> &'static str {
        match self {
            DropCause::Dedup => "dedup",
            DropCause::ThrottlePerReg => "throttle_per_reg",
            DropCause::ThrottleGlobal => "throttle_global",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    Accept,
    Drop(DropCause),
}

struct LedgerEntry {
    last_written_at: Instant,
    last_value: Vec<u16>,
}

struct Ledger {
    entries: HashMap<u16, LedgerEntry>,
    tokens: f64,
    last_refill: Instant,
}

/// Process-wide write admission control for one field bus.
///
/// Checks run in this order: global token bucket (a token is consumed per
/// attempt), per-register minimum interval against the last accepted write,
/// then value dedupe inside the staleness window. Counters are cumulative
/// for the process lifetime.
pub struct WriteGuard {
    inner: Mutex<Ledger>,
    ok: AtomicU64,
    dedup: AtomicU64,
    throttle_per_reg: AtomicU64,
    throttle_global: AtomicU64,
    error: AtomicU64,
}

impl WriteGuard {
    pub fn new(initial: &WriteGuardConfig) -> Self {
        Self {
            inner: Mutex::new(Ledger {
                entries: HashMap::new(),
                tokens: initial.global_writes_per_s.max(1.0),
                last_refill: Instant::now(),
            }),
            ok: AtomicU64::new(0),
            dedup: AtomicU64::new(0),
            throttle_per_reg: AtomicU64::new(0),
            throttle_global: AtomicU64::new(0),
            error: AtomicU64::new(0),
        }
    }

    /// Decide whether a write of `words` to `address` may proceed at `now`.
    ///
    /// An accepted write records itself in the ledger immediately; the
    /// caller must follow up with [`record_ok`](Self::record_ok) or
    /// [`record_error`](Self::record_error) once the bus write resolves.
    pub fn admit(
        &self,
        address: u16,
        words: &[u16],
        cfg: &WriteGuardConfig,
        now: Instant,
    ) -> WriteDecision {
        let mut ledger = self.inner.lock();

        // Token bucket: capacity equals the rate, refilled continuously.
        let capacity = cfg.global_writes_per_s.max(1.0);
        let elapsed = now
            .saturating_duration_since(ledger.last_refill)
            .as_secs_f64();
        ledger.tokens = (ledger.tokens + elapsed * cfg.global_writes_per_s).min(capacity);
        ledger.last_refill = now;
        if ledger.tokens < 1.0 {
            self.throttle_global.fetch_add(1, Ordering::Relaxed);
            return WriteDecision::Drop(DropCause::ThrottleGlobal);
        }
        ledger.tokens -= 1.0;

        if let Some(entry) = ledger.entries.get(&address) {
            let age = now
                .saturating_duration_since(entry.last_written_at)
                .as_secs_f64();
            if age < cfg.per_reg_min_s {
                self.throttle_per_reg.fetch_add(1, Ordering::Relaxed);
                return WriteDecision::Drop(DropCause::ThrottlePerReg);
            }
            if entry.last_value == words && age < cfg.dedupe_window_s {
                self.dedup.fetch_add(1, Ordering::Relaxed);
                return WriteDecision::Drop(DropCause::Dedup);
            }
        }

        ledger.entries.insert(
            address,
            LedgerEntry {
                last_written_at: now,
                last_value: words.to_vec(),
            },
        );
        WriteDecision::Accept
    }

    /// The admitted write reached the device.
    pub fn record_ok(&self) {
        self.ok.fetch_add(1, Ordering::Relaxed);
    }

    /// The admitted write failed in transport. Forgets the ledger entry so
    /// the retry on the next tick is not dedupe-suppressed.
    pub fn record_error(&self, address: u16) {
        self.error.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().entries.remove(&address);
    }

    pub fn counters(&self) -> WriteCounterSnapshot {
        WriteCounterSnapshot {
            writes_ok: self.ok.load(Ordering::Relaxed),
            writes_dedup: self.dedup.load(Ordering::Relaxed),
            writes_throttle_per_reg: self.throttle_per_reg.load(Ordering::Relaxed),
            writes_throttle_global: self.throttle_global.load(Ordering::Relaxed),
            writes_error: self.error.load(Ordering::Relaxed),
        }
    }
}
