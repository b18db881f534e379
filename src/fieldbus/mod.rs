//! Field-bus access layer: register map, Modbus/TCP driver and write guard.

pub mod driver;
pub mod registers;
pub mod write_guard;

use async_trait::async_trait;

use crate::error::FieldBusError;
use write_guard::DropCause;

/// Outcome of a guarded write: either it reached the device, or the write
/// guard dropped it with an explicit cause. Transport failures surface as
/// errors instead, so no write is ever silently lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Dropped(DropCause),
}

impl WriteOutcome {
    pub fn applied(self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }

    /// True when the device is known to hold the written value: the write
    /// went out, or dedupe confirmed it already matched. Throttled writes
    /// leave the device state unknown and must be retried.
    pub fn reached_device(self) -> bool {
        matches!(
            self,
            WriteOutcome::Applied | WriteOutcome::Dropped(DropCause::Dedup)
        )
    }
}

/// Typed register access in physical units.
///
/// The hardware seam: control logic (EMS, health monitor, battery unit)
/// speaks this trait, with the Modbus driver as the production
/// implementation and a scripted bus in tests.
#[async_trait]
pub trait RegisterBus: Send {
    async fn read(&mut self, name: &str) -> Result<f64, FieldBusError>;
    async fn write(&mut self, name: &str, value: f64) -> Result<WriteOutcome, FieldBusError>;

    /// Refresh the write-guard policy from a settings snapshot.
    fn set_guard_config(&mut self, _cfg: write_guard::WriteGuardConfig) {}

    /// Cumulative write-guard accounting for telemetry.
    fn write_counters(&self) -> crate::domain::WriteCounterSnapshot {
        crate::domain::WriteCounterSnapshot::default()
    }
}
