//! Domain types shared across the controller, health monitor and poster.
//!
//! Everything here is a plain serde-serializable value: samples and events
//! are immutable once created and flow one way, from the control tasks into
//! the backend poster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use uuid::Uuid;

/// EMS operating mode, as commanded through `ems_power_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmsMode {
    Auto,
    ImportAc,
}

impl EmsMode {
    /// Raw register encoding for `ems_power_mode`.
    pub fn register_value(self) -> u16 {
        match self {
            EmsMode::Auto => 0x0001,
            EmsMode::ImportAc => 0x0004,
        }
    }
}

/// Alert severity. Ordering matters: `Critical` drains immediately,
/// everything else batches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

/// Stable alert codes. Health-register codes run through the debounced
/// state machines; the rest are one-shot event codes raised by other
/// subsystems (commissioning, config bus, invariant checks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertCode {
    EmsCheckFailed,
    BmsAlarm,
    ArcFault,
    BmsWarning,
    ParallelCommFault,
    MeterPathFault,
    StaleTelemetry,
    CommissioningDrift,
    CommissioningFailed,
    ConfigRejected,
    InvariantBreach,
}

impl AlertCode {
    pub fn severity(self) -> Severity {
        match self {
            AlertCode::EmsCheckFailed | AlertCode::BmsAlarm | AlertCode::ArcFault => {
                Severity::Critical
            }
            AlertCode::BmsWarning
            | AlertCode::ParallelCommFault
            | AlertCode::MeterPathFault
            | AlertCode::StaleTelemetry
            | AlertCode::CommissioningDrift
            | AlertCode::CommissioningFailed
            | AlertCode::InvariantBreach => Severity::Warning,
            AlertCode::ConfigRejected => Severity::Info,
        }
    }

    /// Codes whose ACTIVE state forces the fault-safe posture.
    pub fn is_fault_safe_trigger(self) -> bool {
        matches!(
            self,
            AlertCode::EmsCheckFailed | AlertCode::BmsAlarm | AlertCode::ArcFault
        )
    }
}

/// Alert interval state carried on every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum AlertState {
    Active,
    Cleared,
}

/// Control context attached to alert events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertContext {
    pub mode: Option<EmsMode>,
    pub soc: Option<f64>,
    pub grid_w: Option<f64>,
    pub pv_w: Option<f64>,
    pub bias_w: Option<f64>,
}

/// One alert transition, posted to `/blob/health`.
///
/// `event_id` is stable for the lifetime of one active interval; `count` is
/// monotone across re-entries of the same code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub site_id: String,
    pub consus_id: String,
    pub ts: DateTime<Utc>,
    pub severity: Severity,
    pub code: AlertCode,
    pub state: AlertState,
    pub event_id: Uuid,
    pub count: u64,
    pub context: AlertContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_telemetry: Option<Vec<TelemetrySample>>,
}

/// Fault-safe intent published by the health monitor and consumed by the
/// controller loop. Last write wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultSafeIntent {
    pub source_code: Option<AlertCode>,
    pub active: bool,
    pub since_ts: DateTime<Utc>,
    pub reason: String,
}

impl Default for FaultSafeIntent {
    fn default() -> Self {
        Self {
            source_code: None,
            active: false,
            since_ts: Utc::now(),
            reason: String::new(),
        }
    }
}

/// Snapshot of the write-guard accounting, carried on every sample.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WriteCounterSnapshot {
    pub writes_ok: u64,
    pub writes_dedup: u64,
    pub writes_throttle_per_reg: u64,
    pub writes_throttle_global: u64,
    pub writes_error: u64,
}

/// Telemetry payload read from one battery on one tick.
///
/// Unavailable registers are `None` and counted in `comms_faults`; a tick
/// whose read failed outright carries `read_failed = true` with the payload
/// fields empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub soc_percent: Option<f64>,
    pub soc_bms_percent: Option<f64>,
    pub grid_w: Option<f64>,
    pub pv_total_w: f64,
    pub pv_strings_w: Vec<Option<f64>>,
    pub mppts_w: Vec<Option<f64>>,
    pub ct2_w: Option<f64>,
    pub battery_v: Option<f64>,
    pub battery_i: Option<f64>,
    pub battery_w: Option<f64>,
    pub app_mode: Option<f64>,
    pub ems_run_mode: Option<f64>,
    pub comms_faults: u32,
    pub read_failed: bool,
    pub fault_safe: bool,
    pub setpoint_w: f64,
    pub bias_w: f64,
    pub write_counters: WriteCounterSnapshot,
}

/// One telemetry sample, posted in batches to `/blob/ingest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub consus_id: String,
    pub timestamp: DateTime<Utc>,
    pub mode: EmsMode,
    pub payload: TelemetryPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_register_values() {
        assert_eq!(EmsMode::Auto.register_value(), 0x0001);
        assert_eq!(EmsMode::ImportAc.register_value(), 0x0004);
    }

    #[test]
    fn critical_codes_force_fault_safe() {
        for code in [
            AlertCode::EmsCheckFailed,
            AlertCode::BmsAlarm,
            AlertCode::ArcFault,
        ] {
            assert_eq!(code.severity(), Severity::Critical);
            assert!(code.is_fault_safe_trigger());
        }
        assert!(!AlertCode::BmsWarning.is_fault_safe_trigger());
        assert_eq!(AlertCode::ConfigRejected.severity(), Severity::Info);
    }

    #[test]
    fn alert_event_serializes_codes_screaming_snake() {
        let event = AlertEvent {
            site_id: "site-1".into(),
            consus_id: "cns-001".into(),
            ts: Utc::now(),
            severity: Severity::Critical,
            code: AlertCode::BmsAlarm,
            state: AlertState::Active,
            event_id: Uuid::new_v4(),
            count: 1,
            context: AlertContext::default(),
            recent_telemetry: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["code"], "BMS_ALARM");
        assert_eq!(json["severity"], "CRITICAL");
        assert_eq!(json["state"], "ACTIVE");
        assert!(json.get("recent_telemetry").is_none());
    }
}
