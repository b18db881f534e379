//! Health monitor: debounced per-code alert state machines and the
//! fault-safe intent.
//!
//! Polls the device's health registers on its own field-bus session. Each
//! alert code runs a two-state machine with debounce, so a raw condition
//! must persist for N consecutive polls before it transitions; transient
//! flaps never produce events. FAULT_SAFE is the disjunction of the
//! CRITICAL-active states, published through a single-slot watch cell.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    AlertCode, AlertContext, AlertEvent, AlertState, FaultSafeIntent, TelemetrySample,
};
use crate::error::FieldBusError;
use crate::fieldbus::registers::names;
use crate::fieldbus::RegisterBus;
use crate::state::EdgeStateStore;

#[derive(Debug, Clone)]
pub struct HealthLimits {
    pub ems_check_expected: f64,
    pub parallel_comm_expected: f64,
    pub stale_after: Duration,
    pub debounce_polls: u8,
    pub poll_interval: Duration,
}

impl Default for HealthLimits {
    fn default() -> Self {
        Self {
            ems_check_expected: 1.0,
            parallel_comm_expected: 0.0,
            stale_after: Duration::from_secs(3),
            debounce_polls: 2,
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Activated,
    Cleared,
}

/// One alert code's OFF <-> ACTIVE machine.
#[derive(Debug, Default)]
struct AlertMachine {
    active: bool,
    streak: u8,
    event_id: Option<Uuid>,
    entries: u64,
}

impl AlertMachine {
    /// Feed one poll's raw condition. `None` means no observation this
    /// poll: the streak resets and the state holds.
    fn observe(&mut self, raw: Option<bool>, required: u8) -> Option<Transition> {
        let Some(raw) = raw else {
            self.streak = 0;
            return None;
        };
        if raw == self.active {
            self.streak = 0;
            return None;
        }
        self.streak += 1;
        if self.streak < required.max(1) {
            return None;
        }
        self.streak = 0;
        self.active = raw;
        if raw {
            self.entries += 1;
            self.event_id = Some(Uuid::new_v4());
            Some(Transition::Activated)
        } else {
            Some(Transition::Cleared)
        }
    }
}

/// Codes evaluated from the health-register poll, in emission order.
const POLLED_CODES: [AlertCode; 8] = [
    AlertCode::EmsCheckFailed,
    AlertCode::BmsAlarm,
    AlertCode::ArcFault,
    AlertCode::BmsWarning,
    AlertCode::ParallelCommFault,
    AlertCode::MeterPathFault,
    AlertCode::StaleTelemetry,
    AlertCode::CommissioningDrift,
];

pub struct HealthMonitor {
    consus_id: String,
    site_id: String,
    limits: HealthLimits,
    machines: Vec<(AlertCode, AlertMachine)>,
    store: Arc<EdgeStateStore>,
    intent_tx: watch::Sender<FaultSafeIntent>,
    alert_tx: mpsc::Sender<AlertEvent>,
    last_sample_rx: watch::Receiver<Option<TelemetrySample>>,
}

impl HealthMonitor {
    pub fn new(
        consus_id: impl Into<String>,
        site_id: impl Into<String>,
        limits: HealthLimits,
        store: Arc<EdgeStateStore>,
        intent_tx: watch::Sender<FaultSafeIntent>,
        alert_tx: mpsc::Sender<AlertEvent>,
        last_sample_rx: watch::Receiver<Option<TelemetrySample>>,
    ) -> Self {
        Self {
            consus_id: consus_id.into(),
            site_id: site_id.into(),
            limits,
            machines: POLLED_CODES
                .iter()
                .map(|code| (*code, AlertMachine::default()))
                .collect(),
            store,
            intent_tx,
            alert_tx,
            last_sample_rx,
        }
    }

    pub async fn run<B: RegisterBus>(mut self, mut bus: B, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.limits.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.poll(&mut bus).await {
                        // Transport errors never alter alert states or the
                        // fault-safe intent by themselves.
                        warn!(consus_id = %self.consus_id, error = %err, "health poll failed");
                    }
                }
            }
        }
        info!(consus_id = %self.consus_id, "health monitor stopped");
    }

    /// One poll: read health registers, step every machine, emit
    /// transitions and republish the fault-safe disjunction.
    pub async fn poll<B: RegisterBus + ?Sized>(
        &mut self,
        bus: &mut B,
    ) -> Result<(), FieldBusError> {
        let ems_check = read_health(bus, names::EMS_CHECK_STATUS).await?;
        let bms_warning = read_health(bus, names::BMS_WARNING_BITS).await?;
        let bms_alarm = read_health(bus, names::BMS_ALARM_BITS).await?;
        let bms_soh = read_health(bus, names::BMS_SOH_PERCENT).await?;
        let arc_fault = read_health(bus, names::ARC_FAULT).await?;
        let parallel_comm = read_health(bus, names::PARALLEL_COMM_STATUS).await?;
        let meter_comm = read_health(bus, names::METER_COMM_STATUS).await?;
        let meter_connect = read_health(bus, names::METER_CONNECT_STATUS).await?;
        let meter_path = read_health(bus, names::METER_PATH_CHECK).await?;
        let comm_loss_echo = read_health(bus, names::REMOTE_COMM_LOSS_TIME).await?;

        if let Some(soh) = bms_soh {
            debug!(consus_id = %self.consus_id, soh_percent = soh, "bms state of health");
        }

        let settings = self.store.snapshot().settings;
        let now = Utc::now();

        let stale = match self.last_sample_rx.borrow().as_ref() {
            None => true,
            Some(sample) => {
                (now - sample.timestamp).num_milliseconds()
                    > self.limits.stale_after.as_millis() as i64
            }
        };

        let meter_path_raw = match (meter_comm, meter_connect, meter_path) {
            (None, None, None) => None,
            (comm, connect, path) => Some(
                comm.is_some_and(|v| v != 1.0)
                    || connect.is_some_and(|v| v != 1.0)
                    || path.is_some_and(|v| v == 0.0),
            ),
        };

        let drift_raw = match settings.remote_comm_loss_s {
            Some(expected) => comm_loss_echo.map(|echo| (echo - expected).abs() > 0.5),
            None => Some(false),
        };

        let raws: [(AlertCode, Option<bool>); 8] = [
            (
                AlertCode::EmsCheckFailed,
                ems_check.map(|v| v != self.limits.ems_check_expected),
            ),
            (AlertCode::BmsAlarm, bms_alarm.map(|v| v != 0.0)),
            (AlertCode::ArcFault, arc_fault.map(|v| v != 0.0)),
            (AlertCode::BmsWarning, bms_warning.map(|v| v != 0.0)),
            (
                AlertCode::ParallelCommFault,
                parallel_comm.map(|v| v != self.limits.parallel_comm_expected),
            ),
            (AlertCode::MeterPathFault, meter_path_raw),
            (AlertCode::StaleTelemetry, Some(stale)),
            (AlertCode::CommissioningDrift, drift_raw),
        ];

        let context = self.context();
        let required = self.limits.debounce_polls;
        let mut events = Vec::new();
        for (code, machine) in &mut self.machines {
            let raw = raws
                .iter()
                .find(|(c, _)| *c == *code)
                .and_then(|(_, raw)| *raw);
            if let Some(transition) = machine.observe(raw, required) {
                let state = match transition {
                    Transition::Activated => AlertState::Active,
                    Transition::Cleared => AlertState::Cleared,
                };
                events.push(AlertEvent {
                    site_id: self.site_id.clone(),
                    consus_id: self.consus_id.clone(),
                    ts: now,
                    severity: code.severity(),
                    code: *code,
                    state,
                    event_id: machine.event_id.unwrap_or_else(Uuid::new_v4),
                    count: machine.entries,
                    context: context.clone(),
                    recent_telemetry: None,
                });
            }
        }

        for event in events {
            info!(
                consus_id = %self.consus_id,
                code = %event.code,
                state = %event.state,
                severity = %event.severity,
                "alert transition"
            );
            if self.alert_tx.send(event).await.is_err() {
                warn!("alert queue closed, dropping health event");
            }
        }

        self.publish_fault_safe(now);
        Ok(())
    }

    fn context(&self) -> AlertContext {
        match self.last_sample_rx.borrow().as_ref() {
            Some(sample) => AlertContext {
                mode: Some(sample.mode),
                soc: sample.payload.soc_percent,
                grid_w: sample.payload.grid_w,
                pv_w: Some(sample.payload.pv_total_w),
                bias_w: Some(sample.payload.bias_w),
            },
            None => AlertContext::default(),
        }
    }

    fn publish_fault_safe(&self, now: chrono::DateTime<Utc>) {
        let source = self
            .machines
            .iter()
            .find(|(code, machine)| code.is_fault_safe_trigger() && machine.active)
            .map(|(code, _)| *code);
        let active = source.is_some();
        if self.intent_tx.borrow().active == active {
            return;
        }
        let intent = FaultSafeIntent {
            source_code: source,
            active,
            since_ts: now,
            reason: source
                .map(|code| format!("{code} active"))
                .unwrap_or_else(|| "all critical alerts cleared".to_string()),
        };
        info!(active, source = ?intent.source_code, "fault-safe intent transition");
        self.intent_tx.send_replace(intent);
    }
}

async fn read_health<B: RegisterBus + ?Sized>(
    bus: &mut B,
    name: &str,
) -> Result<Option<f64>, FieldBusError> {
    match bus.read(name).await {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_transport() => Err(err),
        Err(err) => {
            debug!(register = name, error = %err, "health register unavailable");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EmsMode, TelemetryPayload};
    use crate::fieldbus::testbus::ScriptedBus;
    use crate::state::test_settings;
    use std::collections::HashMap;

    struct Fixture {
        monitor: HealthMonitor,
        bus: ScriptedBus,
        intent_rx: watch::Receiver<FaultSafeIntent>,
        alert_rx: mpsc::Receiver<AlertEvent>,
        last_sample_tx: watch::Sender<Option<TelemetrySample>>,
    }

    fn healthy_bus() -> ScriptedBus {
        let mut bus = ScriptedBus::new();
        bus.set(names::EMS_CHECK_STATUS, 1.0)
            .set(names::BMS_WARNING_BITS, 0.0)
            .set(names::BMS_ALARM_BITS, 0.0)
            .set(names::BMS_SOH_PERCENT, 98.0)
            .set(names::ARC_FAULT, 0.0)
            .set(names::PARALLEL_COMM_STATUS, 0.0)
            .set(names::METER_COMM_STATUS, 1.0)
            .set(names::METER_CONNECT_STATUS, 1.0)
            .set(names::METER_PATH_CHECK, 1.0)
            .set(names::REMOTE_COMM_LOSS_TIME, 0.0);
        bus
    }

    fn fresh_sample() -> TelemetrySample {
        TelemetrySample {
            consus_id: "cns-001".into(),
            timestamp: Utc::now(),
            mode: EmsMode::ImportAc,
            payload: TelemetryPayload {
                soc_percent: Some(55.0),
                grid_w: Some(-20.0),
                pv_total_w: 400.0,
                ..TelemetryPayload::default()
            },
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(EdgeStateStore::new(
            test_settings(),
            HashMap::new(),
            Vec::new(),
        ));
        let (intent_tx, intent_rx) = watch::channel(FaultSafeIntent::default());
        let (alert_tx, alert_rx) = mpsc::channel(16);
        let (last_sample_tx, last_sample_rx) = watch::channel(Some(fresh_sample()));
        let monitor = HealthMonitor::new(
            "cns-001",
            "site-1",
            HealthLimits::default(),
            store,
            intent_tx,
            alert_tx,
            last_sample_rx,
        );
        Fixture {
            monitor,
            bus: healthy_bus(),
            intent_rx,
            alert_rx,
            last_sample_tx,
        }
    }

    impl Fixture {
        async fn poll(&mut self) {
            // Keep the telemetry slot fresh unless a test overrides it.
            self.monitor.poll(&mut self.bus).await.unwrap();
        }

        fn refresh_sample(&self) {
            self.last_sample_tx.send_replace(Some(fresh_sample()));
        }
    }

    #[tokio::test]
    async fn healthy_device_raises_nothing() {
        let mut f = fixture();
        for _ in 0..5 {
            f.refresh_sample();
            f.poll().await;
        }
        assert!(f.alert_rx.try_recv().is_err());
        assert!(!f.intent_rx.borrow().active);
    }

    #[tokio::test]
    async fn alarm_needs_two_polls_to_activate() {
        let mut f = fixture();
        f.bus.set(names::BMS_ALARM_BITS, 0x0004 as f64);
        f.refresh_sample();
        f.poll().await;
        assert!(f.alert_rx.try_recv().is_err());
        assert!(!f.intent_rx.borrow().active);

        f.refresh_sample();
        f.poll().await;
        let event = f.alert_rx.try_recv().unwrap();
        assert_eq!(event.code, AlertCode::BmsAlarm);
        assert_eq!(event.state, AlertState::Active);
        assert_eq!(event.count, 1);
        assert_eq!(event.context.soc, Some(55.0));

        let intent = f.intent_rx.borrow().clone();
        assert!(intent.active);
        assert_eq!(intent.source_code, Some(AlertCode::BmsAlarm));
    }

    #[tokio::test]
    async fn transient_flap_is_debounced_away() {
        let mut f = fixture();
        f.bus.set(names::ARC_FAULT, 1.0);
        f.refresh_sample();
        f.poll().await;
        f.bus.set(names::ARC_FAULT, 0.0);
        for _ in 0..3 {
            f.refresh_sample();
            f.poll().await;
        }
        assert!(f.alert_rx.try_recv().is_err());
        assert!(!f.intent_rx.borrow().active);
    }

    #[tokio::test]
    async fn clear_keeps_event_id_and_count_is_monotone() {
        let mut f = fixture();
        f.bus.set(names::BMS_ALARM_BITS, 1.0);
        for _ in 0..2 {
            f.refresh_sample();
            f.poll().await;
        }
        let active = f.alert_rx.try_recv().unwrap();

        f.bus.set(names::BMS_ALARM_BITS, 0.0);
        for _ in 0..2 {
            f.refresh_sample();
            f.poll().await;
        }
        let cleared = f.alert_rx.try_recv().unwrap();
        assert_eq!(cleared.state, AlertState::Cleared);
        assert_eq!(cleared.event_id, active.event_id);
        assert_eq!(cleared.count, 1);
        assert!(!f.intent_rx.borrow().active);

        // Re-entry gets a fresh interval id and a bumped count.
        f.bus.set(names::BMS_ALARM_BITS, 1.0);
        for _ in 0..2 {
            f.refresh_sample();
            f.poll().await;
        }
        let again = f.alert_rx.try_recv().unwrap();
        assert_eq!(again.state, AlertState::Active);
        assert_ne!(again.event_id, active.event_id);
        assert_eq!(again.count, 2);
    }

    #[tokio::test]
    async fn fault_safe_is_disjunction_of_criticals() {
        let mut f = fixture();
        f.bus.set(names::BMS_ALARM_BITS, 1.0);
        f.bus.set(names::EMS_CHECK_STATUS, 3.0);
        for _ in 0..2 {
            f.refresh_sample();
            f.poll().await;
        }
        assert!(f.intent_rx.borrow().active);

        // One critical clears, the other keeps the intent up.
        f.bus.set(names::EMS_CHECK_STATUS, 1.0);
        for _ in 0..2 {
            f.refresh_sample();
            f.poll().await;
        }
        assert!(f.intent_rx.borrow().active);

        f.bus.set(names::BMS_ALARM_BITS, 0.0);
        for _ in 0..2 {
            f.refresh_sample();
            f.poll().await;
        }
        assert!(!f.intent_rx.borrow().active);
    }

    #[tokio::test]
    async fn stale_telemetry_raises_warning() {
        let mut f = fixture();
        let mut old = fresh_sample();
        old.timestamp = Utc::now() - chrono::Duration::seconds(10);
        f.last_sample_tx.send_replace(Some(old));
        f.poll().await;
        f.poll().await;
        let event = f.alert_rx.try_recv().unwrap();
        assert_eq!(event.code, AlertCode::StaleTelemetry);
        assert_eq!(event.severity, crate::domain::Severity::Warning);
        // Staleness alone never forces fault-safe.
        assert!(!f.intent_rx.borrow().active);
    }

    #[tokio::test]
    async fn transport_failure_holds_state() {
        let mut f = fixture();
        f.bus.set(names::BMS_ALARM_BITS, 1.0);
        for _ in 0..2 {
            f.refresh_sample();
            f.poll().await;
        }
        assert!(f.intent_rx.borrow().active);
        let _ = f.alert_rx.try_recv();

        f.bus.set_transport_down(true);
        assert!(f.monitor.poll(&mut f.bus).await.is_err());
        assert!(f.intent_rx.borrow().active);
        assert!(f.alert_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unavailable_register_neither_activates_nor_clears() {
        let mut f = fixture();
        f.bus.set(names::BMS_ALARM_BITS, 1.0);
        for _ in 0..2 {
            f.refresh_sample();
            f.poll().await;
        }
        let _ = f.alert_rx.try_recv();

        f.bus.fail_register(names::BMS_ALARM_BITS);
        for _ in 0..3 {
            f.refresh_sample();
            f.poll().await;
        }
        assert!(f.intent_rx.borrow().active);
        assert!(f.alert_rx.try_recv().is_err());
    }
}
