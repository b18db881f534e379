//! Per-battery controller loop.
//!
//! One cooperative task per battery: snapshot settings, read telemetry,
//! consult the fault-safe intent, apply the EMS decision and publish the
//! sample. Tick-local errors never leave the loop; a failed read marks the
//! tick failed and carries on.

pub mod battery;
pub mod ems;
pub mod health;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bootstrap::BootstrapClient;
use crate::domain::{
    AlertCode, AlertContext, AlertEvent, AlertState, EmsMode, FaultSafeIntent, TelemetryPayload,
    TelemetrySample,
};
use crate::fieldbus::RegisterBus;
use crate::state::{EdgeSnapshot, EdgeStateStore, TaskKind};
use battery::BatteryUnit;
use ems::{EmsManager, TickInput};

pub struct ControlLoop<B: RegisterBus> {
    site_id: String,
    bus: B,
    unit: BatteryUnit,
    ems: EmsManager,
    store: Arc<EdgeStateStore>,
    bootstrap: Option<Arc<BootstrapClient>>,
    fault_rx: watch::Receiver<FaultSafeIntent>,
    sample_tx: mpsc::Sender<TelemetrySample>,
    alert_tx: mpsc::Sender<AlertEvent>,
    last_sample_tx: watch::Sender<Option<TelemetrySample>>,
    tick_period: Duration,
    seen_tasks: HashSet<String>,
    last_mode: EmsMode,
    samples_dropped: u64,
}

impl<B: RegisterBus> ControlLoop<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        site_id: impl Into<String>,
        consus_id: impl Into<String>,
        bus: B,
        store: Arc<EdgeStateStore>,
        bootstrap: Option<Arc<BootstrapClient>>,
        fault_rx: watch::Receiver<FaultSafeIntent>,
        sample_tx: mpsc::Sender<TelemetrySample>,
        alert_tx: mpsc::Sender<AlertEvent>,
        last_sample_tx: watch::Sender<Option<TelemetrySample>>,
        tick_period: Duration,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            bus,
            unit: BatteryUnit::new(consus_id),
            ems: EmsManager::new(tick_period),
            store,
            bootstrap,
            fault_rx,
            sample_tx,
            alert_tx,
            last_sample_tx,
            tick_period,
            seen_tasks: HashSet::new(),
            last_mode: EmsMode::Auto,
            samples_dropped: 0,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_period);
        // Overruns are not queued: missed ticks are dropped and the next
        // one fires on schedule.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.run_tick(Utc::now(), Instant::now()).await,
            }
        }
        // Leave the inverter in a safe posture if we were importing.
        let per_reg_min = self.store.snapshot().settings.write_guard.per_reg_min_s;
        self.ems
            .shutdown(&mut self.bus, Duration::from_secs_f64(per_reg_min.max(0.0)))
            .await;
        info!(consus_id = %self.unit.consus_id(), "controller loop stopped");
    }

    pub async fn run_tick(&mut self, now_utc: DateTime<Utc>, now: Instant) {
        let snapshot = self.store.snapshot();
        let Some(config) = snapshot
            .battery_configs
            .get(self.unit.consus_id())
            .cloned()
        else {
            debug!(consus_id = %self.unit.consus_id(), "no battery config in store, skipping tick");
            return;
        };
        self.bus
            .set_guard_config(snapshot.settings.write_guard.to_config());

        self.process_tasks(&snapshot, now_utc).await;

        let fault = self.fault_rx.borrow().clone();

        let payload = match self
            .unit
            .read_telemetry(&mut self.bus, config.pv_enabled)
            .await
        {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(
                    consus_id = %self.unit.consus_id(),
                    error = %err,
                    "telemetry read failed, tick marked failed"
                );
                None
            }
        };

        let (mode, mut payload) = match payload {
            Some(mut payload) => {
                let input = TickInput {
                    settings: &snapshot.settings,
                    config: &config,
                    soc_percent: payload.soc_percent,
                    grid_w: payload.grid_w,
                    pv_total_w: payload.pv_total_w,
                    fault_safe: fault.active,
                    now_utc,
                    now,
                };
                match self.ems.tick(&mut self.bus, &input).await {
                    Ok(report) => {
                        payload.setpoint_w = report.setpoint_w;
                        payload.bias_w = report.bias_w;
                        for (code, reason) in report.warnings {
                            self.send_event(code, reason, now_utc).await;
                        }
                        self.last_mode = report.mode;
                        (report.mode, payload)
                    }
                    Err(err) => {
                        warn!(
                            consus_id = %self.unit.consus_id(),
                            error = %err,
                            "EMS apply failed"
                        );
                        (self.last_mode, payload)
                    }
                }
            }
            None => (
                self.last_mode,
                TelemetryPayload {
                    read_failed: true,
                    ..TelemetryPayload::default()
                },
            ),
        };

        payload.fault_safe = fault.active;
        payload.write_counters = self.bus.write_counters();

        let sample = TelemetrySample {
            consus_id: self.unit.consus_id().to_string(),
            timestamp: now_utc,
            mode,
            payload,
        };

        // The freshness slot only advances on successful reads; the health
        // monitor derives staleness from it.
        if !sample.payload.read_failed {
            self.last_sample_tx.send_replace(Some(sample.clone()));
        }
        if self.sample_tx.try_send(sample).is_err() {
            self.samples_dropped += 1;
            warn!(
                consus_id = %self.unit.consus_id(),
                dropped = self.samples_dropped,
                "telemetry queue full, sample dropped"
            );
        }
    }

    async fn process_tasks(&mut self, snapshot: &EdgeSnapshot, now_utc: DateTime<Utc>) {
        let tasks: Vec<_> = snapshot
            .tasks
            .iter()
            .filter(|task| !self.seen_tasks.contains(&task.id))
            .filter(|task| {
                task.consus_id.is_none() || task.consus_id.as_deref() == Some(self.unit.consus_id())
            })
            .cloned()
            .collect();
        for task in tasks {
            self.seen_tasks.insert(task.id.clone());
            match task.kind {
                TaskKind::ValidateModbus => {
                    info!(task_id = %task.id, "validate_modbus requested, re-running commissioning");
                    self.ems.request_recommission();
                    self.report_validation(now_utc, "validate_modbus").await;
                }
                TaskKind::ValidateState => {
                    self.report_validation(now_utc, "validate_state").await;
                }
                TaskKind::Unknown => {
                    debug!(task_id = %task.id, "ignoring unrecognized task kind");
                }
            }
        }
    }

    async fn report_validation(&mut self, now_utc: DateTime<Utc>, which: &str) {
        let Some(bootstrap) = self.bootstrap.clone() else {
            return;
        };
        let result = match which {
            "validate_modbus" => bootstrap.validate_modbus().await,
            _ => bootstrap.validate_state().await,
        };
        match result {
            Ok(report) if report.ok => {
                info!(check = which, "validation passed");
            }
            Ok(report) => {
                warn!(check = which, errors = ?report.errors, "validation reported errors");
                self.send_event(
                    AlertCode::CommissioningDrift,
                    format!("{which}: {}", report.errors.join("; ")),
                    now_utc,
                )
                .await;
            }
            Err(err) => {
                warn!(check = which, error = %err, "validation request failed");
            }
        }
    }

    async fn send_event(&mut self, code: AlertCode, reason: String, now_utc: DateTime<Utc>) {
        debug!(code = %code, reason = %reason, "controller alert");
        let event = AlertEvent {
            site_id: self.site_id.clone(),
            consus_id: self.unit.consus_id().to_string(),
            ts: now_utc,
            severity: code.severity(),
            code,
            state: AlertState::Active,
            event_id: Uuid::new_v4(),
            count: 1,
            context: AlertContext::default(),
            recent_telemetry: None,
        };
        if self.alert_tx.send(event).await.is_err() {
            warn!("alert queue closed, controller event dropped");
        }
    }
}
