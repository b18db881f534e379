//! EMS manager: commissioning, mode selection and setpoint shaping.
//!
//! Drives the inverter into the correct mode each tick. The import setpoint
//! pipeline is PV subtraction, floor, clamp, then a ramp referenced to the
//! last *accepted* setpoint write, so throttled ticks never make the next
//! accepted write jump.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::domain::{AlertCode, EmsMode};
use crate::error::FieldBusError;
use crate::fieldbus::registers::names;
use crate::fieldbus::RegisterBus;
use crate::state::{EdgeBatteryConfig, Settings};

/// Everything the EMS needs for one tick's decision.
pub struct TickInput<'a> {
    pub settings: &'a Settings,
    pub config: &'a EdgeBatteryConfig,
    pub soc_percent: Option<f64>,
    pub grid_w: Option<f64>,
    pub pv_total_w: f64,
    pub fault_safe: bool,
    pub now_utc: DateTime<Utc>,
    pub now: Instant,
}

/// What the tick decided; feeds the telemetry sample.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub mode: EmsMode,
    pub setpoint_w: f64,
    pub bias_w: f64,
    pub warnings: Vec<(AlertCode, String)>,
}

pub struct EmsManager {
    tick_period: Duration,
    previous_setpoint_w: f64,
    last_accepted_setpoint_at: Option<Instant>,
    commission_attempted: bool,
    recommission_requested: bool,
    /// Set between the two ticks of the Import-AC exit sequence: the
    /// setpoint has been zeroed, the mode write is still owed.
    exit_mode_pending: bool,
    last_commanded_mode: Option<EmsMode>,
    bias_w: f64,
    bias_base: Option<f64>,
}

impl EmsManager {
    pub fn new(tick_period: Duration) -> Self {
        Self {
            tick_period,
            previous_setpoint_w: 0.0,
            last_accepted_setpoint_at: None,
            commission_attempted: false,
            recommission_requested: false,
            exit_mode_pending: false,
            last_commanded_mode: None,
            bias_w: 0.0,
            bias_base: None,
        }
    }

    /// Re-run commissioning on the next tick (operator `validate_modbus`).
    pub fn request_recommission(&mut self) {
        self.recommission_requested = true;
    }

    pub async fn tick<B: RegisterBus + ?Sized>(
        &mut self,
        bus: &mut B,
        input: &TickInput<'_>,
    ) -> Result<TickReport, FieldBusError> {
        let mut warnings = Vec::new();

        if !self.commission_attempted || self.recommission_requested {
            self.commission_attempted = true;
            self.recommission_requested = false;
            let failures = self.commission(bus, input.settings).await;
            if !failures.is_empty() {
                warnings.push((AlertCode::CommissioningFailed, failures.join("; ")));
            }
        }

        let target_soc = input
            .settings
            .target_soc_percent
            .min(input.config.max_soc_percent.unwrap_or(100.0));
        let in_window = input.settings.in_cheap_window(input.now_utc);
        let wants_import = !input.fault_safe
            && in_window
            && matches!(input.soc_percent, Some(soc) if soc < target_soc);

        if wants_import {
            self.exit_mode_pending = false;
            self.import_tick(bus, input, warnings).await
        } else {
            self.auto_tick(bus, input, in_window, warnings).await
        }
    }

    async fn import_tick<B: RegisterBus + ?Sized>(
        &mut self,
        bus: &mut B,
        input: &TickInput<'_>,
        mut warnings: Vec<(AlertCode, String)>,
    ) -> Result<TickReport, FieldBusError> {
        let mode_outcome = bus
            .write(
                names::EMS_POWER_MODE,
                f64::from(EmsMode::ImportAc.register_value()),
            )
            .await?;
        if mode_outcome.reached_device() {
            self.last_commanded_mode = Some(EmsMode::ImportAc);
        }

        let max_charge_w = input.config.max_charge_w.min(input.settings.max_charge_w);
        let target = shape_import_target(
            input.settings.import_charge_power_w,
            input.pv_total_w,
            input.settings.min_import_w,
            max_charge_w,
        );
        let dt = self.ramp_dt(input.now);
        let shaped = ramp_toward(
            self.previous_setpoint_w,
            target,
            input.config.max_ramp_rate_w_per_s,
            dt,
        )
        .clamp(0.0, max_charge_w);

        if !shaped.is_finite() {
            warn!(target, shaped, "import setpoint shaping produced a non-finite value");
            warnings.push((
                AlertCode::InvariantBreach,
                format!("import setpoint shaping produced {shaped} from target {target}"),
            ));
            return self.auto_tick(bus, input, true, warnings).await;
        }

        let outcome = bus.write(names::EMS_POWER_SET, shaped).await?;
        if outcome.applied() {
            self.previous_setpoint_w = shaped;
            self.last_accepted_setpoint_at = Some(input.now);
        } else {
            debug!(shaped, "setpoint write dropped, ramp reference unchanged");
        }

        Ok(TickReport {
            mode: EmsMode::ImportAc,
            setpoint_w: shaped,
            bias_w: self.bias_w,
            warnings,
        })
    }

    async fn auto_tick<B: RegisterBus + ?Sized>(
        &mut self,
        bus: &mut B,
        input: &TickInput<'_>,
        in_window: bool,
        warnings: Vec<(AlertCode, String)>,
    ) -> Result<TickReport, FieldBusError> {
        let exiting_import =
            matches!(self.last_commanded_mode, Some(EmsMode::ImportAc)) && !self.exit_mode_pending;

        // Setpoint first, always. During the exit sequence the mode write
        // waits a tick so the two writes honor the per-register interval.
        let outcome = bus.write(names::EMS_POWER_SET, 0.0).await?;
        if outcome.applied() {
            self.previous_setpoint_w = 0.0;
            self.last_accepted_setpoint_at = Some(input.now);
        }

        if exiting_import {
            self.exit_mode_pending = true;
            return Ok(TickReport {
                mode: EmsMode::Auto,
                setpoint_w: 0.0,
                bias_w: self.bias_w,
                warnings,
            });
        }

        if self.exit_mode_pending || self.last_commanded_mode != Some(EmsMode::Auto) {
            let mode_outcome = bus
                .write(
                    names::EMS_POWER_MODE,
                    f64::from(EmsMode::Auto.register_value()),
                )
                .await?;
            // A throttled mode write leaves the sequence pending for retry.
            if mode_outcome.reached_device() {
                self.exit_mode_pending = false;
                self.last_commanded_mode = Some(EmsMode::Auto);
            }
        }

        self.update_bias(input, in_window);
        bus.write(names::METER_TARGET_BIAS, self.bias_w).await?;

        if !input.fault_safe {
            bus.write(names::EXPORT_POWER_CAP, input.settings.export_cap_w)
                .await?;
        }

        Ok(TickReport {
            mode: EmsMode::Auto,
            setpoint_w: 0.0,
            bias_w: self.bias_w,
            warnings,
        })
    }

    fn update_bias(&mut self, input: &TickInput<'_>, in_window: bool) {
        let split = &input.settings.bias_split;
        let base = if split.enable {
            // Fault-safe always takes the day value.
            if !input.fault_safe && in_window {
                split.bias_night_w
            } else {
                split.bias_day_w
            }
        } else {
            input.settings.meter_bias_w
        };
        // Operator changed the base bias: restart trimming from it.
        if self.bias_base != Some(base) {
            self.bias_w = base;
            self.bias_base = Some(base);
        }

        let trim = &input.settings.auto_bias_trim;
        if input.fault_safe || !trim.enable {
            return;
        }
        let Some(grid_w) = input.grid_w else { return };
        let residual = grid_w - trim.target_w;
        if residual.abs() <= trim.deadband_w {
            return;
        }
        self.bias_w =
            (self.bias_w - residual.signum() * trim.step_w).clamp(trim.min_w, trim.max_w);
    }

    fn ramp_dt(&self, now: Instant) -> f64 {
        match self.last_accepted_setpoint_at {
            Some(at) => now.saturating_duration_since(at).as_secs_f64(),
            None => self.tick_period.as_secs_f64(),
        }
    }

    async fn commission<B: RegisterBus + ?Sized>(
        &mut self,
        bus: &mut B,
        settings: &Settings,
    ) -> Vec<String> {
        let writes: [(&str, Option<f64>); 5] = [
            (names::MANUFACTURER_CODE, Some(2.0)),
            (names::EXTERNAL_METER_ENABLE, Some(1.0)),
            (names::FEED_POWER_ENABLE, Some(1.0)),
            (names::EXPORT_POWER_CAP, Some(settings.export_cap_w)),
            (names::REMOTE_COMM_LOSS_TIME, settings.remote_comm_loss_s),
        ];
        let mut failures = Vec::new();
        for (name, value) in writes {
            let Some(value) = value else { continue };
            if let Err(err) = bus.write(name, value).await {
                warn!(register = name, error = %err, "commissioning write failed");
                failures.push(format!("{name}: {err}"));
            }
        }
        failures
    }

    /// Shutdown path: if the device was last commanded into Import-AC, zero
    /// the setpoint and return it to Auto with an intra-write delay that
    /// satisfies the per-register interval.
    pub async fn shutdown<B: RegisterBus + ?Sized>(&mut self, bus: &mut B, per_reg_min: Duration) {
        if !matches!(self.last_commanded_mode, Some(EmsMode::ImportAc)) && !self.exit_mode_pending {
            return;
        }
        if let Err(err) = bus.write(names::EMS_POWER_SET, 0.0).await {
            warn!(error = %err, "shutdown setpoint write failed");
        }
        tokio::time::sleep(per_reg_min).await;
        if let Err(err) = bus
            .write(
                names::EMS_POWER_MODE,
                f64::from(EmsMode::Auto.register_value()),
            )
            .await
        {
            warn!(error = %err, "shutdown mode write failed");
        }
        self.exit_mode_pending = false;
        self.last_commanded_mode = Some(EmsMode::Auto);
    }
}

/// Import setpoint before ramping: PV subtraction, floor, clamp.
pub fn shape_import_target(
    import_charge_power_w: f64,
    pv_total_w: f64,
    min_import_w: f64,
    max_charge_w: f64,
) -> f64 {
    let raw = (import_charge_power_w - pv_total_w).max(min_import_w);
    raw.clamp(0.0, max_charge_w)
}

/// Move from `previous` toward `target`, bounded by the ramp rate.
pub fn ramp_toward(previous: f64, target: f64, rate_w_per_s: f64, dt_s: f64) -> f64 {
    let max_delta = rate_w_per_s * dt_s.max(0.0);
    previous + (target - previous).clamp(-max_delta, max_delta)
}
