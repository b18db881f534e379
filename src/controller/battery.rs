//! Battery unit: typed telemetry aggregation for one device.

use tracing::debug;

use crate::domain::TelemetryPayload;
use crate::error::FieldBusError;
use crate::fieldbus::registers::names;
use crate::fieldbus::RegisterBus;

/// Telemetry aggregator for a single `consus_id`.
///
/// Individual register misses degrade to `None` and bump `comms_faults`;
/// a transport-level failure aborts the read so the controller can mark the
/// whole tick failed.
pub struct BatteryUnit {
    consus_id: String,
}

impl BatteryUnit {
    pub fn new(consus_id: impl Into<String>) -> Self {
        Self {
            consus_id: consus_id.into(),
        }
    }

    pub fn consus_id(&self) -> &str {
        &self.consus_id
    }

    pub async fn read_telemetry<B: RegisterBus + ?Sized>(
        &self,
        bus: &mut B,
        pv_enabled: bool,
    ) -> Result<TelemetryPayload, FieldBusError> {
        let mut faults = 0u32;

        let grid_w = read_optional(bus, names::GRID_METER_POWER, &mut faults).await?;
        let soc_percent = read_optional(bus, names::BATTERY_SOC, &mut faults).await?;
        let soc_bms_percent = read_optional(bus, names::BATTERY_SOC_BMS, &mut faults).await?;
        let battery_v = read_optional(bus, names::BATTERY_VOLTAGE, &mut faults).await?;
        let battery_i = read_optional(bus, names::BATTERY_CURRENT, &mut faults).await?;
        let battery_w = read_optional(bus, names::BATTERY_POWER, &mut faults).await?;
        let app_mode = read_optional(bus, names::APP_MODE, &mut faults).await?;
        let ems_run_mode = read_optional(bus, names::EMS_RUN_MODE, &mut faults).await?;

        let mut pv_strings_w = Vec::with_capacity(names::PV_STRING_POWER.len());
        let mut mppts_w = Vec::with_capacity(names::MPPT_POWER.len());
        let mut ct2_w = None;
        if pv_enabled {
            for name in names::PV_STRING_POWER {
                pv_strings_w.push(read_optional(bus, name, &mut faults).await?);
            }
            for name in names::MPPT_POWER {
                mppts_w.push(read_optional(bus, name, &mut faults).await?);
            }
            ct2_w = read_optional(bus, names::CT2_POWER, &mut faults).await?;
        }

        let pv_total_w = if pv_enabled {
            pv_strings_w
                .iter()
                .chain(mppts_w.iter())
                .chain(std::iter::once(&ct2_w))
                .filter_map(|v| *v)
                .sum()
        } else {
            0.0
        };

        Ok(TelemetryPayload {
            soc_percent,
            soc_bms_percent,
            grid_w,
            pv_total_w,
            pv_strings_w,
            mppts_w,
            ct2_w,
            battery_v,
            battery_i,
            battery_w,
            app_mode,
            ems_run_mode,
            comms_faults: faults,
            ..TelemetryPayload::default()
        })
    }
}

async fn read_optional<B: RegisterBus + ?Sized>(
    bus: &mut B,
    name: &str,
    faults: &mut u32,
) -> Result<Option<f64>, FieldBusError> {
    match bus.read(name).await {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_transport() => Err(err),
        Err(err) => {
            debug!(register = name, error = %err, "register unavailable");
            *faults += 1;
            Ok(None)
        }
    }
}
