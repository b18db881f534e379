//! Edge state store: process-wide settings, battery configs and tasks.
//!
//! The store is single-writer (the config-bus callback) and multi-reader.
//! Each subtree lives behind its own `Arc`, so an update is an atomic
//! whole-key replacement and a reader's snapshot is a handful of `Arc`
//! clones; no reader ever observes a partial merge.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigError;
use crate::fieldbus::write_guard::WriteGuardConfig;

/// Wall-clock window in site-local time; may wrap midnight.
/// Start is inclusive, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WallClockWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl WallClockWindow {
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(de)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .map_err(|e| Error::custom(format!("invalid HH:MM `{raw}`: {e}")))
    }
}

/// Automatic meter-bias trim knobs. Bounds default conservatively to
/// ±500 W.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_bias_trim"))]
pub struct BiasTrimSettings {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub target_w: f64,
    #[serde(default = "default_trim_deadband")]
    #[validate(range(min = 0.0))]
    pub deadband_w: f64,
    #[serde(default = "default_trim_step")]
    #[validate(range(min = 0.0))]
    pub step_w: f64,
    #[serde(default = "default_trim_min")]
    pub min_w: f64,
    #[serde(default = "default_trim_max")]
    pub max_w: f64,
}

impl Default for BiasTrimSettings {
    fn default() -> Self {
        Self {
            enable: false,
            target_w: 0.0,
            deadband_w: default_trim_deadband(),
            step_w: default_trim_step(),
            min_w: default_trim_min(),
            max_w: default_trim_max(),
        }
    }
}

fn validate_bias_trim(trim: &BiasTrimSettings) -> Result<(), validator::ValidationError> {
    if trim.min_w > trim.max_w {
        return Err(validator::ValidationError::new(
            "bias trim min_w must not exceed max_w",
        ));
    }
    Ok(())
}

/// Day/night bias split. Disabled by default; until enabled a single
/// `meter_bias_w` applies in both regimes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct BiasSplitSettings {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub bias_day_w: f64,
    #[serde(default)]
    pub bias_night_w: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WriteGuardSettings {
    #[serde(default = "default_per_reg_min_s")]
    #[validate(range(min = 0.0))]
    pub per_reg_min_s: f64,
    #[serde(default = "default_global_writes_per_s")]
    #[validate(range(min = 0.1))]
    pub global_writes_per_s: f64,
    #[serde(default = "default_dedupe_window_s")]
    #[validate(range(min = 0.0))]
    pub dedupe_window_s: f64,
}

impl Default for WriteGuardSettings {
    fn default() -> Self {
        Self {
            per_reg_min_s: default_per_reg_min_s(),
            global_writes_per_s: default_global_writes_per_s(),
            dedupe_window_s: default_dedupe_window_s(),
        }
    }
}

impl WriteGuardSettings {
    pub fn to_config(&self) -> WriteGuardConfig {
        WriteGuardConfig {
            per_reg_min_s: self.per_reg_min_s,
            global_writes_per_s: self.global_writes_per_s,
            dedupe_window_s: self.dedupe_window_s,
        }
    }
}

/// Backend endpoints, fixed at bootstrap for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Endpoints {
    #[validate(url)]
    pub ingest_url: String,
    #[validate(url)]
    pub health_url: String,
    #[validate(url)]
    pub bootstrap_url: String,
}

/// Process-wide deployment settings, hot-reloadable over the config bus.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Settings {
    pub cheap_window: WallClockWindow,

    #[serde(default = "default_timezone")]
    pub timezone: Tz,

    #[validate(range(min = 0.0, max = 100.0))]
    pub target_soc_percent: f64,

    #[validate(range(min = 0.0))]
    pub import_charge_power_w: f64,

    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub min_import_w: f64,

    #[validate(range(min = 0.0))]
    pub export_cap_w: f64,

    #[serde(default)]
    pub meter_bias_w: f64,

    #[serde(default)]
    #[validate(nested)]
    pub bias_split: BiasSplitSettings,

    #[validate(range(min = 0.0))]
    pub max_charge_w: f64,

    #[validate(range(min = 0.001))]
    pub max_ramp_rate_w_per_s: f64,

    #[serde(default = "default_pv_enabled")]
    pub pv_enabled: bool,

    #[serde(default)]
    #[validate(nested)]
    pub auto_bias_trim: BiasTrimSettings,

    #[serde(default)]
    #[validate(nested)]
    pub write_guard: WriteGuardSettings,

    #[validate(nested)]
    pub endpoints: Endpoints,

    #[serde(default = "default_tick_seconds")]
    #[validate(range(min = 1, max = 60))]
    pub tick_seconds: u64,

    /// Inverter watchdog echo target; commissioning writes it when set.
    #[serde(default)]
    pub remote_comm_loss_s: Option<f64>,
}

impl Settings {
    /// Cheap-window membership for an instant, evaluated in site local time.
    pub fn in_cheap_window(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.timezone).time();
        self.cheap_window.contains(local)
    }
}

fn default_timezone() -> Tz {
    chrono_tz::UTC
}

fn default_pv_enabled() -> bool {
    true
}

fn default_tick_seconds() -> u64 {
    1
}

fn default_trim_deadband() -> f64 {
    100.0
}

fn default_trim_step() -> f64 {
    20.0
}

fn default_trim_min() -> f64 {
    -500.0
}

fn default_trim_max() -> f64 {
    500.0
}

fn default_per_reg_min_s() -> f64 {
    0.25
}

fn default_global_writes_per_s() -> f64 {
    5.0
}

fn default_dedupe_window_s() -> f64 {
    30.0
}

/// Per-battery configuration, keyed by `consus_id` in the store.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_battery_config"))]
pub struct EdgeBatteryConfig {
    #[validate(length(min = 1))]
    pub consus_id: String,

    #[validate(length(min = 1))]
    pub host: String,

    #[serde(default = "default_modbus_port")]
    pub port: u16,

    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    #[validate(range(min = 0.0))]
    pub max_charge_w: f64,

    #[validate(range(min = 0.001))]
    pub max_ramp_rate_w_per_s: f64,

    #[serde(default = "default_pv_enabled")]
    pub pv_enabled: bool,

    #[serde(default)]
    pub capacity_wh: Option<f64>,

    #[serde(default)]
    pub reserve_soc_percent: Option<f64>,

    #[serde(default)]
    pub max_soc_percent: Option<f64>,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn validate_battery_config(config: &EdgeBatteryConfig) -> Result<(), validator::ValidationError> {
    if let (Some(reserve), Some(max)) = (config.reserve_soc_percent, config.max_soc_percent) {
        if reserve >= max {
            return Err(validator::ValidationError::new(
                "reserve_soc_percent must be below max_soc_percent",
            ));
        }
    }
    Ok(())
}

/// Operator-initiated tasks delivered through the config bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeTask {
    pub id: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub consus_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ValidateState,
    ValidateModbus,
    #[serde(other)]
    Unknown,
}

/// Inbound config-bus document. Each present key replaces its whole
/// subtree; unknown top-level fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub settings: Option<Settings>,
    #[serde(default)]
    pub tasks: Option<Vec<EdgeTask>>,
    #[serde(default)]
    pub battery_configs: Option<HashMap<String, EdgeBatteryConfig>>,
}

/// A consistent view of the edge state, cheap to take per tick.
#[derive(Clone)]
pub struct EdgeSnapshot {
    pub settings: Arc<Settings>,
    pub battery_configs: Arc<HashMap<String, EdgeBatteryConfig>>,
    pub tasks: Arc<Vec<EdgeTask>>,
}

pub struct EdgeStateStore {
    inner: RwLock<EdgeSnapshot>,
}

impl EdgeStateStore {
    pub fn new(
        settings: Settings,
        battery_configs: HashMap<String, EdgeBatteryConfig>,
        tasks: Vec<EdgeTask>,
    ) -> Self {
        Self {
            inner: RwLock::new(EdgeSnapshot {
                settings: Arc::new(settings),
                battery_configs: Arc::new(battery_configs),
                tasks: Arc::new(tasks),
            }),
        }
    }

    pub fn snapshot(&self) -> EdgeSnapshot {
        self.inner.read().clone()
    }

    /// Validate and apply a whole-document update. On any validation
    /// failure the entire update is rejected and prior state retained.
    pub fn apply_update(&self, update: ConfigUpdate) -> Result<Vec<&'static str>, ConfigError> {
        if let Some(settings) = &update.settings {
            settings.validate()?;
        }
        if let Some(configs) = &update.battery_configs {
            for config in configs.values() {
                config.validate()?;
            }
        }

        let mut applied = Vec::new();
        let mut inner = self.inner.write();
        if let Some(settings) = update.settings {
            inner.settings = Arc::new(settings);
            applied.push("settings");
        }
        if let Some(configs) = update.battery_configs {
            inner.battery_configs = Arc::new(configs);
            applied.push("battery_configs");
        }
        if let Some(tasks) = update.tasks {
            inner.tasks = Arc::new(tasks);
            applied.push("tasks");
        }
        Ok(applied)
    }
}

#[cfg(test)]
pub fn test_settings() -> Settings {
    Settings {
        cheap_window: WallClockWindow {
            start: NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(5, 0, 0).unwrap(),
        },
        timezone: chrono_tz::UTC,
        target_soc_percent: 80.0,
        import_charge_power_w: 3000.0,
        min_import_w: 200.0,
        export_cap_w: 4000.0,
        meter_bias_w: 0.0,
        bias_split: BiasSplitSettings::default(),
        max_charge_w: 5000.0,
        max_ramp_rate_w_per_s: 500.0,
        pv_enabled: true,
        auto_bias_trim: BiasTrimSettings::default(),
        write_guard: WriteGuardSettings::default(),
        endpoints: Endpoints {
            ingest_url: "http://ingest.local".into(),
            health_url: "http://health.local".into(),
            bootstrap_url: "http://bootstrap.local".into(),
        },
        tick_seconds: 1,
        remote_comm_loss_s: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[rstest]
    #[case(hm(23, 0), hm(5, 0), hm(23, 0), true)] // start inclusive
    #[case(hm(23, 0), hm(5, 0), hm(2, 0), true)] // inside, past midnight
    #[case(hm(23, 0), hm(5, 0), hm(5, 0), false)] // end exclusive
    #[case(hm(23, 0), hm(5, 0), hm(13, 0), false)] // daytime
    #[case(hm(23, 0), hm(5, 0), hm(22, 59), false)] // just before start
    #[case(hm(1, 0), hm(6, 0), hm(3, 0), true)] // non-wrapping window
    #[case(hm(1, 0), hm(6, 0), hm(6, 0), false)]
    #[case(hm(1, 0), hm(6, 0), hm(0, 30), false)]
    #[case(hm(4, 0), hm(4, 0), hm(4, 0), false)] // degenerate window is empty
    fn cheap_window_membership(
        #[case] start: NaiveTime,
        #[case] end: NaiveTime,
        #[case] at: NaiveTime,
        #[case] expected: bool,
    ) {
        let window = WallClockWindow { start, end };
        assert_eq!(window.contains(at), expected);
    }

    #[test]
    fn cheap_window_uses_site_local_time() {
        let mut settings = test_settings();
        settings.timezone = chrono_tz::Europe::Amsterdam;
        // 01:30 UTC in winter is 02:30 Amsterdam, inside 23:00-05:00.
        let at = chrono::DateTime::parse_from_rfc3339("2026-01-15T01:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(settings.in_cheap_window(at));
        // 22:30 UTC is 23:30 Amsterdam, inside the window; but 21:30 UTC
        // (22:30 local) is not.
        let late = chrono::DateTime::parse_from_rfc3339("2026-01-15T22:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(settings.in_cheap_window(late));
        let early = chrono::DateTime::parse_from_rfc3339("2026-01-15T21:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!settings.in_cheap_window(early));
    }

    #[test]
    fn hhmm_round_trips() {
        let window = WallClockWindow {
            start: hm(23, 0),
            end: hm(5, 30),
        };
        let json = serde_json::to_string(&window).unwrap();
        assert_eq!(json, r#"{"start":"23:00","end":"05:30"}"#);
        let back: WallClockWindow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, window);
    }

    fn store() -> EdgeStateStore {
        EdgeStateStore::new(test_settings(), HashMap::new(), Vec::new())
    }

    #[test]
    fn settings_update_is_atomic_whole_key_replacement() {
        let store = store();
        let before = store.snapshot();

        let mut next = test_settings();
        next.target_soc_percent = 90.0;
        next.export_cap_w = 1234.0;
        let applied = store
            .apply_update(ConfigUpdate {
                settings: Some(next),
                tasks: None,
                battery_configs: None,
            })
            .unwrap();
        assert_eq!(applied, vec!["settings"]);

        // The pre-update snapshot is untouched; the new snapshot carries the
        // whole replacement.
        assert_eq!(before.settings.target_soc_percent, 80.0);
        let after = store.snapshot();
        assert_eq!(after.settings.target_soc_percent, 90.0);
        assert_eq!(after.settings.export_cap_w, 1234.0);
    }

    #[test]
    fn invalid_update_is_rejected_and_prior_state_retained() {
        let store = store();
        let mut bad = test_settings();
        bad.target_soc_percent = 150.0;
        let err = store.apply_update(ConfigUpdate {
            settings: Some(bad),
            tasks: None,
            battery_configs: None,
        });
        assert!(err.is_err());
        assert_eq!(store.snapshot().settings.target_soc_percent, 80.0);
    }

    #[test]
    fn unknown_top_level_fields_are_ignored() {
        let doc = serde_json::json!({
            "settings": null,
            "battery_configs": {
                "cns-001": {
                    "consus_id": "cns-001",
                    "host": "10.0.0.5",
                    "max_charge_w": 5000.0,
                    "max_ramp_rate_w_per_s": 500.0
                }
            },
            "firmware_hint": {"ignored": true}
        });
        let update: ConfigUpdate = serde_json::from_value(doc).unwrap();
        let store = store();
        let applied = store.apply_update(update).unwrap();
        assert_eq!(applied, vec!["battery_configs"]);
        let snap = store.snapshot();
        let cfg = snap.battery_configs.get("cns-001").unwrap();
        assert_eq!(cfg.port, 502);
        assert_eq!(cfg.unit_id, 1);
        assert!(cfg.pv_enabled);
    }

    #[test]
    fn unknown_task_kinds_deserialize_to_unknown() {
        let doc = serde_json::json!([
            {"id": "t1", "kind": "validate_modbus"},
            {"id": "t2", "kind": "reflash_firmware"}
        ]);
        let tasks: Vec<EdgeTask> = serde_json::from_value(doc).unwrap();
        assert_eq!(tasks[0].kind, TaskKind::ValidateModbus);
        assert_eq!(tasks[1].kind, TaskKind::Unknown);
    }
}
