//! Register map: the raw/physical boundary.
//!
//! The descriptor document arrives from bootstrap and is immutable for the
//! process lifetime. All scaling and sign extension happens here, so every
//! layer above works in physical units (W, V, A, %, seconds).

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, FieldBusError};

/// Canonical register names used by the controller. The bootstrap document
/// must define each name the configured features touch; a missing name
/// surfaces as `UnknownRegister` at the point of use.
pub mod names {
    pub const GRID_METER_POWER: &str = "grid_meter_power";
    pub const BATTERY_SOC: &str = "battery_soc";
    pub const BATTERY_SOC_BMS: &str = "battery_soc_bms";
    pub const BATTERY_VOLTAGE: &str = "battery_voltage";
    pub const BATTERY_CURRENT: &str = "battery_current";
    pub const BATTERY_POWER: &str = "battery_power";
    pub const PV_STRING_POWER: [&str; 4] = [
        "pv_string_power_1",
        "pv_string_power_2",
        "pv_string_power_3",
        "pv_string_power_4",
    ];
    pub const MPPT_POWER: [&str; 3] = ["mppt_power_1", "mppt_power_2", "mppt_power_3"];
    pub const CT2_POWER: &str = "ct2_power";
    pub const APP_MODE: &str = "app_mode";
    pub const EMS_RUN_MODE: &str = "ems_run_mode";

    pub const EMS_POWER_MODE: &str = "ems_power_mode";
    pub const EMS_POWER_SET: &str = "ems_power_set";
    pub const EXPORT_POWER_CAP: &str = "export_power_cap";
    pub const FEED_POWER_ENABLE: &str = "feed_power_enable";
    pub const EXTERNAL_METER_ENABLE: &str = "external_meter_enable";
    pub const MANUFACTURER_CODE: &str = "manufacturer_code";
    pub const METER_TARGET_BIAS: &str = "meter_target_bias";
    pub const REMOTE_COMM_LOSS_TIME: &str = "remote_comm_loss_time";

    pub const EMS_CHECK_STATUS: &str = "ems_check_status";
    pub const BMS_WARNING_BITS: &str = "bms_warning_bits";
    pub const BMS_ALARM_BITS: &str = "bms_alarm_bits";
    pub const BMS_SOH_PERCENT: &str = "bms_soh_percent";
    pub const ARC_FAULT: &str = "arc_fault";
    pub const PARALLEL_COMM_STATUS: &str = "parallel_comm_status";
    pub const METER_COMM_STATUS: &str = "meter_comm_status";
    pub const METER_CONNECT_STATUS: &str = "meter_connect_status";
    pub const METER_PATH_CHECK: &str = "meter_path_check";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegisterAccess {
    R,
    Rw,
}

/// One register descriptor from the bootstrap map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    pub name: String,
    pub address: u16,
    #[serde(default = "default_words")]
    pub words: u8,
    #[serde(default)]
    pub signed: bool,
    /// Integer divisor: physical = raw / scale.
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub unit: String,
    pub access: RegisterAccess,
}

fn default_words() -> u8 {
    1
}

fn default_scale() -> f64 {
    1.0
}

impl RegisterDescriptor {
    /// Decode raw register words into a physical value.
    pub fn decode(&self, words: &[u16]) -> Result<f64, FieldBusError> {
        if words.len() != self.words as usize {
            return Err(FieldBusError::WordCount {
                register: self.name.clone(),
                got: words.len(),
                want: self.words as usize,
            });
        }
        let raw: i64 = match (self.words, self.signed) {
            (1, false) => i64::from(words[0]),
            (1, true) => i64::from(words[0] as i16),
            (2, false) => {
                let mut buf = [0u8; 4];
                BigEndian::write_u16(&mut buf[0..2], words[0]);
                BigEndian::write_u16(&mut buf[2..4], words[1]);
                i64::from(BigEndian::read_u32(&buf))
            }
            (2, true) => {
                let mut buf = [0u8; 4];
                BigEndian::write_u16(&mut buf[0..2], words[0]);
                BigEndian::write_u16(&mut buf[2..4], words[1]);
                i64::from(BigEndian::read_i32(&buf))
            }
            _ => {
                return Err(FieldBusError::WordCount {
                    register: self.name.clone(),
                    got: words.len(),
                    want: 2,
                })
            }
        };
        Ok(raw as f64 / self.scale)
    }

    /// Encode a physical value into raw register words, range-checked.
    pub fn encode(&self, value: f64) -> Result<Vec<u16>, FieldBusError> {
        if self.access != RegisterAccess::Rw {
            return Err(FieldBusError::NotWritable(self.name.clone()));
        }
        let scaled = (value * self.scale).round();
        if !scaled.is_finite() {
            return Err(FieldBusError::OutOfRange {
                register: self.name.clone(),
                value,
            });
        }
        let (lo, hi) = match (self.words, self.signed) {
            (1, false) => (0.0, f64::from(u16::MAX)),
            (1, true) => (f64::from(i16::MIN), f64::from(i16::MAX)),
            (2, false) => (0.0, f64::from(u32::MAX)),
            (2, true) => (f64::from(i32::MIN), f64::from(i32::MAX)),
            _ => {
                return Err(FieldBusError::OutOfRange {
                    register: self.name.clone(),
                    value,
                })
            }
        };
        if scaled < lo || scaled > hi {
            return Err(FieldBusError::OutOfRange {
                register: self.name.clone(),
                value,
            });
        }
        Ok(match self.words {
            1 => {
                if self.signed {
                    vec![(scaled as i16) as u16]
                } else {
                    vec![scaled as u16]
                }
            }
            _ => {
                let raw = if self.signed {
                    (scaled as i32) as u32
                } else {
                    scaled as u32
                };
                vec![(raw >> 16) as u16, (raw & 0xFFFF) as u16]
            }
        })
    }
}

/// Named lookup table over the bootstrap descriptors.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    by_name: HashMap<String, RegisterDescriptor>,
}

impl RegisterMap {
    pub fn from_descriptors(descriptors: Vec<RegisterDescriptor>) -> Result<Self, ConfigError> {
        if descriptors.is_empty() {
            return Err(ConfigError::EmptyRegisterMap);
        }
        let mut by_name = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if by_name.insert(name.clone(), descriptor).is_some() {
                return Err(ConfigError::DuplicateRegister(name));
            }
        }
        Ok(Self { by_name })
    }

    pub fn get(&self, name: &str) -> Result<&RegisterDescriptor, FieldBusError> {
        self.by_name
            .get(name)
            .ok_or_else(|| FieldBusError::UnknownRegister(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
