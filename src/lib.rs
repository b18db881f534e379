//! Consus edge controller: on-site supervisor for GoodWe inverter/battery
//! installations over Modbus/TCP.

pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod fieldbus;
pub mod poster;
pub mod state;
pub mod telemetry;
