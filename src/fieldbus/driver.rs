//! Modbus/TCP driver: connection lifecycle and typed read/write by name.
//!
//! One driver owns one TCP session to one device; it is never shared across
//! tasks. On transport failure the session is dropped and the next
//! operation reconnects after a short fixed backoff.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;
use tracing::{debug, warn};

use crate::error::FieldBusError;
use crate::fieldbus::registers::RegisterMap;
use crate::fieldbus::write_guard::{WriteDecision, WriteGuard, WriteGuardConfig};
use crate::fieldbus::{RegisterBus, WriteOutcome};

const OP_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);

pub struct FieldBusDriver {
    host: String,
    port: u16,
    unit_id: u8,
    registers: Arc<RegisterMap>,
    guard: Arc<WriteGuard>,
    guard_cfg: WriteGuardConfig,
    ctx: Option<tokio_modbus::client::Context>,
    reconnect_after_failure: bool,
}

impl FieldBusDriver {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        unit_id: u8,
        registers: Arc<RegisterMap>,
        guard: Arc<WriteGuard>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            registers,
            guard,
            guard_cfg: WriteGuardConfig::default(),
            ctx: None,
            reconnect_after_failure: false,
        }
    }

    pub fn guard(&self) -> &Arc<WriteGuard> {
        &self.guard
    }

    pub async fn connect(&mut self) -> Result<(), FieldBusError> {
        let addr = Self::resolve(&self.host, self.port).await?;
        let mut ctx = timeout(OP_TIMEOUT, tcp::connect(addr))
            .await
            .map_err(|_| FieldBusError::Timeout(OP_TIMEOUT))??;
        ctx.set_slave(Slave(self.unit_id));
        debug!(host = %self.host, port = self.port, unit_id = self.unit_id, "field bus connected");
        self.ctx = Some(ctx);
        self.reconnect_after_failure = false;
        Ok(())
    }

    /// Drop the session. The socket is released unconditionally; the next
    /// operation reconnects.
    pub fn close(&mut self) {
        self.ctx = None;
    }

    async fn resolve(host: &str, port: u16) -> Result<SocketAddr, FieldBusError> {
        let mut addrs = tokio::net::lookup_host((host, port)).await?;
        addrs.next().ok_or_else(|| {
            FieldBusError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {host}:{port}"),
            ))
        })
    }

    async fn ensure_connected(&mut self) -> Result<(), FieldBusError> {
        if self.ctx.is_some() {
            return Ok(());
        }
        if self.reconnect_after_failure {
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
        self.connect().await
    }

    fn fail_transport(&mut self, err: FieldBusError) -> FieldBusError {
        if err.is_transport() {
            warn!(host = %self.host, error = %err, "field bus transport failure, dropping session");
            self.ctx = None;
            self.reconnect_after_failure = true;
        }
        err
    }

    async fn read_words(&mut self, address: u16, count: u16) -> Result<Vec<u16>, FieldBusError> {
        self.ensure_connected().await?;
        let ctx = self.ctx.as_mut().ok_or(FieldBusError::NotConnected)?;
        let result = timeout(OP_TIMEOUT, ctx.read_holding_registers(address, count)).await;
        match result {
            Err(_) => Err(self.fail_transport(FieldBusError::Timeout(OP_TIMEOUT))),
            Ok(Err(err)) => Err(self.fail_transport(classify(err))),
            Ok(Ok(words)) => Ok(words),
        }
    }

    async fn write_words(&mut self, address: u16, words: &[u16]) -> Result<(), FieldBusError> {
        self.ensure_connected().await?;
        let ctx = self.ctx.as_mut().ok_or(FieldBusError::NotConnected)?;
        let result = if words.len() == 1 {
            timeout(OP_TIMEOUT, ctx.write_single_register(address, words[0])).await
        } else {
            timeout(OP_TIMEOUT, ctx.write_multiple_registers(address, words)).await
        };
        match result {
            Err(_) => Err(self.fail_transport(FieldBusError::Timeout(OP_TIMEOUT))),
            Ok(Err(err)) => Err(self.fail_transport(classify(err))),
            Ok(Ok(())) => Ok(()),
        }
    }
}

/// tokio-modbus surfaces device exception responses as `InvalidData` I/O
/// errors; everything else is transport.
fn classify(err: std::io::Error) -> FieldBusError {
    if err.kind() == std::io::ErrorKind::InvalidData {
        FieldBusError::Exception(err.to_string())
    } else {
        FieldBusError::Transport(err)
    }
}

#[async_trait]
impl RegisterBus for FieldBusDriver {
    fn set_guard_config(&mut self, cfg: WriteGuardConfig) {
        self.guard_cfg = cfg;
    }

    fn write_counters(&self) -> crate::domain::WriteCounterSnapshot {
        self.guard.counters()
    }

    async fn read(&mut self, name: &str) -> Result<f64, FieldBusError> {
        let descriptor = self.registers.get(name)?.clone();
        let words = self
            .read_words(descriptor.address, descriptor.words as u16)
            .await?;
        descriptor.decode(&words)
    }

    async fn write(&mut self, name: &str, value: f64) -> Result<WriteOutcome, FieldBusError> {
        let descriptor = self.registers.get(name)?.clone();
        let words = descriptor.encode(value)?;

        let decision = self
            .guard
            .admit(descriptor.address, &words, &self.guard_cfg, Instant::now());
        match decision {
            WriteDecision::Drop(cause) => {
                debug!(register = name, value, cause = cause.as_str(), "write dropped");
                Ok(WriteOutcome::Dropped(cause))
            }
            WriteDecision::Accept => match self.write_words(descriptor.address, &words).await {
                Ok(()) => {
                    self.guard.record_ok();
                    debug!(register = name, value, "write applied");
                    Ok(WriteOutcome::Applied)
                }
                Err(err) => {
                    self.guard.record_error(descriptor.address);
                    Err(err)
                }
            },
        }
    }
}
