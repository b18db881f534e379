//! Config-bus subscriber: JSON update documents into the edge state store.
//!
//! The bus transport itself lives outside this crate; it delivers raw
//! payloads into the channel held by [`ConfigBusHandle`]. This module owns
//! the only writer of the store.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{AlertCode, AlertContext, AlertEvent, AlertState};
use crate::error::ConfigError;
use crate::state::{ConfigUpdate, EdgeStateStore};

/// Topic the deployment subscribes to.
pub fn topic(group_id: &str) -> String {
    format!("lanzone/{group_id}/updates")
}

/// Producer side handed to the bus transport.
#[derive(Clone)]
pub struct ConfigBusHandle {
    tx: mpsc::Sender<String>,
}

impl ConfigBusHandle {
    /// Deliver one raw payload from the transport. Backpressure drops the
    /// payload; a subsequent full-document update supersedes it anyway.
    pub fn deliver(&self, payload: String) {
        if self.tx.try_send(payload).is_err() {
            warn!("config bus queue full, dropping update payload");
        }
    }
}

pub struct ConfigBusListener {
    rx: mpsc::Receiver<String>,
    store: Arc<EdgeStateStore>,
    alert_tx: mpsc::Sender<AlertEvent>,
    site_id: String,
}

impl ConfigBusListener {
    pub fn new(
        store: Arc<EdgeStateStore>,
        alert_tx: mpsc::Sender<AlertEvent>,
        site_id: String,
    ) -> (ConfigBusHandle, Self) {
        let (tx, rx) = mpsc::channel(32);
        (
            ConfigBusHandle { tx },
            Self {
                rx,
                store,
                alert_tx,
                site_id,
            },
        )
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                payload = self.rx.recv() => {
                    let Some(payload) = payload else { break };
                    match apply_payload(&self.store, &payload) {
                        Ok(applied) => {
                            info!(keys = ?applied, "config update applied");
                        }
                        Err(err) => {
                            warn!(error = %err, "config update rejected, prior state retained");
                            self.report_rejection(&err).await;
                        }
                    }
                }
            }
        }
        info!("config bus listener stopped");
    }

    async fn report_rejection(&self, err: &ConfigError) {
        let severity = match err {
            // Schema-invalid payloads are protocol errors; a document that
            // parses but fails validation is a configuration error.
            ConfigError::Schema(_) => crate::domain::Severity::Warning,
            _ => AlertCode::ConfigRejected.severity(),
        };
        let event = AlertEvent {
            site_id: self.site_id.clone(),
            consus_id: String::new(),
            ts: Utc::now(),
            severity,
            code: AlertCode::ConfigRejected,
            state: AlertState::Active,
            event_id: Uuid::new_v4(),
            count: 1,
            context: AlertContext::default(),
            recent_telemetry: None,
        };
        if self.alert_tx.send(event).await.is_err() {
            warn!("alert queue closed, config rejection not reported");
        }
    }
}

/// Parse and apply one raw payload. Split out for tests.
pub fn apply_payload(
    store: &EdgeStateStore,
    payload: &str,
) -> Result<Vec<&'static str>, ConfigError> {
    let update: ConfigUpdate = serde_json::from_str(payload)?;
    store.apply_update(update)
}
