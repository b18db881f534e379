//! Backend poster: telemetry batching and severity-aware alert dispatch.
//!
//! Two queues feed one task. Telemetry batches flush on a timer or a size
//! threshold; CRITICAL alerts are drained immediately with the recent
//! telemetry ring attached, while WARNING/INFO batch on a slower timer.
//! Failed posts are retained in memory up to a cap with oldest-first
//! eviction; there is no disk spool.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{AlertEvent, Severity, TelemetrySample};
use crate::state::Endpoints;

#[derive(Debug, Clone)]
pub struct PosterConfig {
    pub flush_interval: Duration,
    pub alert_batch_interval: Duration,
    pub telemetry_batch_max: usize,
    pub retained_cap: usize,
    pub ring_capacity: usize,
    pub http_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for PosterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            alert_batch_interval: Duration::from_secs(45),
            telemetry_batch_max: 32,
            retained_cap: 512,
            // ~10 s of samples at the default 1 Hz tick.
            ring_capacity: 12,
            http_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

pub struct BackendPoster {
    http: reqwest::Client,
    ingest_url: String,
    health_url: String,
    cfg: PosterConfig,
    sample_rx: mpsc::Receiver<TelemetrySample>,
    alert_rx: mpsc::Receiver<AlertEvent>,
    telemetry: Vec<TelemetrySample>,
    alerts: Vec<AlertEvent>,
    recent: VecDeque<TelemetrySample>,
    evicted: u64,
}

impl BackendPoster {
    pub fn new(
        endpoints: &Endpoints,
        cfg: PosterConfig,
    ) -> anyhow::Result<(
        Self,
        mpsc::Sender<TelemetrySample>,
        mpsc::Sender<AlertEvent>,
    )> {
        let (sample_tx, sample_rx) = mpsc::channel(256);
        let (alert_tx, alert_rx) = mpsc::channel(64);
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout)
            .build()
            .context("failed to build poster HTTP client")?;
        let poster = Self {
            http,
            ingest_url: join_url(&endpoints.ingest_url, "blob/ingest"),
            health_url: join_url(&endpoints.health_url, "blob/health"),
            cfg,
            sample_rx,
            alert_rx,
            telemetry: Vec::new(),
            alerts: Vec::new(),
            recent: VecDeque::new(),
            evicted: 0,
        };
        Ok((poster, sample_tx, alert_tx))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now();
        let mut flush =
            tokio::time::interval_at(start + self.cfg.flush_interval, self.cfg.flush_interval);
        let mut alert_flush = tokio::time::interval_at(
            start + self.cfg.alert_batch_interval,
            self.cfg.alert_batch_interval,
        );
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        alert_flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                sample = self.sample_rx.recv() => {
                    let Some(sample) = sample else { break };
                    self.accept_sample(sample);
                    if self.telemetry.len() >= self.cfg.telemetry_batch_max {
                        self.flush_telemetry().await;
                    }
                }
                event = self.alert_rx.recv() => {
                    let Some(event) = event else { break };
                    self.route_alert(event).await;
                }
                _ = flush.tick() => {
                    if !self.telemetry.is_empty() {
                        self.flush_telemetry().await;
                    }
                }
                _ = alert_flush.tick() => {
                    if !self.alerts.is_empty() {
                        self.flush_alerts().await;
                    }
                }
            }
        }

        let grace = self.cfg.shutdown_grace;
        if tokio::time::timeout(grace, self.drain_and_flush())
            .await
            .is_err()
        {
            warn!("poster shutdown grace elapsed with queues not empty");
        }
    }

    fn accept_sample(&mut self, sample: TelemetrySample) {
        self.recent.push_back(sample.clone());
        while self.recent.len() > self.cfg.ring_capacity {
            self.recent.pop_front();
        }
        self.telemetry.push(sample);
    }

    async fn route_alert(&mut self, mut event: AlertEvent) {
        if event.severity == Severity::Critical {
            event.recent_telemetry = Some(self.recent.iter().cloned().collect());
            let batch = [event];
            if let Err(err) = self.post(&self.health_url, &batch).await {
                warn!(error = %err, "critical alert post failed, retaining");
                let [event] = batch;
                self.alerts.insert(0, event);
                self.enforce_alert_cap();
            }
        } else {
            self.alerts.push(event);
            self.enforce_alert_cap();
        }
    }

    async fn flush_telemetry(&mut self) {
        match self.post(&self.ingest_url, &self.telemetry).await {
            Ok(()) => {
                debug!(count = self.telemetry.len(), "telemetry batch posted");
                self.telemetry.clear();
            }
            Err(err) => {
                warn!(error = %err, retained = self.telemetry.len(), "telemetry post failed");
                while self.telemetry.len() > self.cfg.retained_cap {
                    self.telemetry.remove(0);
                    self.evicted += 1;
                }
                if self.evicted > 0 {
                    warn!(evicted = self.evicted, "retention cap reached, oldest entries evicted");
                }
            }
        }
    }

    async fn flush_alerts(&mut self) {
        match self.post(&self.health_url, &self.alerts).await {
            Ok(()) => {
                debug!(count = self.alerts.len(), "alert batch posted");
                self.alerts.clear();
            }
            Err(err) => {
                warn!(error = %err, retained = self.alerts.len(), "alert post failed");
                self.enforce_alert_cap();
            }
        }
    }

    fn enforce_alert_cap(&mut self) {
        while self.alerts.len() > self.cfg.retained_cap {
            self.alerts.remove(0);
            self.evicted += 1;
        }
    }

    async fn drain_and_flush(&mut self) {
        self.sample_rx.close();
        self.alert_rx.close();
        while let Ok(sample) = self.sample_rx.try_recv() {
            self.accept_sample(sample);
        }
        while let Ok(event) = self.alert_rx.try_recv() {
            self.route_alert(event).await;
        }
        if !self.telemetry.is_empty() {
            self.flush_telemetry().await;
        }
        if !self.alerts.is_empty() {
            self.flush_alerts().await;
        }
        info!("backend poster stopped");
    }

    async fn post<T: Serialize>(&self, url: &str, body: &[T]) -> Result<(), reqwest::Error> {
        self.http
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}
