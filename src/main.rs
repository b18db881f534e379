use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use validator::Validate;

use consus_edge::bootstrap::BootstrapClient;
use consus_edge::bus::{self, ConfigBusListener};
use consus_edge::config::StartupConfig;
use consus_edge::controller::health::{HealthLimits, HealthMonitor};
use consus_edge::controller::ControlLoop;
use consus_edge::domain::FaultSafeIntent;
use consus_edge::fieldbus::driver::FieldBusDriver;
use consus_edge::fieldbus::registers::RegisterMap;
use consus_edge::fieldbus::write_guard::WriteGuard;
use consus_edge::poster::{BackendPoster, PosterConfig};
use consus_edge::state::EdgeStateStore;
use consus_edge::telemetry;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Fatal startup failures, mapped onto the process exit codes.
#[derive(Debug, thiserror::Error)]
enum Fatal {
    #[error("bootstrap failed: {0:#}")]
    Bootstrap(anyhow::Error),
    #[error("configuration invalid: {0:#}")]
    Config(anyhow::Error),
    #[error("field-bus misconfiguration: {0:#}")]
    FieldBus(anyhow::Error),
}

impl Fatal {
    fn exit_code(&self) -> u8 {
        match self {
            Fatal::Bootstrap(_) => 1,
            Fatal::Config(_) => 2,
            Fatal::FieldBus(_) => 3,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let startup = match StartupConfig::load(std::env::args().skip(1)) {
        Ok(startup) => startup,
        Err(err) => {
            eprintln!("invalid startup configuration: {err:#}");
            return ExitCode::from(2);
        }
    };
    telemetry::init_tracing(startup.log_level.as_deref());

    match run(startup).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            error!(error = %fatal, "exiting");
            ExitCode::from(fatal.exit_code())
        }
    }
}

async fn run(startup: StartupConfig) -> Result<(), Fatal> {
    let bootstrap =
        Arc::new(BootstrapClient::new(&startup.bootstrap_url).map_err(Fatal::Bootstrap)?);
    let init = bootstrap.fetch_init().await.map_err(Fatal::Bootstrap)?;

    init.settings
        .validate()
        .map_err(|err| Fatal::Config(err.into()))?;
    for config in init.battery_configs.values() {
        config
            .validate()
            .map_err(|err| Fatal::Config(err.into()))?;
    }

    let registers = Arc::new(
        RegisterMap::from_descriptors(init.register_map)
            .map_err(|err| Fatal::FieldBus(err.into()))?,
    );

    let tick = Duration::from_secs(
        startup
            .tick_seconds
            .unwrap_or(init.settings.tick_seconds)
            .max(1),
    );
    let endpoints = init.settings.endpoints.clone();
    let guard_settings = init.settings.write_guard.clone();
    let battery_configs = init.battery_configs.clone();
    let store = Arc::new(EdgeStateStore::new(
        init.settings,
        init.battery_configs,
        init.tasks,
    ));

    info!(
        site = %startup.group_id,
        topic = %bus::topic(&startup.group_id),
        batteries = battery_configs.len(),
        registers = registers.len(),
        "starting consus edge controller"
    );

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (poster, sample_tx, alert_tx) =
        BackendPoster::new(&endpoints, PosterConfig::default()).map_err(Fatal::Config)?;
    tracker.spawn(poster.run(cancel.child_token()));

    let (bus_handle, listener) = ConfigBusListener::new(
        Arc::clone(&store),
        alert_tx.clone(),
        startup.group_id.clone(),
    );
    tracker.spawn(listener.run(cancel.child_token()));
    // The config-bus transport delivers payloads through this handle for
    // the process lifetime.
    let _bus_handle = bus_handle;

    for (consus_id, config) in &battery_configs {
        // One guard and one session per device for the control path; the
        // health monitor polls read-only on a session of its own.
        let guard = Arc::new(WriteGuard::new(&guard_settings.to_config()));
        let driver = FieldBusDriver::new(
            config.host.clone(),
            config.port,
            config.unit_id,
            Arc::clone(&registers),
            Arc::clone(&guard),
        );
        let health_driver = FieldBusDriver::new(
            config.host.clone(),
            config.port,
            config.unit_id,
            Arc::clone(&registers),
            Arc::new(WriteGuard::new(&guard_settings.to_config())),
        );

        let (intent_tx, intent_rx) = watch::channel(FaultSafeIntent::default());
        let (last_sample_tx, last_sample_rx) = watch::channel(None);

        let monitor = HealthMonitor::new(
            consus_id.clone(),
            startup.group_id.clone(),
            HealthLimits::default(),
            Arc::clone(&store),
            intent_tx,
            alert_tx.clone(),
            last_sample_rx,
        );
        tracker.spawn(monitor.run(health_driver, cancel.child_token()));

        let control = ControlLoop::new(
            startup.group_id.clone(),
            consus_id.clone(),
            driver,
            Arc::clone(&store),
            Some(Arc::clone(&bootstrap)),
            intent_rx,
            sample_tx.clone(),
            alert_tx.clone(),
            last_sample_tx,
            tick,
        );
        tracker.spawn(control.run(cancel.child_token()));
    }
    drop(sample_tx);
    drop(alert_tx);

    telemetry::shutdown_signal().await;
    cancel.cancel();
    tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait())
        .await
        .is_err()
    {
        warn!("shutdown grace elapsed, abandoning remaining tasks");
    }

    warn!("shutdown complete");
    Ok(())
}
