//! Daemon lifecycle: assembly, task management, signals and shutdown.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::asic::{AsicDriver, DryRunAsic};
use crate::config::{ConfigStore, JsonFileStore};
use crate::history::{HashrateHistory, HistoryConfig, Window};
use crate::job::{AsicJobTable, JobBuilder, JobTicker, ResultProcessor};
use crate::orchestrator::{PoolOrchestrator, watchdog};
use crate::stratum::ConnectionTiming;
use crate::tracing::prelude::*;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mujina/pool.json";

/// Period of the status line in the log.
const REPORT_PERIOD: Duration = Duration::from_secs(60);

/// The main daemon.
pub struct Daemon {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    config_path: PathBuf,
}

impl Daemon {
    /// Create a daemon using the configuration at `MUJINA_CONFIG`, or the
    /// default path.
    pub fn new() -> Self {
        let config_path = env::var_os("MUJINA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            config_path,
        }
    }

    /// Run until SIGINT or SIGTERM, or until the watchdog gives up.
    ///
    /// SIGHUP reloads the configuration.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(config = %self.config_path.display(), "Loading configuration");
        let store: Arc<dyn ConfigStore> =
            Arc::new(JsonFileStore::new(&self.config_path).with_env_overrides());

        let builder = Arc::new(JobBuilder::new(Duration::from_millis(500)));
        let table = Arc::new(AsicJobTable::new());
        let history = Arc::new(HashrateHistory::new(HistoryConfig::default()));

        let (orchestrator, connections) = PoolOrchestrator::new(
            store,
            builder.clone(),
            table.clone(),
            ConnectionTiming::default(),
        )
        .context("failed to load configuration")?;

        for connection in connections {
            self.tracker.spawn(connection.run(self.shutdown.clone()));
        }

        let mut asic = DryRunAsic::new();
        let results = asic
            .take_result_receiver()
            .context("ASIC result stream already taken")?;

        let ticker = JobTicker::new(
            builder,
            table.clone(),
            orchestrator.clone(),
            Box::new(asic),
        );
        self.tracker.spawn(ticker.run(self.shutdown.clone()));

        let processor = ResultProcessor::new(table, orchestrator.clone(), history.clone());
        self.tracker
            .spawn(processor.run(results, self.shutdown.clone()));

        self.tracker.spawn(report(
            orchestrator.clone(),
            history,
            self.shutdown.clone(),
        ));

        let mut watchdog = self.tracker.spawn(watchdog::run(
            orchestrator.clone(),
            watchdog::CHECK_PERIOD,
            watchdog::SILENCE_LIMIT,
            self.shutdown.clone(),
        ));

        self.tracker.close();
        orchestrator.start();

        info!("Started.");
        info!("For debugging, set RUST_LOG=mujina_pool=debug or trace.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sighup = unix::signal(SignalKind::hangup())?;

        let outcome = loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT.");
                    break Ok(());
                },
                _ = sigterm.recv() => {
                    info!("Received SIGTERM.");
                    break Ok(());
                },
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading configuration.");
                    if let Err(e) = orchestrator.load_settings() {
                        error!(error = %e, "Failed to reload configuration");
                    }
                },
                result = &mut watchdog => {
                    break match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e).context("pool watchdog expired"),
                        Err(e) => Err(e).context("watchdog task failed"),
                    };
                },
            }
        };

        self.shutdown.cancel();
        self.tracker.wait().await;
        info!("Exiting.");

        outcome
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

/// Log a one-line summary of pools and hashrate every [`REPORT_PERIOD`].
async fn report(
    orchestrator: Arc<PoolOrchestrator>,
    history: Arc<HashrateHistory>,
    shutdown: CancellationToken,
) {
    let mut interval = time::interval_at(Instant::now() + REPORT_PERIOD, REPORT_PERIOD);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let status = orchestrator.status();
                let rates = Window::ALL.map(|w| format!("{}={:.1}", w, history.hashrate_gh(w)));
                let (accepted, rejected) = status
                    .pools
                    .iter()
                    .fold((0, 0), |(a, r), p| (a + p.accepted, r + p.rejected));
                info!(
                    hashrate_gh = %rates.join(" "),
                    connected = status.connected_count,
                    fallback = status.using_fallback,
                    accepted,
                    rejected,
                    best = status.total_best_diff,
                    "Status"
                );
            }
        }
    }
}
