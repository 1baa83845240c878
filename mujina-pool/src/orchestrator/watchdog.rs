//! Submit-response watchdog.
//!
//! A pool that keeps the socket open but stops answering shares is not caught
//! by any read timeout. If neither pool has answered a submission for too
//! long, the watchdog gives up and the daemon exits so the supervisor can
//! restart the miner.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::PoolOrchestrator;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

pub const CHECK_PERIOD: Duration = Duration::from_secs(30);
pub const SILENCE_LIMIT: Duration = Duration::from_secs(3600);

/// Check every `period` until cancelled. Returns an error once the pools have
/// been silent for longer than `limit`.
pub async fn run(
    orchestrator: Arc<PoolOrchestrator>,
    period: Duration,
    limit: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = interval.tick() => {
                let silent_for = orchestrator.silent_for();
                trace!(silent_for_s = silent_for.as_secs(), "Watchdog check");
                if silent_for > limit {
                    error!(
                        silent_for_s = silent_for.as_secs(),
                        "No share response from any pool, giving up"
                    );
                    return Err(Error::Watchdog { silent_for });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::MemoryStore;
    use crate::job::{AsicJobTable, JobBuilder};
    use crate::stratum::{ConnectionTiming, StratumMessage};
    use crate::types::PoolId;

    use super::*;

    fn orchestrator() -> Arc<PoolOrchestrator> {
        let (orchestrator, _connections) = PoolOrchestrator::new(
            Arc::new(MemoryStore::default()),
            Arc::new(JobBuilder::new(Duration::from_millis(500))),
            Arc::new(AsicJobTable::new()),
            ConnectionTiming::default(),
        )
        .unwrap();
        orchestrator
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_an_hour_of_silence() {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(
            orchestrator(),
            CHECK_PERIOD,
            SILENCE_LIMIT,
            shutdown.clone(),
        ));

        time::advance(SILENCE_LIMIT - CHECK_PERIOD).await;
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        time::advance(2 * CHECK_PERIOD).await;
        let result = task.await.unwrap();
        match result {
            Err(Error::Watchdog { silent_for }) => assert!(silent_for > SILENCE_LIMIT),
            other => panic!("expected watchdog error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn share_responses_keep_it_quiet() {
        let orchestrator = orchestrator();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(
            orchestrator.clone(),
            CHECK_PERIOD,
            SILENCE_LIMIT,
            shutdown.clone(),
        ));

        for id in 5..10 {
            time::advance(Duration::from_secs(1800)).await;
            orchestrator.dispatch(
                PoolId::Primary,
                StratumMessage::GenericResult { id, success: true },
            );
        }
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        shutdown.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
