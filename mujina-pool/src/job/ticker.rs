//! The job ticker task.
//!
//! Wakes on a fixed period or when a new template arrives, picks the pool to
//! mine for, builds a job and loads it into the ASIC.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::builder::JobBuilder;
use super::table::AsicJobTable;
use crate::asic::AsicDriver;
use crate::tracing::prelude::*;
use crate::types::PoolId;

/// Pool selection as needed by the ticker.
pub trait WorkSource: Send + Sync {
    /// Pool whose template the next job is built from.
    fn next_active_pool(&self) -> PoolId;

    /// Difficulty the chips should report at for a job of `pool`.
    fn select_asic_diff(&self, pool: PoolId, pool_diff: u32) -> u32;
}

pub struct JobTicker {
    builder: Arc<JobBuilder>,
    table: Arc<AsicJobTable>,
    source: Arc<dyn WorkSource>,
    asic: Box<dyn AsicDriver>,
}

fn interval(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl JobTicker {
    pub fn new(
        builder: Arc<JobBuilder>,
        table: Arc<AsicJobTable>,
        source: Arc<dyn WorkSource>,
        asic: Box<dyn AsicDriver>,
    ) -> Self {
        Self {
            builder,
            table,
            source,
            asic,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut period = self.builder.job_interval();
        let mut timer = interval(period);
        let mut last_sent: Option<Instant> = None;
        info!(interval_ms = period.as_millis() as u64, "Job ticker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
                _ = self.builder.new_work() => {}
            }

            let current = self.builder.job_interval();
            if current != period {
                info!(interval_ms = current.as_millis() as u64, "Job interval changed");
                period = current;
                timer = interval(period);
                continue;
            }

            let pool = self.source.next_active_pool();
            let Some(mut job) = self.builder.tick(pool) else {
                continue;
            };
            job.asic_diff = self.source.select_asic_diff(pool, job.pool_diff);

            if let Err(e) = self.asic.set_difficulty_mask(job.asic_diff).await {
                error!(error = %e, "Failed to set ASIC difficulty");
                continue;
            }

            let now = Instant::now();
            if let Some(last) = last_sent {
                trace!(pool = %pool, since_ms = (now - last).as_millis() as u64, "Job interval");
            }
            last_sent = Some(now);

            match self.asic.send_work(&job.extranonce2, &job).await {
                Ok(asic_job_id) => {
                    debug!(pool = %pool, asic_job_id, job_id = %job.job_id, "Sent job");
                    self.table.store(asic_job_id, job);
                }
                Err(e) => error!(pool = %pool, error = %e, "Failed to send work"),
            }
        }

        debug!("Job ticker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::asic::AsicResult;
    use crate::error::Result;
    use crate::job::builder::AsicJob;
    use crate::job::builder::tests::notify;
    use crate::job::extranonce2::Extranonce2;

    struct FixedSource {
        pool: PoolId,
        calls: AtomicUsize,
    }

    impl WorkSource for FixedSource {
        fn next_active_pool(&self) -> PoolId {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.pool
        }

        fn select_asic_diff(&self, _pool: PoolId, pool_diff: u32) -> u32 {
            pool_diff.clamp(256, 2048)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingAsic {
        sent: Arc<Mutex<Vec<(String, u32)>>>,
        masks: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl crate::asic::AsicDriver for RecordingAsic {
        async fn send_work(&mut self, extranonce2: &Extranonce2, job: &AsicJob) -> Result<u8> {
            let mut sent = self.sent.lock();
            sent.push((extranonce2.to_string(), job.asic_diff));
            Ok((sent.len() - 1) as u8)
        }

        async fn set_difficulty_mask(&mut self, difficulty: u32) -> Result<()> {
            self.masks.lock().push(difficulty);
            Ok(())
        }

        fn take_result_receiver(&mut self) -> Option<mpsc::Receiver<AsicResult>> {
            None
        }
    }

    struct Harness {
        builder: Arc<JobBuilder>,
        table: Arc<AsicJobTable>,
        source: Arc<FixedSource>,
        asic: RecordingAsic,
        shutdown: CancellationToken,
    }

    fn spawn(interval_ms: u64) -> Harness {
        let builder = Arc::new(JobBuilder::new(Duration::from_millis(interval_ms)));
        let table = Arc::new(AsicJobTable::new());
        let source = Arc::new(FixedSource {
            pool: PoolId::Primary,
            calls: AtomicUsize::new(0),
        });
        let asic = RecordingAsic::default();
        let shutdown = CancellationToken::new();

        let ticker = JobTicker::new(
            builder.clone(),
            table.clone(),
            source.clone(),
            Box::new(asic.clone()),
        );
        tokio::spawn(ticker.run(shutdown.clone()));

        Harness {
            builder,
            table,
            source,
            asic,
            shutdown,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_until_template_arrives() {
        let h = spawn(500);
        time::sleep(Duration::from_secs(3)).await;

        // Woke on every period but had nothing to build
        assert!(h.source.calls.load(Ordering::Relaxed) >= 5);
        assert!(h.asic.sent.lock().is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn notify_wakes_ticker_then_period_continues() {
        let h = spawn(500);
        time::sleep(Duration::from_millis(10)).await;

        h.builder.set_extranonce(PoolId::Primary, "0800007b", 4);
        h.builder.install_notify(PoolId::Primary, notify("1d", 0x66f1_a2b3));
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.asic.sent.lock().len(), 1);

        time::sleep(Duration::from_millis(1000)).await;
        let sent = h.asic.sent.lock().clone();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].0, "00000000");
        assert_eq!(sent[2].0, "00000002");
        // 8192 clamped to the chip range
        assert!(sent.iter().all(|(_, diff)| *diff == 2048));
        assert_eq!(*h.asic.masks.lock(), vec![2048; 3]);

        let stored = h.table.get_clone(2).unwrap();
        assert_eq!(stored.extranonce2.to_string(), "00000002");
        assert_eq!(stored.pool_diff, 8192);
        assert_eq!(stored.asic_diff, 2048);
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn interval_change_rearms_timer() {
        let h = spawn(1000);
        h.builder.set_extranonce(PoolId::Primary, "00", 2);
        h.builder.install_notify(PoolId::Primary, notify("1", 1));
        time::sleep(Duration::from_millis(10)).await;
        let after_notify = h.asic.sent.lock().len();

        h.builder.set_job_interval(Duration::from_millis(100));
        // The first wake only re-arms
        time::sleep(Duration::from_millis(1000)).await;
        let at_rearm = h.asic.sent.lock().len();

        time::sleep(Duration::from_millis(1000)).await;
        let sent = h.asic.sent.lock().len() - at_rearm;
        assert_eq!(after_notify, 1);
        assert!((9..=10).contains(&sent), "sent {sent} jobs");
        h.shutdown.cancel();
    }
}
