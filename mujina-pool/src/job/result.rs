//! Checking nonces reported by the ASIC.
//!
//! For each result: look the job up, rebuild the header with the rolled
//! version, hash it, and decide what the share is worth. Shares above the pool
//! difficulty go to the pool, shares above the chip difficulty count toward
//! the local hashrate, and every share is checked against the best-ever and
//! network difficulty.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::table::AsicJobTable;
use crate::asic::AsicResult;
use crate::history::HashrateHistory;
use crate::stratum::SubmitParams;
use crate::tracing::prelude::*;
use crate::types::{Difficulty, PoolId};

/// Recent (nonce, version) pairs remembered for duplicate detection.
pub const DUPLICATE_RING_SIZE: usize = 32;

/// Consumer of checked shares, implemented by the orchestrator.
pub trait ShareSink: Send + Sync {
    fn submit_share(&self, pool: PoolId, share: SubmitParams);

    /// Every checked nonce, for best-difficulty and found-block tracking.
    fn check_nonce(&self, pool: PoolId, difficulty: Difficulty, nbits: u32);

    fn count_duplicate(&self);
}

/// What happened to one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    UnknownJob,
    Checked {
        submitted: bool,
        credited: bool,
        duplicate: bool,
    },
}

/// Fixed-size ring of recently seen keys.
#[derive(Debug)]
struct SeenRing {
    keys: VecDeque<u64>,
    capacity: usize,
}

impl SeenRing {
    fn new(capacity: usize) -> Self {
        Self {
            keys: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false if the key was already present.
    fn insert_if_absent(&mut self, key: u64) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.keys.len() == self.capacity {
            self.keys.pop_front();
        }
        self.keys.push_back(key);
        true
    }
}

fn duplicate_key(nonce: u32, version: u32) -> u64 {
    (u64::from(nonce) << 32) | u64::from(version)
}

pub struct ResultProcessor {
    table: Arc<AsicJobTable>,
    sink: Arc<dyn ShareSink>,
    history: Arc<HashrateHistory>,
    seen: SeenRing,
    started: Instant,
}

impl ResultProcessor {
    pub fn new(
        table: Arc<AsicJobTable>,
        sink: Arc<dyn ShareSink>,
        history: Arc<HashrateHistory>,
    ) -> Self {
        Self {
            table,
            sink,
            history,
            seen: SeenRing::new(DUPLICATE_RING_SIZE),
            started: Instant::now(),
        }
    }

    pub async fn run(mut self, mut results: mpsc::Receiver<AsicResult>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = results.recv() => match result {
                    Some(result) => {
                        self.process(result);
                    }
                    None => {
                        debug!("ASIC result stream closed");
                        break;
                    }
                },
            }
        }
    }

    pub fn process(&mut self, result: AsicResult) -> Verdict {
        let Some(job) = self.table.get_clone(result.asic_job_id) else {
            info!(asic_job_id = format!("{:02x}", result.asic_job_id), "Invalid job id");
            return Verdict::UnknownJob;
        };

        let version = result.rolled_version | job.version;
        let hash = job.header(result.nonce, version).block_hash();
        let nonce_diff = Difficulty::from_hash(&hash);

        info!(
            pool = %job.pool_id,
            asic_job_id = format!("{:02x}", result.asic_job_id),
            version = format!("{version:08x}"),
            nonce = format!("{:08x}", result.nonce),
            extranonce2 = %job.extranonce2,
            difficulty = %nonce_diff,
            pool_diff = job.pool_diff,
            "Nonce"
        );

        let duplicate = !self
            .seen
            .insert_if_absent(duplicate_key(result.nonce, version));
        if duplicate {
            warn!(pool = %job.pool_id, "Duplicate share");
            self.sink.count_duplicate();
        }

        // Duplicates still go out; the pool rejects them and they count as such
        let submitted = nonce_diff.as_f64() > f64::from(job.pool_diff);
        if submitted {
            self.sink.submit_share(
                job.pool_id,
                SubmitParams {
                    job_id: job.job_id.clone(),
                    extranonce2: job.extranonce2.to_string(),
                    ntime: job.ntime,
                    nonce: result.nonce,
                    version_bits: version ^ job.version,
                },
            );
        }

        let credited = nonce_diff.as_f64() > f64::from(job.asic_diff) && !duplicate;
        if credited {
            let now_ms = self.started.elapsed().as_millis() as u64;
            self.history.push_share(job.asic_diff, now_ms);
        }

        self.sink.check_nonce(job.pool_id, nonce_diff, job.nbits);

        Verdict::Checked {
            submitted,
            credited,
            duplicate,
        }
    }
}
