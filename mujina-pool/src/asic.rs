//! The ASIC as seen by the job pipeline.
//!
//! Chip drivers (serial framing, register programming) live outside this
//! crate. The pipeline only needs to hand jobs to the chips, set the reporting
//! difficulty, and receive nonces back.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::job::{AsicJob, Extranonce2, table};
use crate::tracing::prelude::*;

/// A nonce reported by a chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsicResult {
    /// Id the driver returned from [`AsicDriver::send_work`].
    pub asic_job_id: u8,

    pub nonce: u32,

    /// Version bits the chip rolled, without the job's base version.
    pub rolled_version: u32,
}

#[async_trait]
pub trait AsicDriver: Send {
    /// Load a job into the chips. Returns the small id results will carry.
    async fn send_work(&mut self, extranonce2: &Extranonce2, job: &AsicJob) -> Result<u8>;

    /// Set the difficulty at which the chips report nonces.
    async fn set_difficulty_mask(&mut self, difficulty: u32) -> Result<()>;

    /// Take the result stream. Called once by the owner of the pipeline.
    fn take_result_receiver(&mut self) -> Option<mpsc::Receiver<AsicResult>>;
}

/// Driver that accepts work without hashing it.
///
/// Job ids cycle through the job table like a real chip's would. Results can
/// be injected through [`DryRunAsic::result_sender`].
pub struct DryRunAsic {
    next_id: u8,
    difficulty: u32,
    jobs_sent: u64,
    results_tx: mpsc::Sender<AsicResult>,
    results_rx: Option<mpsc::Receiver<AsicResult>>,
}

impl Default for DryRunAsic {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunAsic {
    pub fn new() -> Self {
        let (results_tx, results_rx) = mpsc::channel(64);
        Self {
            next_id: 0,
            difficulty: 0,
            jobs_sent: 0,
            results_tx,
            results_rx: Some(results_rx),
        }
    }

    pub fn result_sender(&self) -> mpsc::Sender<AsicResult> {
        self.results_tx.clone()
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn jobs_sent(&self) -> u64 {
        self.jobs_sent
    }
}

#[async_trait]
impl AsicDriver for DryRunAsic {
    async fn send_work(&mut self, extranonce2: &Extranonce2, job: &AsicJob) -> Result<u8> {
        let id = self.next_id;
        self.next_id = ((usize::from(id) + 1) % table::CAPACITY) as u8;
        self.jobs_sent += 1;
        trace!(
            asic_job_id = id,
            job_id = %job.job_id,
            pool = %job.pool_id,
            extranonce2 = %extranonce2,
            "Dry-run job"
        );
        Ok(id)
    }

    async fn set_difficulty_mask(&mut self, difficulty: u32) -> Result<()> {
        if self.difficulty != difficulty {
            debug!(difficulty, "Dry-run ASIC difficulty");
        }
        self.difficulty = difficulty;
        Ok(())
    }

    fn take_result_receiver(&mut self) -> Option<mpsc::Receiver<AsicResult>> {
        self.results_rx.take()
    }
}
