//! Turning pool templates into ASIC jobs.
//!
//! Each pool slot has a [`MiningInfo`] holding the latest template and the
//! extranonce, difficulty and version-mask state that shapes jobs built from
//! it. The orchestrator writes to it as messages arrive; the job ticker reads
//! it through [`JobBuilder::tick`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bitcoin::block::{Header, Version};
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::extranonce2::Extranonce2;
use super::merkle;
use crate::stratum::MiningNotify;
use crate::tracing::prelude::*;
use crate::types::PoolId;

/// Difficulty assumed until the pool sends `mining.set_difficulty`.
pub const DEFAULT_STRATUM_DIFFICULTY: u32 = 8192;

/// A job as handed to the ASIC, and kept for checking its results.
#[derive(Debug, Clone, PartialEq)]
pub struct AsicJob {
    pub job_id: String,
    pub pool_id: PoolId,
    pub extranonce2: Extranonce2,
    pub prev_blockhash: BlockHash,
    pub merkle_root: TxMerkleNode,

    /// Base version from the template.
    pub version: u32,

    /// Bits the ASIC may roll, as granted by the pool.
    pub version_mask: u32,

    pub nbits: u32,
    pub ntime: u32,

    /// Difficulty a share needs to be worth submitting.
    pub pool_diff: u32,

    /// Difficulty the chips report at, clamped to their range.
    pub asic_diff: u32,
}

impl AsicJob {
    /// Owned copy for use outside the job table.
    pub fn snapshot(&self) -> AsicJob {
        self.clone()
    }

    /// Block header for a nonce and a fully rolled version.
    pub fn header(&self, nonce: u32, version: u32) -> Header {
        Header {
            version: Version::from_consensus(version as i32),
            prev_blockhash: self.prev_blockhash,
            merkle_root: self.merkle_root,
            time: self.ntime,
            bits: CompactTarget::from_consensus(self.nbits),
            nonce,
        }
    }
}

/// Work state of one pool.
#[derive(Debug, Clone)]
pub struct MiningInfo {
    template: Option<MiningNotify>,

    extranonce1: Option<String>,
    extranonce2_len: usize,

    /// From `mining.set_extranonce`, promoted by the next notify.
    next_extranonce: Option<(String, usize)>,

    stratum_difficulty: u32,

    /// Difficulty in force when the current template arrived.
    active_difficulty: u32,

    version_mask: u32,

    extranonce2: u64,
    last_ntime: u32,
}

impl Default for MiningInfo {
    fn default() -> Self {
        Self {
            template: None,
            extranonce1: None,
            extranonce2_len: 0,
            next_extranonce: None,
            stratum_difficulty: DEFAULT_STRATUM_DIFFICULTY,
            active_difficulty: DEFAULT_STRATUM_DIFFICULTY,
            version_mask: 0,
            extranonce2: 0,
            last_ntime: 0,
        }
    }
}

impl MiningInfo {
    /// A template with a non-zero ntime is ready to build jobs from.
    pub fn is_valid(&self) -> bool {
        self.template.as_ref().is_some_and(|t| t.ntime != 0)
    }

    pub fn stratum_difficulty(&self) -> u32 {
        self.stratum_difficulty
    }

    pub fn active_difficulty(&self) -> u32 {
        self.active_difficulty
    }

    pub fn version_mask(&self) -> u32 {
        self.version_mask
    }

    pub fn extranonce2_counter(&self) -> u64 {
        self.extranonce2
    }

    /// Returns whether the difficulty changed.
    fn set_difficulty(&mut self, difficulty: u32) -> bool {
        let is_new = self.stratum_difficulty != difficulty;
        self.stratum_difficulty = difficulty;
        is_new
    }

    fn install(&mut self, notify: MiningNotify) {
        if let Some((extranonce1, len)) = self.next_extranonce.take() {
            self.extranonce1 = Some(extranonce1);
            self.extranonce2_len = len;
        }
        self.template = Some(notify);
        self.active_difficulty = self.stratum_difficulty;
    }

    fn invalidate(&mut self) {
        if let Some(template) = self.template.as_mut() {
            template.ntime = 0;
        }
        self.extranonce1 = None;
        self.next_extranonce = None;
        self.extranonce2 = 0;
    }

    fn build(&mut self, pool: PoolId) -> Option<AsicJob> {
        let template = self.template.as_ref().filter(|t| t.ntime != 0)?;
        let extranonce1 = self.extranonce1.as_deref()?;

        if self.last_ntime != template.ntime {
            self.last_ntime = template.ntime;
            info!(pool = %pool, job_id = %template.job_id, "New work received");
        }

        let extranonce1 = match hex::decode(extranonce1) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(pool = %pool, error = %e, "Invalid extranonce1, not building jobs");
                return None;
            }
        };
        let extranonce2 = match Extranonce2::new(self.extranonce2, self.extranonce2_len) {
            Ok(en2) => en2,
            Err(e) => {
                warn!(pool = %pool, error = %e, "Not building jobs");
                return None;
            }
        };

        let coinbase = merkle::coinbase(
            &template.coinbase1,
            &extranonce1,
            &extranonce2,
            &template.coinbase2,
        );
        let merkle_root = merkle::merkle_root(&coinbase, &template.merkle_branches);

        let job = AsicJob {
            job_id: template.job_id.clone(),
            pool_id: pool,
            extranonce2,
            prev_blockhash: template.prev_blockhash,
            merkle_root,
            version: template.version,
            version_mask: self.version_mask,
            nbits: template.nbits,
            ntime: template.ntime,
            pool_diff: self.active_difficulty,
            asic_diff: self.active_difficulty,
        };
        self.extranonce2 = self.extranonce2.wrapping_add(1);
        Some(job)
    }
}

/// Per-pool work state plus the "new work" signal for the ticker.
pub struct JobBuilder {
    pools: Mutex<[MiningInfo; 2]>,
    new_work: Notify,
    job_interval_ms: AtomicU64,
}

impl JobBuilder {
    pub fn new(job_interval: Duration) -> Self {
        Self {
            pools: Mutex::new([MiningInfo::default(), MiningInfo::default()]),
            new_work: Notify::new(),
            job_interval_ms: AtomicU64::new(job_interval.as_millis() as u64),
        }
    }

    pub fn set_version_mask(&self, pool: PoolId, mask: u32) {
        self.pools.lock()[pool.index()].version_mask = mask;
    }

    /// Returns whether the difficulty changed.
    pub fn set_difficulty(&self, pool: PoolId, difficulty: u32) -> bool {
        self.pools.lock()[pool.index()].set_difficulty(difficulty)
    }

    /// Extranonce from the subscribe result, effective at once.
    pub fn set_extranonce(&self, pool: PoolId, extranonce1: &str, extranonce2_len: usize) {
        let mut pools = self.pools.lock();
        let info = &mut pools[pool.index()];
        info.extranonce1 = Some(extranonce1.to_string());
        info.extranonce2_len = extranonce2_len;
    }

    /// Extranonce from `mining.set_extranonce`, effective with the next notify.
    pub fn set_next_extranonce(&self, pool: PoolId, extranonce1: &str, extranonce2_len: usize) {
        self.pools.lock()[pool.index()].next_extranonce =
            Some((extranonce1.to_string(), extranonce2_len));
    }

    /// Install a new template and wake the ticker.
    pub fn install_notify(&self, pool: PoolId, notify: MiningNotify) {
        self.pools.lock()[pool.index()].install(notify);
        self.trigger();
    }

    /// Forget the pool's work after a disconnect.
    pub fn invalidate(&self, pool: PoolId) {
        self.pools.lock()[pool.index()].invalidate();
    }

    /// Restart the pool's extranonce2 sequence once its jobs are gone.
    pub fn reset_extranonce2(&self, pool: PoolId) {
        self.pools.lock()[pool.index()].extranonce2 = 0;
    }

    pub fn is_valid(&self, pool: PoolId) -> bool {
        self.pools.lock()[pool.index()].is_valid()
    }

    pub fn mining_info(&self, pool: PoolId) -> MiningInfo {
        self.pools.lock()[pool.index()].clone()
    }

    /// Build the next job for `pool`, rolling its extranonce2.
    ///
    /// `None` while the pool has no valid template or extranonce. The returned
    /// job's `asic_diff` still equals its pool difficulty; the caller applies
    /// the pool strategy's clamp.
    pub fn tick(&self, pool: PoolId) -> Option<AsicJob> {
        self.pools.lock()[pool.index()].build(pool)
    }

    /// Wake the ticker ahead of its period.
    pub fn trigger(&self) {
        self.new_work.notify_one();
    }

    pub async fn new_work(&self) {
        self.new_work.notified().await;
    }

    pub fn set_job_interval(&self, interval: Duration) {
        self.job_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn job_interval(&self) -> Duration {
        Duration::from_millis(self.job_interval_ms.load(Ordering::Relaxed).max(1))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use bitcoin::hashes::Hash;

    use super::*;

    pub(crate) fn notify(job_id: &str, ntime: u32) -> MiningNotify {
        MiningNotify {
            job_id: job_id.to_string(),
            prev_blockhash: BlockHash::from_byte_array([0x11; 32]),
            coinbase1: hex::decode("01000000010000").unwrap(),
            coinbase2: hex::decode("ffffffff0100f2052a01000000").unwrap(),
            merkle_branches: vec![TxMerkleNode::from_byte_array([0x22; 32])],
            version: 0x2000_0000,
            nbits: 0x1703_a30c,
            ntime,
            clean_jobs: false,
        }
    }

    fn ready_builder() -> JobBuilder {
        let builder = JobBuilder::new(Duration::from_millis(500));
        builder.set_extranonce(PoolId::Primary, "0800007b", 4);
        builder.install_notify(PoolId::Primary, notify("1d", 0x66f1_a2b3));
        builder
    }

    #[test]
    fn no_job_without_template_or_extranonce() {
        let builder = JobBuilder::new(Duration::from_millis(500));
        assert!(builder.tick(PoolId::Primary).is_none());

        builder.install_notify(PoolId::Primary, notify("1", 1));
        assert!(builder.tick(PoolId::Primary).is_none());

        builder.set_extranonce(PoolId::Primary, "00", 2);
        assert!(builder.tick(PoolId::Primary).is_some());
    }

    #[test]
    fn job_carries_template_and_rolls_extranonce2() {
        let builder = ready_builder();
        builder.set_version_mask(PoolId::Primary, 0x1fffe000);

        let first = builder.tick(PoolId::Primary).unwrap();
        let second = builder.tick(PoolId::Primary).unwrap();

        assert_eq!(first.job_id, "1d");
        assert_eq!(first.pool_id, PoolId::Primary);
        assert_eq!(first.version, 0x2000_0000);
        assert_eq!(first.version_mask, 0x1fffe000);
        assert_eq!(first.extranonce2.to_string(), "00000000");
        assert_eq!(second.extranonce2.to_string(), "00000001");
        assert_ne!(first.merkle_root, second.merkle_root);
    }

    #[test]
    fn merkle_root_covers_extranonces() {
        let builder = ready_builder();
        let job = builder.tick(PoolId::Primary).unwrap();

        let template = notify("1d", 0x66f1_a2b3);
        let mut coinbase = template.coinbase1.clone();
        coinbase.extend(hex::decode("0800007b").unwrap());
        coinbase.extend([0, 0, 0, 0]);
        coinbase.extend(&template.coinbase2);
        assert_eq!(
            job.merkle_root,
            merkle::merkle_root(&coinbase, &template.merkle_branches)
        );
    }

    #[test]
    fn difficulty_latches_at_notify() {
        let builder = ready_builder();
        assert_eq!(
            builder.tick(PoolId::Primary).unwrap().pool_diff,
            DEFAULT_STRATUM_DIFFICULTY
        );

        assert!(builder.set_difficulty(PoolId::Primary, 1024));
        assert!(!builder.set_difficulty(PoolId::Primary, 1024));
        // Still the old template
        assert_eq!(
            builder.tick(PoolId::Primary).unwrap().pool_diff,
            DEFAULT_STRATUM_DIFFICULTY
        );

        builder.install_notify(PoolId::Primary, notify("1e", 0x66f1_a2b4));
        assert_eq!(builder.tick(PoolId::Primary).unwrap().pool_diff, 1024);
    }

    #[test]
    fn pending_extranonce_waits_for_notify() {
        let builder = ready_builder();
        builder.set_next_extranonce(PoolId::Primary, "aabb", 2);
        assert_eq!(
            builder.tick(PoolId::Primary).unwrap().extranonce2.size(),
            4
        );

        builder.install_notify(PoolId::Primary, notify("1e", 0x66f1_a2b4));
        let job = builder.tick(PoolId::Primary).unwrap();
        assert_eq!(job.extranonce2.size(), 2);
    }

    #[test]
    fn invalidate_stops_jobs_and_resets_counter() {
        let builder = ready_builder();
        builder.tick(PoolId::Primary).unwrap();
        builder.tick(PoolId::Primary).unwrap();

        builder.invalidate(PoolId::Primary);
        assert!(!builder.is_valid(PoolId::Primary));
        assert!(builder.tick(PoolId::Primary).is_none());
        assert_eq!(builder.mining_info(PoolId::Primary).extranonce2_counter(), 0);

        // A fresh session brings a new extranonce and template
        builder.set_extranonce(PoolId::Primary, "0800007c", 4);
        builder.install_notify(PoolId::Primary, notify("20", 0x66f1_a300));
        assert_eq!(
            builder.tick(PoolId::Primary).unwrap().extranonce2.value(),
            0
        );
    }

    #[test]
    fn counters_are_per_pool() {
        let builder = ready_builder();
        builder.set_extranonce(PoolId::Secondary, "01", 4);
        builder.install_notify(PoolId::Secondary, notify("s1", 5));

        builder.tick(PoolId::Primary).unwrap();
        builder.tick(PoolId::Primary).unwrap();
        let secondary = builder.tick(PoolId::Secondary).unwrap();
        assert_eq!(secondary.extranonce2.value(), 0);
        assert_eq!(secondary.pool_id, PoolId::Secondary);
    }

    #[test]
    fn zero_ntime_template_is_not_valid() {
        let builder = JobBuilder::new(Duration::from_millis(500));
        builder.set_extranonce(PoolId::Primary, "00", 2);
        builder.install_notify(PoolId::Primary, notify("0", 0));
        assert!(!builder.is_valid(PoolId::Primary));
        assert!(builder.tick(PoolId::Primary).is_none());
    }

    #[test]
    fn header_uses_rolled_version() {
        let job = ready_builder().tick(PoolId::Primary).unwrap();
        let header = job.header(0xdead_beef, 0x2000_4000);
        assert_eq!(header.version.to_consensus(), 0x2000_4000);
        assert_eq!(header.nonce, 0xdead_beef);
        assert_eq!(header.time, 0x66f1_a2b3);
        assert_eq!(header.bits.to_consensus(), 0x1703_a30c);
    }
}
