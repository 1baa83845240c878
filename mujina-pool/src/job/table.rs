//! Jobs currently loaded in the ASIC, indexed by the chip's job id.

use parking_lot::Mutex;

use super::builder::AsicJob;
use crate::tracing::prelude::*;
use crate::types::PoolId;

/// Number of job ids the chips cycle through.
pub const CAPACITY: usize = 128;

/// Fixed-size table of in-flight jobs.
///
/// Storing into an occupied slot drops the previous job, so a result for an
/// evicted job finds the new occupant or nothing, never stale data.
pub struct AsicJobTable {
    slots: Mutex<Vec<Option<AsicJob>>>,
}

impl Default for AsicJobTable {
    fn default() -> Self {
        Self::with_capacity(CAPACITY)
    }
}

impl AsicJobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Store a job under the id the ASIC assigned it.
    ///
    /// Returns the evicted job, if any. Ids outside the table are dropped with
    /// a warning.
    pub fn store(&self, asic_job_id: u8, job: AsicJob) -> Option<AsicJob> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(usize::from(asic_job_id)) else {
            warn!(asic_job_id, "ASIC job id outside job table");
            return None;
        };
        slot.replace(job)
    }

    /// Independent copy of the job stored under `asic_job_id`.
    pub fn get_clone(&self, asic_job_id: u8) -> Option<AsicJob> {
        self.slots
            .lock()
            .get(usize::from(asic_job_id))
            .and_then(|slot| slot.as_ref().map(AsicJob::snapshot))
    }

    /// Drop every job of `pool`. Returns how many were dropped.
    pub fn clean_pool(&self, pool: PoolId) -> usize {
        let mut dropped = 0;
        for slot in self.slots.lock().iter_mut() {
            if slot.as_ref().is_some_and(|job| job.pool_id == pool) {
                *slot = None;
                dropped += 1;
            }
        }
        dropped
    }

    /// Drop every job.
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        for slot in self.slots.lock().iter_mut() {
            if slot.take().is_some() {
                dropped += 1;
            }
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::job::builder::JobBuilder;
    use crate::job::builder::tests::notify;

    fn jobs(pool: PoolId, count: usize) -> Vec<AsicJob> {
        let builder = JobBuilder::new(Duration::from_millis(500));
        builder.set_extranonce(pool, "0800007b", 4);
        builder.install_notify(pool, notify("1d", 0x66f1_a2b3));
        (0..count).map(|_| builder.tick(pool).unwrap()).collect()
    }

    #[test]
    fn reused_id_returns_new_job() {
        let table = AsicJobTable::with_capacity(4);
        let jobs = jobs(PoolId::Primary, 5);

        for (id, job) in [0u8, 1, 2, 3].into_iter().zip(&jobs) {
            assert!(table.store(id, job.clone()).is_none());
        }
        let evicted = table.store(0, jobs[4].clone());

        assert_eq!(evicted.as_ref(), Some(&jobs[0]));
        assert_eq!(table.get_clone(0).as_ref(), Some(&jobs[4]));
        assert_eq!(table.get_clone(3).as_ref(), Some(&jobs[3]));
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn clone_is_independent() {
        let table = AsicJobTable::new();
        table.store(7, jobs(PoolId::Primary, 1).remove(0));

        let mut copy = table.get_clone(7).unwrap();
        copy.pool_diff = 1;
        assert_ne!(table.get_clone(7).unwrap().pool_diff, 1);
    }

    #[test]
    fn unknown_and_out_of_range_ids() {
        let table = AsicJobTable::with_capacity(4);
        assert!(table.get_clone(2).is_none());

        assert!(table.store(9, jobs(PoolId::Primary, 1).remove(0)).is_none());
        assert!(table.get_clone(9).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn clean_pool_leaves_other_pool() {
        let table = AsicJobTable::new();
        let primary = jobs(PoolId::Primary, 3);
        let secondary = jobs(PoolId::Secondary, 2);
        for (id, job) in primary.iter().chain(&secondary).enumerate() {
            table.store(id as u8, job.clone());
        }

        assert_eq!(table.clean_pool(PoolId::Primary), 3);
        assert!(table.get_clone(0).is_none());
        assert_eq!(table.get_clone(3).unwrap().pool_id, PoolId::Secondary);

        assert_eq!(table.clear(), 2);
        assert!(table.is_empty());
    }
}
