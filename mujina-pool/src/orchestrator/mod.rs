//! Pool orchestration.
//!
//! The [`PoolOrchestrator`] owns the two pool slots. It receives everything
//! the connections hear, turns it into job-pipeline mutations, and decides
//! through its [`Strategy`] which pool is connected and which one the next job
//! is built for.
//!
//! Lock order: the orchestrator lock may be held while calling into the job
//! builder, the job table, and connection handles. None of those call back
//! into the orchestrator. Configuration write-back happens after the lock is
//! released.

mod status;
pub mod strategy;
pub mod watchdog;

pub use status::{ManagerInfo, PoolInfo};
pub use strategy::{PoolCommand, Strategy};

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bitcoin::pow::CompactTarget;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::{ConfigStore, MinerConfig};
use crate::error::Result;
use crate::job::{AsicJobTable, JobBuilder, ShareSink, WorkSource};
use crate::stratum::messages::FIRST_SUBMIT_ID;
use crate::stratum::{
    ConnectionHandle, ConnectionObserver, ConnectionTiming, PoolConnection, SessionConfig,
    StratumMessage, SubmitParams,
};
use crate::tracing::prelude::*;
use crate::types::{Difficulty, PoolId};

/// Session state of one pool slot.
#[derive(Debug, Clone)]
struct PoolState {
    /// The pool's current template has a real ntime.
    valid_notify: bool,

    /// No notify received since the session started.
    first_job: bool,
}

impl Default for PoolState {
    fn default() -> Self {
        Self {
            valid_notify: false,
            first_job: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ShareStats {
    accepted: u64,
    rejected: u64,
    best_diff: f64,
}

struct State {
    config: MinerConfig,
    strategy: Strategy,
    pools: [PoolState; 2],
    shares: [ShareStats; 2],
    total_best_diff: u64,
    found_blocks: u64,
    total_found_blocks: u64,
    duplicates: u64,
    last_submit_response: Option<Instant>,
}

impl State {
    /// Share statistics slot of a pool. Failover keeps one set for both.
    fn shares_slot(&self, pool: PoolId) -> usize {
        match self.strategy {
            Strategy::Failover(_) => 0,
            Strategy::DualPool(_) => pool.index(),
        }
    }

    fn valid(&self) -> [bool; 2] {
        [self.pools[0].valid_notify, self.pools[1].valid_notify]
    }
}

pub struct PoolOrchestrator {
    store: Arc<dyn ConfigStore>,
    builder: Arc<JobBuilder>,
    table: Arc<AsicJobTable>,
    connections: [ConnectionHandle; 2],
    started: Instant,
    state: Mutex<State>,
}

/// Forwards connection events to the orchestrator without keeping it alive.
#[derive(Default)]
struct ObserverLink {
    target: OnceLock<Weak<PoolOrchestrator>>,
}

impl ObserverLink {
    fn get(&self) -> Option<Arc<PoolOrchestrator>> {
        self.target.get().and_then(Weak::upgrade)
    }
}

impl ConnectionObserver for ObserverLink {
    fn session_config(&self, pool: PoolId) -> SessionConfig {
        self.get()
            .map(|o| o.session_config(pool))
            .unwrap_or_default()
    }

    fn connected(&self, pool: PoolId) {
        if let Some(o) = self.get() {
            o.connected(pool);
        }
    }

    fn disconnected(&self, pool: PoolId) {
        if let Some(o) = self.get() {
            o.disconnected(pool);
        }
    }

    fn dispatch(&self, pool: PoolId, message: StratumMessage) {
        if let Some(o) = self.get() {
            o.dispatch(pool, message);
        }
    }

    fn reconnect_timer_fired(&self, pool: PoolId) {
        if let Some(o) = self.get() {
            o.reconnect_timer_fired(pool);
        }
    }
}

impl PoolOrchestrator {
    /// Load the configuration and create both pool slots.
    ///
    /// The returned connections must be run by the caller; nothing connects
    /// until [`PoolOrchestrator::start`].
    pub fn new(
        store: Arc<dyn ConfigStore>,
        builder: Arc<JobBuilder>,
        table: Arc<AsicJobTable>,
        timing: ConnectionTiming,
    ) -> Result<(Arc<Self>, [PoolConnection; 2])> {
        let config = store.load()?;
        let strategy = Strategy::new(config.pool_mode, config.primary_percentage());
        builder.set_job_interval(Duration::from_millis(config.asic.job_interval_ms));

        let link = Arc::new(ObserverLink::default());
        let (primary, primary_handle) = PoolConnection::new(PoolId::Primary, link.clone(), timing);
        let (secondary, secondary_handle) =
            PoolConnection::new(PoolId::Secondary, link.clone(), timing);

        let orchestrator = Arc::new(Self {
            store,
            builder,
            table,
            connections: [primary_handle, secondary_handle],
            started: Instant::now(),
            state: Mutex::new(State {
                total_best_diff: config.best_diff,
                total_found_blocks: config.total_found_blocks,
                config,
                strategy,
                pools: Default::default(),
                shares: Default::default(),
                found_blocks: 0,
                duplicates: 0,
                last_submit_response: None,
            }),
        });
        // Freshly created, so the cell is empty
        let _ = link.target.set(Arc::downgrade(&orchestrator));

        Ok((orchestrator, [primary, secondary]))
    }

    /// Open the connections the strategy starts with.
    pub fn start(&self) {
        let commands = {
            let state = self.state.lock();
            info!(
                mode = %state.strategy.mode(),
                primary = %state.config.pool.url(),
                fallback = %state.config.fallback_pool.url(),
                "Starting pool orchestrator"
            );
            state.strategy.startup()
        };
        self.apply(&commands);
    }

    pub fn connection(&self, pool: PoolId) -> &ConnectionHandle {
        &self.connections[pool.index()]
    }

    fn connected_pools(&self) -> [bool; 2] {
        [
            self.connections[0].is_connected(),
            self.connections[1].is_connected(),
        ]
    }

    fn apply(&self, commands: &[PoolCommand]) {
        for command in commands {
            trace!(?command, "Pool command");
            match *command {
                PoolCommand::Connect(pool) => self.connection(pool).connect(),
                PoolCommand::Disconnect(pool) => self.connection(pool).disconnect(),
                PoolCommand::StartReconnectTimer(pool) => {
                    self.connection(pool).start_reconnect_timer()
                }
                PoolCommand::StopReconnectTimer(pool) => {
                    self.connection(pool).stop_reconnect_timer()
                }
            }
        }
    }

    /// Re-read the configuration and apply what can change at runtime.
    ///
    /// Pools whose endpoint changed are reconnected. A changed pool mode is
    /// only applied on restart.
    pub fn load_settings(&self) -> Result<()> {
        let config = self.store.load()?;

        let changed: Vec<PoolId> = {
            let mut state = self.state.lock();
            let changed = PoolId::ALL
                .into_iter()
                .filter(|&pool| state.config.endpoint(pool) != config.endpoint(pool))
                .collect();

            state.total_best_diff = config.best_diff;
            state.total_found_blocks = config.total_found_blocks;
            state.strategy.set_primary_percentage(config.primary_percentage());
            if config.pool_mode != state.strategy.mode() {
                warn!(
                    running = %state.strategy.mode(),
                    configured = %config.pool_mode,
                    "Pool mode change takes effect after restart"
                );
            }

            let interval = Duration::from_millis(config.asic.job_interval_ms);
            if interval != self.builder.job_interval() {
                self.builder.set_job_interval(interval);
                self.builder.trigger();
            }

            state.config = config;
            changed
        };

        for pool in changed {
            info!(pool = %pool, "Pool endpoint changed, reconnecting");
            self.connection(pool).trigger_reconnect();
        }
        Ok(())
    }

    /// Time since a pool last answered a share submission, or since start
    /// if none has yet.
    pub fn silent_for(&self) -> Duration {
        let since = self
            .state
            .lock()
            .last_submit_response
            .unwrap_or(self.started);
        Instant::now().saturating_duration_since(since)
    }

    pub fn status(&self) -> ManagerInfo {
        let state = self.state.lock();

        let pools: Vec<PoolId> = match state.strategy.selected() {
            Some(pool) => vec![pool],
            None => PoolId::ALL.to_vec(),
        };
        let pools = pools
            .into_iter()
            .map(|pool| {
                let handle = self.connection(pool);
                let shares = &state.shares[state.shares_slot(pool)];
                PoolInfo {
                    pool,
                    url: state.config.endpoint(pool).url(),
                    connected: handle.is_connected(),
                    state: handle.state(),
                    pool_difficulty: self.builder.mining_info(pool).stratum_difficulty(),
                    accepted: shares.accepted,
                    rejected: shares.rejected,
                    best_diff: Difficulty::new(shares.best_diff).as_u64(),
                    resolved_ip: handle.resolved_ip(),
                    pool_errors: handle.pool_errors(),
                }
            })
            .collect::<Vec<_>>();

        let connected = self.connected_pools();
        ManagerInfo {
            pool_mode: state.config.pool_mode,
            active_mode: state.strategy.mode(),
            using_fallback: state.strategy.is_using_fallback(),
            any_connected: connected.contains(&true),
            connected_count: connected.iter().filter(|c| **c).count(),
            total_best_diff: state.total_best_diff,
            found_blocks: state.found_blocks,
            total_found_blocks: state.total_found_blocks,
            pool_errors: self.connections.iter().map(|c| c.pool_errors()).sum(),
            duplicate_nonces: state.duplicates,
            pools,
        }
    }

    fn session_config(&self, pool: PoolId) -> SessionConfig {
        let state = self.state.lock();
        SessionConfig {
            endpoint: state.config.endpoint(pool),
            keepalive: state.config.keepalive,
            suggested_difficulty: state.config.suggested_difficulty,
            device: state.config.device.clone(),
        }
    }

    fn connected(&self, pool: PoolId) {
        info!(pool = %pool, "Pool connected");
        let commands = {
            let mut state = self.state.lock();
            state.pools[pool.index()] = PoolState::default();
            state.strategy.on_connected(pool, self.connected_pools())
        };
        self.apply(&commands);
    }

    fn disconnected(&self, pool: PoolId) {
        let (commands, dropped) = {
            let mut state = self.state.lock();
            state.pools[pool.index()] = PoolState::default();
            self.builder.invalidate(pool);
            let dropped = self.table.clean_pool(pool);
            (state.strategy.on_disconnected(pool), dropped)
        };
        warn!(pool = %pool, dropped_jobs = dropped, "Pool disconnected");
        self.apply(&commands);
    }

    fn reconnect_timer_fired(&self, pool: PoolId) {
        let commands = self
            .state
            .lock()
            .strategy
            .on_reconnect_timer(pool, self.connected_pools());
        self.apply(&commands);
    }

    fn dispatch(&self, pool: PoolId, message: StratumMessage) {
        let mut state = self.state.lock();
        if !state.strategy.accepts_notify_from(pool) {
            debug!(pool = %pool, "Ignoring message from unselected pool");
            return;
        }

        match message {
            StratumMessage::Notify(notify) => {
                let pool_state = &mut state.pools[pool.index()];
                if notify.clean_jobs || pool_state.first_job {
                    let dropped = self.table.clean_pool(pool);
                    self.builder.reset_extranonce2(pool);
                    debug!(pool = %pool, dropped_jobs = dropped, "Clean jobs");
                }
                pool_state.valid_notify = notify.ntime != 0;
                pool_state.first_job = false;
                debug!(pool = %pool, job_id = %notify.job_id, "mining.notify");
                self.builder.install_notify(pool, notify);
            }
            StratumMessage::SetDifficulty(difficulty) => {
                if self.builder.set_difficulty(pool, difficulty) {
                    info!(pool = %pool, difficulty, "Pool difficulty changed");
                }
            }
            StratumMessage::SetVersionMask(version_mask)
            | StratumMessage::ConfigureResult { version_mask } => {
                debug!(pool = %pool, version_mask = format!("{version_mask:08x}"), "Version mask");
                self.builder.set_version_mask(pool, version_mask);
            }
            StratumMessage::SetExtranonce {
                extranonce1,
                extranonce2_len,
            } => {
                info!(pool = %pool, extranonce1 = %extranonce1, extranonce2_len, "Next extranonce");
                self.builder
                    .set_next_extranonce(pool, &extranonce1, extranonce2_len);
            }
            StratumMessage::SubscribeResult {
                extranonce1,
                extranonce2_len,
            } => {
                info!(pool = %pool, extranonce1 = %extranonce1, extranonce2_len, "Subscribed");
                self.builder
                    .set_extranonce(pool, &extranonce1, extranonce2_len);
            }
            StratumMessage::ClientReconnect => {
                error!(pool = %pool, "Pool asked for client.reconnect, ignoring");
            }
            StratumMessage::GenericResult { id, success } if id >= FIRST_SUBMIT_ID => {
                let slot = state.shares_slot(pool);
                let shares = &mut state.shares[slot];
                if success {
                    shares.accepted += 1;
                    info!(pool = %pool, id, accepted = shares.accepted, "Share accepted");
                } else {
                    shares.rejected += 1;
                    warn!(pool = %pool, id, rejected = shares.rejected, "Share rejected");
                }
                state.last_submit_response = Some(Instant::now());
            }
            StratumMessage::GenericResult { id, success } => {
                if success {
                    info!(pool = %pool, id, "Setup request accepted");
                } else {
                    warn!(pool = %pool, id, "Setup request rejected");
                }
            }
            StratumMessage::Unknown => {
                debug!(pool = %pool, "Unhandled message");
            }
        }
    }
}

impl WorkSource for PoolOrchestrator {
    fn next_active_pool(&self) -> PoolId {
        let mut state = self.state.lock();
        let valid = state.valid();
        state.strategy.next_active_pool(valid)
    }

    fn select_asic_diff(&self, pool: PoolId, pool_diff: u32) -> u32 {
        let mut state = self.state.lock();
        let (min, max) = (
            state.config.asic.min_difficulty,
            state.config.asic.max_difficulty,
        );
        state.strategy.select_asic_diff(pool, pool_diff, min, max)
    }
}

impl ShareSink for PoolOrchestrator {
    fn submit_share(&self, pool: PoolId, share: SubmitParams) {
        let job_id = share.job_id.clone();
        match self.connection(pool).submit(share) {
            Ok(()) => debug!(pool = %pool, job_id = %job_id, "Share queued"),
            Err(e) => warn!(pool = %pool, job_id = %job_id, error = %e, "Share not submitted"),
        }
    }

    fn check_nonce(&self, pool: PoolId, difficulty: Difficulty, nbits: u32) {
        let network = Difficulty::from_bits(CompactTarget::from_consensus(nbits));
        let (new_best, found) = {
            let mut state = self.state.lock();

            let slot = state.shares_slot(pool);
            if difficulty.as_f64() > state.shares[slot].best_diff {
                state.shares[slot].best_diff = difficulty.as_f64();
            }

            let as_int = difficulty.as_u64();
            let new_best = (as_int > state.total_best_diff).then(|| {
                state.total_best_diff = as_int;
                as_int
            });

            let found = (difficulty > network).then(|| {
                state.found_blocks += 1;
                state.total_found_blocks += 1;
                state.total_found_blocks
            });
            (new_best, found)
        };

        if let Some(best) = new_best {
            info!(pool = %pool, difficulty = %difficulty, "New best difficulty");
            if let Err(e) = self.store.save_best_diff(best) {
                warn!(error = %e, "Failed to save best difficulty");
            }
        }
        if let Some(total) = found {
            info!(pool = %pool, difficulty = %difficulty, network = %network, total, "Block found");
            if let Err(e) = self.store.save_found_blocks(total) {
                warn!(error = %e, "Failed to save found block count");
            }
        }
    }

    fn count_duplicate(&self) {
        self.state.lock().duplicates += 1;
    }
}
