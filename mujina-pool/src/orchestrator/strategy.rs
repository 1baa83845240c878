//! Pool selection policies.
//!
//! Policy functions only decide. They return [`PoolCommand`]s for the
//! orchestrator to apply to its connections, which keeps every rule testable
//! without sockets.

use crate::config::PoolMode;
use crate::types::PoolId;

/// Something a policy wants done to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolCommand {
    Connect(PoolId),
    Disconnect(PoolId),
    StartReconnectTimer(PoolId),
    StopReconnectTimer(PoolId),
}

/// Connection status of both pools, indexed by [`PoolId::index`].
pub type Connected = [bool; 2];

/// One pool mines at a time; the secondary only while the primary is down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverState {
    selected: PoolId,
}

impl Default for FailoverState {
    fn default() -> Self {
        Self {
            selected: PoolId::Primary,
        }
    }
}

impl FailoverState {
    pub fn selected(&self) -> PoolId {
        self.selected
    }

    fn banish_secondary() -> Vec<PoolCommand> {
        vec![
            PoolCommand::Disconnect(PoolId::Secondary),
            PoolCommand::StopReconnectTimer(PoolId::Secondary),
        ]
    }

    fn on_connected(&mut self, pool: PoolId, connected: Connected) -> Vec<PoolCommand> {
        match pool {
            PoolId::Primary => {
                self.selected = PoolId::Primary;
                Self::banish_secondary()
            }
            PoolId::Secondary if !connected[PoolId::Primary.index()] => {
                self.selected = PoolId::Secondary;
                Vec::new()
            }
            // Primary wins ties
            PoolId::Secondary => Self::banish_secondary(),
        }
    }

    fn on_disconnected(&mut self, pool: PoolId) -> Vec<PoolCommand> {
        match pool {
            // Selection moves once the secondary actually connects
            PoolId::Primary => vec![PoolCommand::StartReconnectTimer(PoolId::Secondary)],
            PoolId::Secondary => Vec::new(),
        }
    }

    fn on_reconnect_timer(&self, pool: PoolId, connected: Connected) -> Vec<PoolCommand> {
        match pool {
            PoolId::Primary => vec![PoolCommand::Connect(PoolId::Primary)],
            PoolId::Secondary if connected[PoolId::Primary.index()] => {
                vec![PoolCommand::Disconnect(PoolId::Secondary)]
            }
            PoolId::Secondary => vec![PoolCommand::Connect(PoolId::Secondary)],
        }
    }
}

/// Both pools mine; jobs are split by percentage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualPoolState {
    primary_pct: u32,
    accumulator: u32,
    pool_diffs: [u32; 2],
}

impl DualPoolState {
    pub fn new(primary_pct: u32) -> Self {
        Self {
            primary_pct: primary_pct.min(100),
            accumulator: 0,
            pool_diffs: [u32::MAX; 2],
        }
    }

    pub fn primary_percentage(&self) -> u32 {
        self.primary_pct
    }

    /// Error-diffusion split: every tick adds the secondary's share to an
    /// accumulator, and each time it reaches 100 the secondary gets the tick.
    fn next_active_pool(&mut self, valid: [bool; 2]) -> PoolId {
        match valid {
            [true, true] => {}
            [false, true] => {
                self.accumulator = 0;
                return PoolId::Secondary;
            }
            _ => {
                self.accumulator = 0;
                return PoolId::Primary;
            }
        }

        self.accumulator += 100 - self.primary_pct;
        if self.accumulator >= 100 {
            self.accumulator -= 100;
            PoolId::Secondary
        } else {
            PoolId::Primary
        }
    }

    /// The chips serve both pools at once, so they report at the lower of the
    /// two pool difficulties.
    fn select_asic_diff(&mut self, pool: PoolId, pool_diff: u32, min: u32, max: u32) -> u32 {
        self.pool_diffs[pool.index()] = pool_diff;
        let lowest = self.pool_diffs[0].min(self.pool_diffs[1]);
        clamp(lowest, min, max)
    }
}

/// Clamp into the chip range; `min` wins if the range is inverted.
fn clamp(value: u32, min: u32, max: u32) -> u32 {
    value.min(max).max(min)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Failover(FailoverState),
    DualPool(DualPoolState),
}

impl Strategy {
    pub fn new(mode: PoolMode, primary_pct: u32) -> Self {
        match mode {
            PoolMode::Failover => Strategy::Failover(FailoverState::default()),
            PoolMode::Dual => Strategy::DualPool(DualPoolState::new(primary_pct)),
        }
    }

    pub fn mode(&self) -> PoolMode {
        match self {
            Strategy::Failover(_) => PoolMode::Failover,
            Strategy::DualPool(_) => PoolMode::Dual,
        }
    }

    /// Connections to open when the orchestrator starts.
    pub fn startup(&self) -> Vec<PoolCommand> {
        match self {
            Strategy::Failover(_) => vec![PoolCommand::Connect(PoolId::Primary)],
            Strategy::DualPool(_) => vec![
                PoolCommand::Connect(PoolId::Primary),
                PoolCommand::Connect(PoolId::Secondary),
            ],
        }
    }

    pub fn accepts_notify_from(&self, pool: PoolId) -> bool {
        match self {
            Strategy::Failover(state) => pool == state.selected,
            Strategy::DualPool(_) => true,
        }
    }

    pub fn on_connected(&mut self, pool: PoolId, connected: Connected) -> Vec<PoolCommand> {
        match self {
            Strategy::Failover(state) => state.on_connected(pool, connected),
            Strategy::DualPool(_) => Vec::new(),
        }
    }

    pub fn on_disconnected(&mut self, pool: PoolId) -> Vec<PoolCommand> {
        match self {
            Strategy::Failover(state) => state.on_disconnected(pool),
            Strategy::DualPool(_) => vec![PoolCommand::StartReconnectTimer(pool)],
        }
    }

    pub fn on_reconnect_timer(&self, pool: PoolId, connected: Connected) -> Vec<PoolCommand> {
        match self {
            Strategy::Failover(state) => state.on_reconnect_timer(pool, connected),
            Strategy::DualPool(_) => vec![PoolCommand::Connect(pool)],
        }
    }

    /// Pool for the next job, given which pools hold a valid template.
    pub fn next_active_pool(&mut self, valid: [bool; 2]) -> PoolId {
        match self {
            Strategy::Failover(state) => state.selected,
            Strategy::DualPool(state) => state.next_active_pool(valid),
        }
    }

    pub fn select_asic_diff(&mut self, pool: PoolId, pool_diff: u32, min: u32, max: u32) -> u32 {
        match self {
            Strategy::Failover(_) => clamp(pool_diff, min, max),
            Strategy::DualPool(state) => state.select_asic_diff(pool, pool_diff, min, max),
        }
    }

    /// Apply a new dual-pool split. A changed split restarts the dithering.
    pub fn set_primary_percentage(&mut self, primary_pct: u32) {
        if let Strategy::DualPool(state) = self {
            let primary_pct = primary_pct.min(100);
            if state.primary_pct != primary_pct {
                state.primary_pct = primary_pct;
                state.accumulator = 0;
            }
        }
    }

    /// Pool whose work is authoritative, if only one is.
    pub fn selected(&self) -> Option<PoolId> {
        match self {
            Strategy::Failover(state) => Some(state.selected),
            Strategy::DualPool(_) => None,
        }
    }

    pub fn is_using_fallback(&self) -> bool {
        self.selected() == Some(PoolId::Secondary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    use PoolCommand::*;
    use PoolId::{Primary, Secondary};

    fn failover() -> Strategy {
        Strategy::new(PoolMode::Failover, 50)
    }

    #[test]
    fn failover_primary_connect_banishes_secondary() {
        let mut s = failover();
        s.on_connected(Secondary, [false, true]);
        assert_eq!(s.selected(), Some(Secondary));
        assert!(s.is_using_fallback());

        let commands = s.on_connected(Primary, [true, true]);
        assert_eq!(commands, vec![Disconnect(Secondary), StopReconnectTimer(Secondary)]);
        assert_eq!(s.selected(), Some(Primary));
        assert!(!s.accepts_notify_from(Secondary));
        assert!(s.accepts_notify_from(Primary));
    }

    #[test]
    fn failover_secondary_loses_tie() {
        let mut s = failover();
        s.on_connected(Primary, [true, false]);
        let commands = s.on_connected(Secondary, [true, true]);
        assert_eq!(commands, vec![Disconnect(Secondary), StopReconnectTimer(Secondary)]);
        assert_eq!(s.selected(), Some(Primary));
    }

    #[test]
    fn failover_primary_loss_arms_secondary() {
        let mut s = failover();
        assert_eq!(s.on_disconnected(Primary), vec![StartReconnectTimer(Secondary)]);
        assert!(s.on_disconnected(Secondary).is_empty());
        // Still selected until the secondary comes up
        assert_eq!(s.selected(), Some(Primary));
    }

    #[test_case(Primary, [false, false], vec![Connect(Primary)])]
    #[test_case(Primary, [true, false], vec![Connect(Primary)])]
    #[test_case(Secondary, [false, false], vec![Connect(Secondary)])]
    #[test_case(Secondary, [true, false], vec![Disconnect(Secondary)])]
    fn failover_reconnect_policy(pool: PoolId, connected: Connected, expected: Vec<PoolCommand>) {
        assert_eq!(failover().on_reconnect_timer(pool, connected), expected);
    }

    #[test]
    fn failover_invariant_holds_under_interleavings() {
        // Whatever order the events arrive in, once the primary is connected
        // the secondary is neither accepted nor left connected
        let events = [
            (true, Secondary),
            (true, Primary),
            (false, Primary),
            (true, Secondary),
            (false, Secondary),
            (true, Primary),
            (true, Secondary),
            (false, Primary),
            (true, Secondary),
        ];
        let mut s = failover();
        let mut connected = [false, false];

        for (up, pool) in events {
            connected[pool.index()] = up;
            let commands = if up {
                s.on_connected(pool, connected)
            } else {
                s.on_disconnected(pool)
            };
            for command in commands {
                if let Disconnect(p) = command {
                    connected[p.index()] = false;
                }
            }

            if connected[Primary.index()] {
                assert_eq!(s.selected(), Some(Primary));
                assert!(!s.accepts_notify_from(Secondary));
                assert!(!connected[Secondary.index()]);
            }
        }
        assert_eq!(s.selected(), Some(Secondary));
    }

    #[test]
    fn dual_accepts_everything_and_keeps_pools_alive() {
        let mut s = Strategy::new(PoolMode::Dual, 50);
        assert!(s.accepts_notify_from(Primary) && s.accepts_notify_from(Secondary));
        assert!(s.on_connected(Secondary, [true, true]).is_empty());
        assert_eq!(s.on_disconnected(Secondary), vec![StartReconnectTimer(Secondary)]);
        assert_eq!(s.on_reconnect_timer(Primary, [true, true]), vec![Connect(Primary)]);
        assert_eq!(s.startup(), vec![Connect(Primary), Connect(Secondary)]);
        assert!(!s.is_using_fallback());
    }

    #[test_case(50)]
    #[test_case(70)]
    #[test_case(99)]
    #[test_case(1)]
    #[test_case(33)]
    fn dual_split_converges(primary_pct: u32) {
        let mut s = Strategy::new(PoolMode::Dual, primary_pct);
        let ticks = 1000u32;
        let secondary = (0..ticks)
            .filter(|_| s.next_active_pool([true, true]) == Secondary)
            .count() as i64;

        let expected = i64::from(ticks * (100 - primary_pct) / 100);
        assert!(
            (secondary - expected).abs() <= 1,
            "{secondary} secondary ticks, expected {expected}"
        );
    }

    #[test]
    fn dual_split_is_exact_per_cycle() {
        let mut s = Strategy::new(PoolMode::Dual, 70);
        let picks: Vec<PoolId> = (0..10).map(|_| s.next_active_pool([true, true])).collect();
        assert_eq!(picks.iter().filter(|p| **p == Secondary).count(), 3);
    }

    #[test_case([true, false], Primary)]
    #[test_case([false, true], Secondary)]
    #[test_case([false, false], Primary)]
    fn dual_fast_path_resets_accumulator(valid: [bool; 2], expected: PoolId) {
        let mut s = Strategy::new(PoolMode::Dual, 10);
        s.next_active_pool([true, true]);
        assert_eq!(s.next_active_pool(valid), expected);
        let Strategy::DualPool(state) = &s else { unreachable!() };
        assert_eq!(state.accumulator, 0);
    }

    #[test]
    fn changed_split_resets_accumulator() {
        let mut s = Strategy::new(PoolMode::Dual, 50);
        s.next_active_pool([true, true]);
        s.set_primary_percentage(50);
        let Strategy::DualPool(state) = &s else { unreachable!() };
        assert_eq!(state.accumulator, 50);

        s.set_primary_percentage(80);
        let Strategy::DualPool(state) = &s else { unreachable!() };
        assert_eq!(state.accumulator, 0);
        assert_eq!(state.primary_percentage(), 80);
    }

    #[test_case(100, 256)]
    #[test_case(1000, 1000)]
    #[test_case(8192, 2048)]
    fn failover_clamps_to_chip_range(pool_diff: u32, expected: u32) {
        assert_eq!(failover().select_asic_diff(Primary, pool_diff, 256, 2048), expected);
    }

    #[test]
    fn dual_uses_lower_pool_difficulty() {
        let mut s = Strategy::new(PoolMode::Dual, 50);
        // Secondary unknown yet
        assert_eq!(s.select_asic_diff(Primary, 1500, 256, 4096), 1500);
        assert_eq!(s.select_asic_diff(Secondary, 600, 256, 4096), 600);
        assert_eq!(s.select_asic_diff(Primary, 3000, 256, 4096), 600);
        assert_eq!(s.select_asic_diff(Secondary, 100_000, 256, 4096), 3000);
    }
}
