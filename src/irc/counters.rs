//! Named server statistics.
//!
//! Owned by [`ServerState`](super::state::ServerState) and mutated only
//! under its write lock, alongside the pool operation that motivates the
//! change.

use ::metrics::gauge;

use super::metrics as names;

/// The fixed set of tracked statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    /// Every accepted connection, client or server, before validation.
    TotalConns,
    /// Registered clients network-wide.
    TotalUsers,
    /// Registered clients connected to this server.
    LocalUsers,
    /// High-water mark of `TotalUsers`.
    MaxUsers,
    /// Live channels.
    Channels,
}

impl Stat {
    pub const ALL: [Stat; 5] = [
        Stat::TotalConns,
        Stat::TotalUsers,
        Stat::LocalUsers,
        Stat::MaxUsers,
        Stat::Channels,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    /// Gauge name this statistic is published under.
    pub fn metric_name(self) -> &'static str {
        match self {
            Stat::TotalConns => names::STAT_TOTAL_CONNS,
            Stat::TotalUsers => names::STAT_TOTAL_USERS,
            Stat::LocalUsers => names::STAT_LOCAL_USERS,
            Stat::MaxUsers => names::STAT_MAX_USERS,
            Stat::Channels => names::STAT_CHANNELS,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Counters {
    values: [u64; Stat::ALL.len()],
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stat: Stat) -> u64 {
        self.values[stat.slot()]
    }

    pub fn set(&mut self, stat: Stat, value: u64) {
        self.values[stat.slot()] = value;
    }

    pub fn increment(&mut self, stat: Stat) {
        let v = &mut self.values[stat.slot()];
        *v = v.saturating_add(1);
    }

    /// Saturates at zero.
    pub fn decrement(&mut self, stat: Stat) {
        let v = &mut self.values[stat.slot()];
        *v = v.saturating_sub(1);
    }

    /// Raise `MaxUsers` to `TotalUsers` if it has been exceeded.
    pub fn update_max_users(&mut self) {
        let total = self.get(Stat::TotalUsers);
        if self.get(Stat::MaxUsers) < total {
            self.set(Stat::MaxUsers, total);
        }
    }

    /// Mirror every statistic into its `metrics` gauge.
    pub fn publish(&self) {
        for stat in Stat::ALL {
            gauge!(stat.metric_name()).set(self.get(stat) as f64);
        }
    }
}
