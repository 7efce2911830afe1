//! Periodic liveness sweep over clients and server links.
//!
//! The timer fires first after `sweep_delay` and then every `sweep_period`.
//! Each pass asks a [`LivenessCheck`] about every local connection and acts
//! on the verdict: send it a PING, or tear it down. A pass run twice
//! with the same clock does nothing the second time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info};

use super::config::Timings;
use super::entity::{Client, ClientState, LinkStatus, Server};
use super::message::line;
use super::state::{Propagate, ServerState, SharedState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Alive,
    /// Idle long enough to deserve a PING.
    Ping,
    /// Tear down, with the quit reason.
    Dead(&'static str),
}

/// Decides whether a connection is still worth keeping.
pub trait LivenessCheck: Send + Sync {
    fn client(&self, client: &Client, now: Instant) -> Verdict;
    fn server(&self, server: &Server, now: Instant) -> Verdict;
}

/// Idle-time policy driven by [`Timings`].
#[derive(Debug, Clone)]
pub struct IdleTimeout {
    pub registration: Duration,
    pub ping_after: Duration,
    pub ping_timeout: Duration,
    pub link_timeout: Duration,
}

impl IdleTimeout {
    pub fn from_timings(t: &Timings) -> Self {
        Self {
            registration: t.registration_timeout,
            ping_after: t.ping_after,
            ping_timeout: t.ping_timeout,
            link_timeout: t.link_timeout,
        }
    }

    fn idle(&self, last_seen: Instant, pinged: bool, now: Instant) -> Verdict {
        let idle = now.saturating_duration_since(last_seen);
        if idle > self.ping_timeout {
            Verdict::Dead("Ping timeout")
        } else if idle > self.ping_after && !pinged {
            Verdict::Ping
        } else {
            Verdict::Alive
        }
    }
}

impl LivenessCheck for IdleTimeout {
    fn client(&self, client: &Client, now: Instant) -> Verdict {
        if !client.is_local() {
            return Verdict::Alive;
        }
        match client.state {
            ClientState::Unregistered => {
                if now.saturating_duration_since(client.connected_at) > self.registration {
                    Verdict::Dead("Registration timeout")
                } else {
                    Verdict::Alive
                }
            }
            ClientState::Registered => self.idle(client.last_seen, client.pinged, now),
            ClientState::Dead => Verdict::Alive,
        }
    }

    fn server(&self, server: &Server, now: Instant) -> Verdict {
        if !server.local {
            return Verdict::Alive;
        }
        match server.status {
            LinkStatus::Connecting | LinkStatus::Handshaking => {
                if now.saturating_duration_since(server.last_seen) > self.link_timeout {
                    Verdict::Dead("Link timeout")
                } else {
                    Verdict::Alive
                }
            }
            LinkStatus::Registered => self.idle(server.last_seen, server.pinged, now),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub clients_killed: usize,
    pub servers_dropped: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub fn sweep(state: &mut ServerState, check: &dyn LivenessCheck, now: Instant) -> SweepReport {
    let mut report = SweepReport::default();

    for id in state.clients.handles() {
        let Ok(client) = state.clients.get(id) else {
            continue;
        };
        match check.client(client, now) {
            Verdict::Alive => {}
            Verdict::Ping => {
                client.send(&line(format!("PING :{}", state.name())));
                if let Ok(client) = state.clients.get_mut(id) {
                    client.pinged = true;
                }
                report.pinged += 1;
            }
            Verdict::Dead(reason) => {
                if state
                    .kill_client(id, reason, Propagate::ToServers { except: None })
                    .is_ok()
                {
                    report.clients_killed += 1;
                }
            }
        }
    }

    for id in state.servers.handles() {
        if id == state.me {
            continue;
        }
        // An earlier drop in this pass may have taken it out already.
        let Ok(server) = state.servers.get(id) else {
            continue;
        };
        match check.server(server, now) {
            Verdict::Alive => {}
            Verdict::Ping => {
                server.send(&line(format!("{} G :{}", state.token(), state.name())));
                if let Ok(server) = state.servers.get_mut(id) {
                    server.pinged = true;
                }
                report.pinged += 1;
            }
            Verdict::Dead(reason) => {
                info!(peer = %server.name, reason, "housekeeping: dropping link");
                if state.drop_server(id, reason).is_ok() {
                    report.servers_dropped += 1;
                }
            }
        }
    }

    report
}

/// Run [`sweep`] on the configured schedule.
pub fn spawn(
    state: SharedState,
    check: Arc<dyn LivenessCheck>,
    delay: Duration,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(tokio::time::Instant::now() + delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let mut st = state.write().await;
            let report = sweep(&mut st, check.as_ref(), Instant::now());
            if !report.is_empty() {
                debug!(
                    pinged = report.pinged,
                    killed = report.clients_killed,
                    dropped = report.servers_dropped,
                    "housekeeping: sweep"
                );
            }
        }
    })
}
