//! Daemon state: the single serialization point.
//!
//! Every pool, counter and membership mutation goes through a method on
//! [`ServerState`] while the caller holds the write half of [`SharedState`].
//! Teardown always runs in the same order: notify (quit/squit fan-out),
//! unlink memberships, free the pool slot, then decrement counters.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::broadcast;
use super::config::Config;
use super::counters::{Counters, Stat};
use super::entity::{
    irc_lower, unix_now, Channel, ChannelId, Client, ClientId, ClientState, Outbound, Server,
    ServerId, CLIENT_TOKEN_SPACE,
};
use super::federation::FederationRegistry;
use super::message::{line, Message};
use super::netburst;
use super::pool::{EntityPool, Keyed, PoolError};

/// Shared, thread-safe server state.
pub type SharedState = Arc<RwLock<ServerState>>;

/// Where a state change is announced to linked servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagate {
    /// Local effect only.
    No,
    /// Every registered local link, except the one the change came from.
    ToServers { except: Option<ServerId> },
}

#[derive(Debug)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub clients: EntityPool<Client>,
    pub channels: EntityPool<Channel>,
    pub servers: EntityPool<Server>,
    pub counters: Counters,
    pub registry: FederationRegistry,
    /// The entry representing this daemon.
    pub me: ServerId,
    pub created_ts: u64,
}

impl ServerState {
    pub fn new(config: Config) -> Result<Self, PoolError> {
        let created_ts = unix_now();
        let mut servers = EntityPool::new();
        let me = servers.create_with(|h| {
            Server::myself(h, &config.server_name, config.token, &config.description, created_ts)
        })?;
        let registry = FederationRegistry::new(config.peers.clone());
        Ok(Self {
            config: Arc::new(config),
            clients: EntityPool::with_limit(CLIENT_TOKEN_SPACE),
            channels: EntityPool::new(),
            servers,
            counters: Counters::new(),
            registry,
            me,
            created_ts,
        })
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    pub fn name(&self) -> &str {
        &self.config.server_name
    }

    pub fn token(&self) -> char {
        self.config.token
    }

    /// Line sent with this server as prefix.
    pub fn reply(&self, command: &str, params: Vec<String>) -> Message {
        Message::with_prefix(self.name(), command, params)
    }

    // ── Lookups ──────────────────────────────────────────────────

    pub fn find_nick(&self, nick: &str) -> Option<ClientId> {
        let key = irc_lower(nick);
        self.clients
            .find_by(|c| c.is_registered() && c.key() == key)
    }

    pub fn find_channel(&self, name: &str) -> Option<ChannelId> {
        self.channels.find(&irc_lower(name)).ok()
    }

    pub fn find_server(&self, name: &str) -> Option<ServerId> {
        self.servers.find(&irc_lower(name)).ok()
    }

    pub fn find_client_by_token(&self, token: &str) -> Option<ClientId> {
        self.clients.find_by(|c| c.is_registered() && c.token == token)
    }

    pub fn find_server_by_token(&self, token: char) -> Option<ServerId> {
        self.servers.find_by(|s| s.is_registered() && s.token == token)
    }

    // ── Clients ──────────────────────────────────────────────────

    /// A new client connection. Counted before any validation.
    pub fn accept_client(&mut self, ip: String, tx: Outbound) -> Result<ClientId, PoolError> {
        self.counters.increment(Stat::TotalConns);
        let (me, token) = (self.me, self.token());
        self.clients.create_with(|h| Client::local(h, me, token, ip, tx))
    }

    /// Promote an unregistered local client and announce it to linked servers.
    pub fn register_client(&mut self, id: ClientId) -> Result<(), PoolError> {
        let client = self.clients.get_mut(id)?;
        if client.state != ClientState::Unregistered {
            return Ok(());
        }
        client.state = ClientState::Registered;
        client.touch();
        self.new_registered_client();

        let me = self.servers.get(self.me)?;
        let client = self.clients.get(id)?;
        let n_line = netburst::client_line(me, client);
        broadcast::broadcast_to_servers(self, None, &n_line);
        info!(nick = %client.nick, token = %client.token, "client registered");
        Ok(())
    }

    fn new_registered_client(&mut self) {
        self.counters.increment(Stat::TotalUsers);
        self.counters.increment(Stat::LocalUsers);
        self.counters.update_max_users();
        self.counters.publish();
    }

    /// Insert a registered client introduced by a peer.
    pub fn add_remote_client<F>(&mut self, build: F) -> Result<ClientId, PoolError>
    where
        F: FnOnce(ClientId) -> Client,
    {
        let id = self.clients.create_with(build)?;
        self.counters.increment(Stat::TotalUsers);
        self.counters.update_max_users();
        self.counters.publish();
        Ok(id)
    }

    /// Tear down a client: quit fan-out, membership removal, free, counters.
    pub fn kill_client(&mut self, id: ClientId, reason: &str, propagate: Propagate) -> Result<(), PoolError> {
        let client = self.clients.get_mut(id)?;
        if client.state == ClientState::Dead {
            return Err(PoolError::InvalidHandle {
                index: id.index(),
                generation: id.generation(),
            });
        }
        let was_registered = client.is_registered();
        let was_local = client.is_local();
        client.state = ClientState::Dead;

        let client = self.clients.get(id)?;
        if was_registered {
            let quit = Message::with_prefix(&client.prefix(), "QUIT", vec![reason.to_owned()]).to_line();
            if let Err(e) = broadcast::broadcast_to_channels_of(self, id, &quit, false) {
                warn!(nick = %client.nick, "quit fan-out failed: {e}");
            }
            if let Propagate::ToServers { except } = propagate {
                let q_line = line(format!("{} Q :{reason}", client.token));
                broadcast::broadcast_to_servers(self, except, &q_line);
            }
        }
        if was_local {
            let error = line(format!("ERROR :Closing link ({reason})"));
            client.send(&error);
        }

        let channels: Vec<ChannelId> = client.channels.iter().copied().collect();
        // The slot is freed even when a membership is stale.
        for ch in channels {
            if let Err(e) = self.unlink_member(ch, id) {
                warn!(channel = ch.index(), "stale membership on kill: {e}");
            }
        }

        let client = self.clients.free(id)?;
        debug!(nick = %client.nick, reason, "client freed");

        if was_registered {
            self.counters.decrement(Stat::TotalUsers);
            if was_local {
                self.counters.decrement(Stat::LocalUsers);
            }
            self.counters.publish();
        }
        Ok(())
    }

    /// Kill every client connected through `server`. Not propagated: the
    /// server split itself is.
    pub fn kill_clients_on(&mut self, server: ServerId, reason: &str) -> usize {
        let doomed: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.server == server && c.state != ClientState::Dead)
            .map(|(h, _)| h)
            .collect();
        let mut killed = 0;
        for id in doomed {
            if self.kill_client(id, reason, Propagate::No).is_ok() {
                killed += 1;
            }
        }
        killed
    }

    // ── Channels ─────────────────────────────────────────────────

    pub fn create_channel(&mut self, name: &str, created_ts: u64) -> Result<ChannelId, PoolError> {
        let id = self
            .channels
            .create_with(|h| Channel::new(h, name, created_ts))?;
        self.counters.increment(Stat::Channels);
        self.counters.publish();
        Ok(id)
    }

    pub fn free_channel(&mut self, id: ChannelId) -> Result<(), PoolError> {
        let channel = self.channels.free(id)?;
        self.counters.decrement(Stat::Channels);
        self.counters.publish();
        debug!(channel = %channel.name, "channel freed");
        Ok(())
    }

    /// Add `client` to the channel called `name`, creating it if needed.
    ///
    /// Returns the channel and whether the client was newly added.
    pub fn join_channel(&mut self, client: ClientId, name: &str) -> Result<(ChannelId, bool), PoolError> {
        self.join_channel_at(client, name, unix_now())
    }

    /// [`join_channel`](Self::join_channel) with the creation time a peer
    /// announced. An existing channel adopts `created_ts` when it is older.
    pub fn join_channel_at(
        &mut self,
        client: ClientId,
        name: &str,
        created_ts: u64,
    ) -> Result<(ChannelId, bool), PoolError> {
        self.clients.get(client)?;
        let ch = match self.find_channel(name) {
            Some(ch) => {
                let channel = self.channels.get_mut(ch)?;
                channel.created_ts = channel.created_ts.min(created_ts);
                ch
            }
            None => self.create_channel(name, created_ts)?,
        };
        let added = self.channels.get_mut(ch)?.members.insert(client);
        self.clients.get_mut(client)?.channels.insert(ch);
        Ok((ch, added))
    }

    /// Remove `client` from `channel`, freeing the channel when it empties.
    pub fn part_channel(&mut self, client: ClientId, channel: ChannelId) -> Result<bool, PoolError> {
        let was_member = self.clients.get_mut(client)?.channels.remove(&channel);
        self.unlink_member(channel, client)?;
        Ok(was_member)
    }

    fn unlink_member(&mut self, channel: ChannelId, client: ClientId) -> Result<(), PoolError> {
        let ch = self.channels.get_mut(channel)?;
        ch.members.remove(&client);
        if ch.is_disposable() {
            self.free_channel(channel)?;
        }
        Ok(())
    }

    // ── Servers ──────────────────────────────────────────────────

    /// Tear down a server link and everything reached through it.
    pub fn drop_server(&mut self, id: ServerId, reason: &str) -> Result<(), PoolError> {
        if id == self.me {
            warn!("refusing to drop self");
            return Ok(());
        }
        let server = self.servers.get(id)?;
        let was_registered = server.is_registered();
        let name = server.name.clone();

        if server.local {
            let error = line(format!("ERROR :Closing link ({reason})"));
            server.send(&error);
        }

        let mut doomed = vec![id];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i];
            doomed.extend(
                self.servers
                    .iter()
                    .filter(|(_, s)| s.uplink == Some(parent))
                    .map(|(h, _)| h),
            );
            i += 1;
        }

        let split_reason = format!("{} {}", self.name(), name);
        for &sid in &doomed {
            self.kill_clients_on(sid, &split_reason);
        }

        if was_registered {
            let sq = line(format!("{} SQ {name} :{reason}", self.token()));
            broadcast::broadcast_to_servers(self, self.link_of(id), &sq);
        }

        for sid in doomed {
            self.servers.free(sid)?;
        }
        info!(peer = %name, reason, "server link dropped");
        Ok(())
    }

    /// The directly linked server `id` is reached through.
    pub fn link_of(&self, id: ServerId) -> Option<ServerId> {
        let mut current = id;
        // Uplink chains are short; the bound only guards against a cycle.
        for _ in 0..self.servers.len() {
            let server = self.servers.get(current).ok()?;
            match server.uplink {
                None => return Some(current),
                Some(up) => current = up,
            }
        }
        None
    }

    /// Queue a raw line on a server's link.
    pub fn send_to_server(&self, id: ServerId, line: &Bytes) -> Result<(), PoolError> {
        self.servers.get(id)?.send(line);
        Ok(())
    }
}
