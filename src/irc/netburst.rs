//! Netburst: the full-state dump exchanged when two servers link.
//!
//! Sending is split in two. [`snapshot`] renders every line while the caller
//! holds the state lock, in the same critical section that promotes the peer
//! to registered, so the burst and the live event stream that follows it
//! never overlap or leave a gap. [`stream`] then writes the lines out with no
//! lock held.
//!
//! Receiving goes through [`BurstReceiver`], which stages records and applies
//! them only when the end-of-burst marker arrives. A link that dies mid-burst
//! leaves no half-applied state behind.
//!
//! Line formats, in send order:
//!
//! ```text
//! <nlToken> S <name> <hops> <bootTs> <linkTs> J10  <token> :<description>
//! <serverToken> N <nick> <hops> 0 <user> <host> <modes> <ip> <clientToken> :<realname>
//! <selfToken> B <channel> <createdTs> <modes>      (channel with a topic)
//! C <channel> <modes>                              (channel without one)
//! EB
//! ```

use bytes::Bytes;
use futures::{Sink, SinkExt};
use tracing::{debug, info, warn};

use super::entity::{
    irc_lower, is_channel_name, unix_now, Channel, Client, Server, ServerId, UserModes,
};
use super::message::{line, Message};
use super::pool::{Keyed, PoolError};
use super::state::ServerState;

/// Protocol tag carried on every S-line.
pub const PROTOCOL: &str = "J10";

#[derive(Debug, thiserror::Error)]
pub enum BurstError {
    #[error("link closed after {sent} of {total} burst lines: {reason}")]
    LinkClosedMidBurst {
        sent: usize,
        total: usize,
        reason: String,
    },
    #[error("malformed burst line {0:?}")]
    Malformed(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

// ── Formatting ───────────────────────────────────────────────────

pub fn server_line(server: &Server) -> Bytes {
    line(format!(
        "{} S {} {} {} {} {PROTOCOL}  {} :{}",
        server.nl_token,
        server.name,
        server.hops,
        server.boot_ts,
        server.link_ts,
        server.token,
        server.description
    ))
}

/// N-line for `client`, introduced by its owning `server`.
pub fn client_line(server: &Server, client: &Client) -> Bytes {
    line(format!(
        "{} N {} {} 0 {} {} {} {} {} :{}",
        server.token,
        client.nick,
        server.hops,
        client.user,
        client.host,
        client.modes.to_mode_string(),
        client.ip,
        client.token,
        client.realname
    ))
}

pub fn channel_line(self_token: char, channel: &Channel) -> Bytes {
    if channel.has_topic() {
        line(format!(
            "{self_token} B {} {} {}",
            channel.name, channel.created_ts, channel.modes
        ))
    } else {
        line(format!("C {} {}", channel.name, channel.modes))
    }
}

pub fn end_of_burst() -> Bytes {
    Bytes::from_static(b"EB\r\n")
}

/// Render the burst for `target`: servers, registered clients, channels, EB.
///
/// The target itself, servers learned through it and their clients are left
/// out; the target already knows them.
pub fn snapshot(state: &ServerState, target: ServerId) -> Vec<Bytes> {
    let behind_target = |id: ServerId| {
        id == target
            || state
                .servers
                .get(id)
                .map(|s| s.uplink == Some(target))
                .unwrap_or(false)
    };

    let mut lines = Vec::new();

    for (id, server) in state.servers.iter() {
        if server.is_registered() && !behind_target(id) {
            lines.push(server_line(server));
        }
    }

    for (_, client) in state.clients.iter() {
        if !client.is_registered() || behind_target(client.server) {
            continue;
        }
        match state.servers.get(client.server) {
            Ok(server) => lines.push(client_line(server, client)),
            Err(e) => warn!(nick = %client.nick, error = %e, "client on unknown server skipped in burst"),
        }
    }

    for (_, channel) in state.channels.iter() {
        lines.push(channel_line(state.token(), channel));
    }

    lines.push(end_of_burst());
    lines
}

/// Write `lines` to the link in order. Each line is its own send.
pub async fn stream<S>(sink: &mut S, lines: Vec<Bytes>) -> Result<usize, BurstError>
where
    S: Sink<Bytes> + Unpin,
    S::Error: std::fmt::Display,
{
    let total = lines.len();
    for (sent, l) in lines.into_iter().enumerate() {
        sink.send(l)
            .await
            .map_err(|e| BurstError::LinkClosedMidBurst {
                sent,
                total,
                reason: e.to_string(),
            })?;
    }
    Ok(total)
}

// ── Receiving ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub nl_token: char,
    pub name: String,
    pub hops: u32,
    pub boot_ts: u64,
    pub link_ts: u64,
    pub token: char,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub server_token: char,
    pub nick: String,
    pub hops: u32,
    pub user: String,
    pub host: String,
    pub modes: String,
    pub ip: String,
    pub token: String,
    pub realname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub name: String,
    /// Present on B-lines only.
    pub created_ts: Option<u64>,
    pub modes: String,
    pub has_topic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BurstRecord {
    Server(ServerRecord),
    Client(ClientRecord),
    Channel(ChannelRecord),
    End,
}

fn single_char(s: &str) -> Option<char> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

impl BurstRecord {
    /// Classify a link line. `Ok(None)` means it is not a burst line.
    pub fn parse(msg: &Message) -> Result<Option<Self>, BurstError> {
        let malformed = || BurstError::Malformed(msg.to_wire());

        if msg.command == "EB" && msg.params.is_empty() {
            return Ok(Some(BurstRecord::End));
        }
        if msg.command == "C" && is_channel_name(msg.param(0)) {
            if msg.params.len() < 2 {
                return Err(malformed());
            }
            return Ok(Some(BurstRecord::Channel(ChannelRecord {
                name: msg.params[0].clone(),
                created_ts: None,
                modes: msg.params[1].clone(),
                has_topic: false,
            })));
        }

        let Some(origin) = single_char(&msg.command) else {
            return Ok(None);
        };
        let p = &msg.params;
        let num = |i: usize| -> Result<u64, BurstError> { p[i].parse().map_err(|_| malformed()) };

        let record = match msg.param(0) {
            "S" => {
                if p.len() < 8 {
                    return Err(malformed());
                }
                BurstRecord::Server(ServerRecord {
                    nl_token: origin,
                    name: p[1].clone(),
                    hops: num(2)? as u32,
                    boot_ts: num(3)?,
                    link_ts: num(4)?,
                    token: single_char(&p[6]).ok_or_else(malformed)?,
                    description: p[7].clone(),
                })
            }
            "N" => {
                if p.len() < 10 {
                    return Err(malformed());
                }
                BurstRecord::Client(ClientRecord {
                    server_token: origin,
                    nick: p[1].clone(),
                    hops: num(2)? as u32,
                    user: p[4].clone(),
                    host: p[5].clone(),
                    modes: p[6].clone(),
                    ip: p[7].clone(),
                    token: p[8].clone(),
                    realname: p[9].clone(),
                })
            }
            "B" => {
                if p.len() < 4 {
                    return Err(malformed());
                }
                BurstRecord::Channel(ChannelRecord {
                    name: p[1].clone(),
                    created_ts: Some(num(2)?),
                    modes: p[3].clone(),
                    has_topic: true,
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(record))
    }
}

/// What a committed burst added.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BurstSummary {
    pub servers: usize,
    pub clients: usize,
    pub channels: usize,
    pub skipped: usize,
}

/// Stages a peer's burst until `EB`.
#[derive(Debug)]
pub struct BurstReceiver {
    peer: ServerId,
    servers: Vec<ServerRecord>,
    clients: Vec<ClientRecord>,
    channels: Vec<ChannelRecord>,
}

impl BurstReceiver {
    pub fn new(peer: ServerId) -> Self {
        Self {
            peer,
            servers: Vec::new(),
            clients: Vec::new(),
            channels: Vec::new(),
        }
    }

    /// Stage one record. Returns `true` on the end-of-burst marker.
    pub fn stage(&mut self, record: BurstRecord) -> bool {
        match record {
            BurstRecord::Server(s) => self.servers.push(s),
            BurstRecord::Client(c) => self.clients.push(c),
            BurstRecord::Channel(ch) => self.channels.push(ch),
            BurstRecord::End => return true,
        }
        false
    }

    pub fn staged(&self) -> usize {
        self.servers.len() + self.clients.len() + self.channels.len()
    }

    /// Apply everything staged. The peer must still exist.
    pub fn commit(self, state: &mut ServerState) -> Result<BurstSummary, BurstError> {
        let mut summary = BurstSummary::default();
        let peer = self.peer;
        let peer_name = state.servers.get(peer)?.name.clone();

        for record in self.servers {
            if apply_server(state, peer, &record)? {
                summary.servers += 1;
            } else {
                summary.skipped += 1;
            }
        }
        for record in self.clients {
            if apply_client(state, peer, &record)? {
                summary.clients += 1;
            } else {
                summary.skipped += 1;
            }
        }
        for record in self.channels {
            if apply_channel(state, &record)? {
                summary.channels += 1;
            }
        }

        state.servers.get_mut(peer)?.burst_complete = true;
        info!(
            peer = %peer_name,
            servers = summary.servers,
            clients = summary.clients,
            channels = summary.channels,
            skipped = summary.skipped,
            "burst received"
        );
        Ok(summary)
    }
}

/// Add or refresh a server learned from `peer`. Returns whether a new
/// transitive server was added.
pub fn apply_server(state: &mut ServerState, peer: ServerId, record: &ServerRecord) -> Result<bool, BurstError> {
    let peer_entry = state.servers.get_mut(peer)?;
    if peer_entry.key() == irc_lower(&record.name) {
        peer_entry.boot_ts = record.boot_ts;
        peer_entry.link_ts = record.link_ts;
        peer_entry.token = record.token;
        peer_entry.description = record.description.clone();
        return Ok(false);
    }
    let peer_token = peer_entry.token;

    if let Some(existing) = state.find_server(&record.name) {
        if existing != peer {
            debug!(server = %record.name, "already known, skipped");
        }
        return Ok(false);
    }
    if state.find_server_by_token(record.token).is_some() {
        warn!(server = %record.name, token = %record.token, "token collision, skipped");
        return Ok(false);
    }

    let uplink = match state.find_server_by_token(record.nl_token) {
        Some(via) if via != state.me && record.nl_token != peer_token => via,
        _ => peer,
    };
    state.servers.create_with(|h| {
        let mut s = Server::transitive(h, &record.name, uplink);
        s.hops = record.hops + 1;
        s.boot_ts = record.boot_ts;
        s.link_ts = record.link_ts;
        s.token = record.token;
        s.nl_token = record.nl_token;
        s.description = record.description.clone();
        s
    })?;
    Ok(true)
}

/// Add a remote client. Returns `false` when it was skipped.
pub fn apply_client(state: &mut ServerState, peer: ServerId, record: &ClientRecord) -> Result<bool, BurstError> {
    let Some(server) = state.find_server_by_token(record.server_token) else {
        warn!(nick = %record.nick, token = %record.server_token, "client on unknown server, skipped");
        return Ok(false);
    };
    let reachable = server == peer
        || state
            .servers
            .get(server)
            .map(|s| s.uplink.is_some())
            .unwrap_or(false);
    if !reachable {
        warn!(nick = %record.nick, "client claims a server not behind this link, skipped");
        return Ok(false);
    }
    if state.find_nick(&record.nick).is_some() {
        warn!(nick = %record.nick, "nick collision, skipped");
        return Ok(false);
    }
    if state.find_client_by_token(&record.token).is_some() {
        warn!(nick = %record.nick, token = %record.token, "client token already in use, skipped");
        return Ok(false);
    }

    let added = state.add_remote_client(|h| {
        let mut c = Client::remote(h, server, &record.nick);
        c.user = record.user.clone();
        c.host = record.host.clone();
        c.modes = UserModes::parse(&record.modes);
        c.ip = record.ip.clone();
        c.token = record.token.clone();
        c.realname = record.realname.clone();
        c
    });
    match added {
        Ok(_) => Ok(true),
        // A full client table must not split the network.
        Err(PoolError::CapacityExceeded { limit }) => {
            warn!(nick = %record.nick, limit, "client table full, remote client skipped");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Create or merge a channel. Returns whether it was newly created.
pub fn apply_channel(state: &mut ServerState, record: &ChannelRecord) -> Result<bool, BurstError> {
    if let Some(id) = state.find_channel(&record.name) {
        let channel = state.channels.get_mut(id)?;
        if let Some(ts) = record.created_ts {
            if ts < channel.created_ts {
                channel.created_ts = ts;
                channel.modes = record.modes.clone();
            }
        }
        if record.has_topic && channel.topic.is_none() {
            channel.topic = Some(String::new());
        }
        return Ok(false);
    }

    let id = state.create_channel(&record.name, record.created_ts.unwrap_or_else(unix_now))?;
    let channel = state.channels.get_mut(id)?;
    channel.modes = record.modes.clone();
    if record.has_topic {
        channel.topic = Some(String::new());
    }
    Ok(true)
}
