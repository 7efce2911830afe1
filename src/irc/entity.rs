//! Pooled entities: clients, channels and servers.
//!
//! Entities never reference each other by pointer, only by [`Handle`], so a
//! dead peer or client can be freed without chasing back-references.

use std::collections::HashSet;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::pool::{Handle, Keyed};

pub type ClientId = Handle<Client>;
pub type ChannelId = Handle<Channel>;
pub type ServerId = Handle<Server>;

/// Per-entity outbound queue. Each item is one complete `\r\n`-terminated line.
pub type Outbound = mpsc::Sender<Bytes>;

/// Depth of every entity's outbound queue.
pub const SEND_QUEUE_DEPTH: usize = 512;

/// Normalize a string for case-insensitive IRC comparison (CASEMAPPING=ascii).
pub fn irc_lower(s: &str) -> String {
    s.to_ascii_lowercase()
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Result of handing a line to an entity's send path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; the line was dropped for this recipient only.
    Dropped,
    /// No direct link (remote client, self, or a closed connection).
    NoLink,
}

fn deliver(tx: Option<&Outbound>, line: &Bytes) -> Delivery {
    match tx {
        None => Delivery::NoLink,
        Some(tx) => match tx.try_send(line.clone()) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::NoLink,
        },
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unregistered,
    Registered,
    Dead,
}

/// User mode flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserModes {
    /// +i
    pub invisible: bool,
    /// +w
    pub wallops: bool,
    /// +o
    pub operator: bool,
}

impl UserModes {
    /// Render as a mode string, e.g. `+iw`. Always at least `+`.
    pub fn to_mode_string(&self) -> String {
        let mut s = String::from("+");
        if self.invisible {
            s.push('i');
        }
        if self.operator {
            s.push('o');
        }
        if self.wallops {
            s.push('w');
        }
        s
    }

    /// Parse a burst mode string. Unknown letters are ignored.
    pub fn parse(modes: &str) -> Self {
        let mut m = Self::default();
        for c in modes.chars() {
            match c {
                'i' => m.invisible = true,
                'o' => m.operator = true,
                'w' => m.wallops = true,
                _ => {}
            }
        }
        m
    }
}

#[derive(Debug)]
pub struct Client {
    pub handle: ClientId,
    pub state: ClientState,
    /// Server this client is connected to (self for local clients).
    pub server: ServerId,
    pub nick: String,
    nick_key: String,
    pub user: String,
    pub host: String,
    pub realname: String,
    pub modes: UserModes,
    pub ip: String,
    /// Network-unique token: owning server token + slot index.
    pub token: String,
    pub channels: HashSet<ChannelId>,
    /// Present only for clients connected to this server.
    pub tx: Option<Outbound>,
    pub connected_at: Instant,
    pub last_seen: Instant,
    /// A liveness PING has been sent and not yet answered.
    pub pinged: bool,
}

impl Client {
    /// A freshly accepted local connection, not yet registered.
    pub fn local(handle: ClientId, server: ServerId, server_token: char, ip: String, tx: Outbound) -> Self {
        let now = Instant::now();
        Self {
            handle,
            state: ClientState::Unregistered,
            server,
            nick: String::new(),
            nick_key: String::new(),
            user: String::new(),
            host: ip.clone(),
            realname: String::new(),
            modes: UserModes::default(),
            token: client_token(server_token, handle),
            ip,
            channels: HashSet::new(),
            tx: Some(tx),
            connected_at: now,
            last_seen: now,
            pinged: false,
        }
    }

    /// A registered client learned from a peer. It has no send path here.
    pub fn remote(handle: ClientId, server: ServerId, nick: &str) -> Self {
        let now = Instant::now();
        Self {
            handle,
            state: ClientState::Registered,
            server,
            nick: nick.to_owned(),
            nick_key: irc_lower(nick),
            user: String::new(),
            host: String::new(),
            realname: String::new(),
            modes: UserModes::default(),
            ip: String::new(),
            token: String::new(),
            channels: HashSet::new(),
            tx: None,
            connected_at: now,
            last_seen: now,
            pinged: false,
        }
    }

    pub fn set_nick(&mut self, nick: &str) {
        self.nick = nick.to_owned();
        self.nick_key = irc_lower(nick);
    }

    pub fn is_registered(&self) -> bool {
        self.state == ClientState::Registered
    }

    pub fn is_local(&self) -> bool {
        self.tx.is_some()
    }

    /// `nick!user@host` prefix for relayed commands.
    pub fn prefix(&self) -> String {
        format!("{}!{}@{}", self.nick, self.user, self.host)
    }

    pub fn send(&self, line: &Bytes) -> Delivery {
        deliver(self.tx.as_ref(), line)
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.pinged = false;
    }
}

impl Keyed for Client {
    fn key(&self) -> &str {
        &self.nick_key
    }
}

/// Number of distinct three-hex-digit client tokens. The client pool is
/// capped at this size so every live slot index has its own token.
pub const CLIENT_TOKEN_SPACE: usize = 0x1000;

/// Token of a local client: server token followed by three hex digits.
pub fn client_token(server_token: char, handle: ClientId) -> String {
    format!("{server_token}{:03X}", handle.index())
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

pub const DEFAULT_CHANNEL_MODES: &str = "+nt";

#[derive(Debug)]
pub struct Channel {
    pub handle: ChannelId,
    pub name: String,
    key: String,
    pub created_ts: u64,
    pub modes: String,
    pub topic: Option<String>,
    pub members: HashSet<ClientId>,
    pub bans: Vec<String>,
}

impl Channel {
    pub fn new(handle: ChannelId, name: &str, created_ts: u64) -> Self {
        Self {
            handle,
            name: name.to_owned(),
            key: irc_lower(name),
            created_ts,
            modes: DEFAULT_CHANNEL_MODES.to_owned(),
            topic: None,
            members: HashSet::new(),
            bans: Vec::new(),
        }
    }

    pub fn has_topic(&self) -> bool {
        self.topic.is_some()
    }

    /// No members and no topic: the channel should be freed.
    pub fn is_disposable(&self) -> bool {
        self.members.is_empty() && self.topic.is_none()
    }
}

impl Keyed for Channel {
    fn key(&self) -> &str {
        &self.key
    }
}

pub fn is_channel_name(name: &str) -> bool {
    name.len() > 1 && (name.starts_with('#') || name.starts_with('&'))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Lifecycle of a server entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Outbound dial in flight.
    Connecting,
    /// Socket up, PASS/SERVER exchange not finished.
    Handshaking,
    Registered,
}

#[derive(Debug)]
pub struct Server {
    pub handle: ServerId,
    pub name: String,
    key: String,
    pub status: LinkStatus,
    /// Directly connected (or self), as opposed to learned through a peer.
    pub local: bool,
    pub hops: u32,
    pub boot_ts: u64,
    pub link_ts: u64,
    pub token: char,
    /// Token of the server this one is reached through.
    pub nl_token: char,
    pub description: String,
    /// Directly linked peer a transitive server was learned from.
    pub uplink: Option<ServerId>,
    pub tx: Option<Outbound>,
    pub last_seen: Instant,
    pub pinged: bool,
    /// The peer's own burst has been received and committed.
    pub burst_complete: bool,
}

impl Server {
    /// The entry representing this daemon.
    pub fn myself(handle: ServerId, name: &str, token: char, description: &str, boot_ts: u64) -> Self {
        Self {
            handle,
            name: name.to_owned(),
            key: irc_lower(name),
            status: LinkStatus::Registered,
            local: true,
            hops: 0,
            boot_ts,
            link_ts: boot_ts,
            token,
            nl_token: token,
            description: description.to_owned(),
            uplink: None,
            tx: None,
            last_seen: Instant::now(),
            pinged: false,
            burst_complete: true,
        }
    }

    /// A directly connected peer whose name may not be known yet.
    pub fn peer(handle: ServerId, name: &str, status: LinkStatus, nl_token: char) -> Self {
        Self {
            handle,
            name: name.to_owned(),
            key: irc_lower(name),
            status,
            local: true,
            hops: 1,
            boot_ts: 0,
            link_ts: 0,
            token: '?',
            nl_token,
            description: String::new(),
            uplink: None,
            tx: None,
            last_seen: Instant::now(),
            pinged: false,
            burst_complete: false,
        }
    }

    /// A server learned transitively through `uplink`.
    pub fn transitive(handle: ServerId, name: &str, uplink: ServerId) -> Self {
        Self {
            local: false,
            status: LinkStatus::Registered,
            uplink: Some(uplink),
            burst_complete: true,
            ..Self::peer(handle, name, LinkStatus::Registered, '?')
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
        self.key = irc_lower(name);
    }

    pub fn is_registered(&self) -> bool {
        self.status == LinkStatus::Registered
    }

    pub fn send(&self, line: &Bytes) -> Delivery {
        deliver(self.tx.as_ref(), line)
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.pinged = false;
    }
}

impl Keyed for Server {
    fn key(&self) -> &str {
        &self.key
    }
}
