//! Server federation: configured peers, link handshake and event relay.
//!
//! Each configured peer is a [`RemoteServerConfig`]. The reconciler dials
//! every peer that has no server entry yet, inserting a provisional entry
//! first so a second pass never dials twice. Inbound links are accepted only
//! when the peer's `SERVER` name and `PASS` secret match a configured entry.
//!
//! Handshake, in both directions:
//!
//! ```text
//! PASS :<secret>
//! SERVER <name> 1 <bootTs> <linkTs> J10 <token> :<description>
//! ```
//!
//! Once both sides agree, each sends its netburst. After `EB`, the link
//! carries live events, each led by the token of the client or server that
//! caused it:
//!
//! ```text
//! <clientToken> Q :<reason>            quit
//! <clientToken> N <newnick> <ts>       nick change
//! <clientToken> J <channel> <ts>       join
//! <clientToken> L <channel> :<reason>  part
//! <clientToken> P <target> :<text>     privmsg
//! <clientToken> O <target> :<text>     notice
//! <clientToken> T <channel> :<topic>   topic
//! <serverToken> SQ <name> :<reason>    server split
//! <serverToken> G :<arg>               ping
//! <serverToken> Z :<arg>               pong
//! ```
//!
//! New servers and clients are announced with their burst line forms.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::broadcast;
use super::codec::{CodecError, IrcCodec};
use super::config::DEFAULT_LINK_PORT;
use super::entity::{
    irc_lower, is_channel_name, unix_now, ClientId, LinkStatus, Server, ServerId,
    SEND_QUEUE_DEPTH,
};
use super::message::{line, Message};
use super::netburst::{self, BurstError, BurstReceiver, BurstRecord};
use super::pool::{Keyed, PoolError};
use super::state::{Propagate, ServerState, SharedState};
use super::transport;

fn default_link_port() -> u16 {
    DEFAULT_LINK_PORT
}

/// One configured peer server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    pub name: String,
    pub address: String,
    #[serde(default = "default_link_port")]
    pub port: u16,
    pub secret: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("access denied for {name:?}")]
    AuthRejected { name: String },
    #[error("{name} is already linked")]
    AlreadyLinked { name: String },
    #[error("a link to {name} is already in progress")]
    DuplicateConnection { name: String },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("handshake timed out")]
    Timeout,
    #[error("link closed by peer")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Burst(#[from] BurstError),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The configured peers, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct FederationRegistry {
    remotes: Vec<RemoteServerConfig>,
}

impl FederationRegistry {
    pub fn new(remotes: Vec<RemoteServerConfig>) -> Self {
        Self { remotes }
    }

    pub fn remotes(&self) -> &[RemoteServerConfig] {
        &self.remotes
    }

    /// Whether an inbound link claiming `name` with `secret` may proceed.
    pub fn accept_inbound(&self, name: &str, secret: &str) -> bool {
        self.authenticate(name, secret).is_ok()
    }

    /// Exact match on both name and secret.
    pub fn authenticate(&self, name: &str, secret: &str) -> Result<&RemoteServerConfig, FederationError> {
        self.remotes
            .iter()
            .find(|r| r.name == name && r.secret == secret)
            .ok_or_else(|| FederationError::AuthRejected { name: name.to_owned() })
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// A dial the reconciler wants made. `server` is the provisional entry.
#[derive(Debug, Clone)]
pub struct DialRequest {
    pub server: ServerId,
    pub remote: RemoteServerConfig,
}

/// Starts outbound links. Called with the state lock held; must not block.
pub trait Dialer: Send + Sync {
    fn dial(&self, request: DialRequest);
}

/// Dials over TCP on a spawned task.
#[derive(Clone)]
pub struct TcpDialer {
    state: SharedState,
}

impl TcpDialer {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, request: DialRequest) {
        tokio::spawn(outbound_link(self.state.clone(), request));
    }
}

/// Dial every configured peer without a server entry. Returns the names
/// dialed. A second call before any link completes dials nothing.
pub fn reconcile(state: &mut ServerState, dialer: &dyn Dialer) -> Vec<String> {
    let mut dialed = Vec::new();
    let remotes = state.registry.remotes().to_vec();
    for remote in remotes {
        if irc_lower(&remote.name) == irc_lower(state.name()) {
            continue;
        }
        if state.find_server(&remote.name).is_some() {
            let skipped = FederationError::DuplicateConnection { name: remote.name.clone() };
            debug!(peer = %remote.name, "federation: {skipped}");
            continue;
        }
        let nl_token = state.token();
        let server = match state
            .servers
            .create_with(|h| Server::peer(h, &remote.name, LinkStatus::Connecting, nl_token))
        {
            Ok(h) => h,
            Err(e) => {
                warn!(peer = %remote.name, "federation: cannot allocate link: {e}");
                break;
            }
        };
        super::metrics::link_dial_attempt(&remote.name);
        info!(peer = %remote.name, address = %remote.address, port = remote.port, "federation: dialing");
        dialed.push(remote.name.clone());
        dialer.dial(DialRequest { server, remote });
    }
    dialed
}

/// Run [`reconcile`] every `period`, starting immediately.
pub fn spawn_reconciler(state: SharedState, dialer: Arc<dyn Dialer>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let mut st = state.write().await;
            let dialed = reconcile(&mut st, dialer.as_ref());
            if !dialed.is_empty() {
                debug!(count = dialed.len(), "federation: reconcile pass started dials");
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// What a peer announced in its PASS/SERVER pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHello {
    pub secret: String,
    pub name: String,
    pub boot_ts: u64,
    pub link_ts: u64,
    pub token: char,
    pub description: String,
}

impl PeerHello {
    /// Parse a `SERVER` message, given the secret from the preceding `PASS`.
    pub fn parse(secret: String, msg: &Message) -> Result<Self, FederationError> {
        let bad = || FederationError::Handshake(format!("malformed SERVER line {:?}", msg.to_wire()));
        if msg.command != "SERVER" || msg.params.len() < 7 {
            return Err(bad());
        }
        let mut token = msg.params[5].chars();
        let token = match (token.next(), token.next()) {
            (Some(c), None) => c,
            _ => return Err(bad()),
        };
        Ok(Self {
            secret,
            name: msg.params[0].clone(),
            boot_ts: msg.params[2].parse().map_err(|_| bad())?,
            link_ts: msg.params[3].parse().map_err(|_| bad())?,
            token,
            description: msg.params[6].clone(),
        })
    }
}

/// Our half of the handshake.
pub fn hello_lines(state: &ServerState, secret: &str) -> [Message; 2] {
    [
        Message::new("PASS", vec![secret.to_owned()]),
        Message::new(
            "SERVER",
            vec![
                state.name().to_owned(),
                "1".into(),
                state.created_ts.to_string(),
                unix_now().to_string(),
                netburst::PROTOCOL.into(),
                state.token().to_string(),
                state.config.description.clone(),
            ],
        ),
    ]
}

async fn read_hello(framed: &mut Framed<TcpStream, IrcCodec>) -> Result<PeerHello, FederationError> {
    let mut secret = None;
    while let Some(frame) = framed.next().await {
        let msg = frame?;
        match msg.command.as_str() {
            "PASS" => secret = Some(msg.param(0).to_owned()),
            "SERVER" => {
                let secret = secret.take().ok_or_else(|| {
                    FederationError::Handshake("SERVER before PASS".into())
                })?;
                return PeerHello::parse(secret, &msg);
            }
            "ERROR" => return Err(FederationError::Handshake(msg.param(0).to_owned())),
            other => debug!(command = other, "federation: ignored before handshake"),
        }
    }
    Err(FederationError::Closed)
}

/// Promote `id` to a registered peer, announce it to the other links and
/// render its burst. Runs under the write lock.
///
/// When both sides dial at once, the link started by the server with the
/// lower name survives on both ends.
pub fn register_peer(
    state: &mut ServerState,
    id: ServerId,
    hello: &PeerHello,
    outbound: bool,
    tx: mpsc::Sender<Bytes>,
) -> Result<Vec<Bytes>, FederationError> {
    if irc_lower(&hello.name) == irc_lower(state.name()) {
        return Err(FederationError::Handshake("peer claims our name".into()));
    }
    let key = irc_lower(&hello.name);
    let other = state
        .servers
        .iter()
        .find(|(h, s)| *h != id && s.key() == key)
        .map(|(_, s)| s);
    if let Some(other) = other {
        if other.is_registered() {
            return Err(FederationError::AlreadyLinked { name: hello.name.clone() });
        }
        let we_are_lower = irc_lower(state.name()) < irc_lower(&hello.name);
        if outbound != we_are_lower {
            return Err(FederationError::DuplicateConnection { name: hello.name.clone() });
        }
    }
    if hello.token == state.token() || state.find_server_by_token(hello.token).is_some_and(|o| o != id) {
        return Err(FederationError::Handshake(format!("token {} already in use", hello.token)));
    }

    let server = state.servers.get_mut(id)?;
    server.set_name(&hello.name);
    server.status = LinkStatus::Registered;
    server.hops = 1;
    server.boot_ts = hello.boot_ts;
    server.link_ts = unix_now();
    server.token = hello.token;
    server.description = hello.description.clone();
    server.tx = Some(tx);
    server.touch();

    let announce = netburst::server_line(state.servers.get(id)?);
    broadcast::broadcast_to_servers(state, Some(id), &announce);

    info!(peer = %hello.name, token = %hello.token, outbound, "federation: link registered");
    Ok(netburst::snapshot(state, id))
}

// ---------------------------------------------------------------------------
// Link tasks
// ---------------------------------------------------------------------------

/// Accept inbound server links until the listener fails.
pub async fn accept_servers(listener: TcpListener, state: SharedState) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                tokio::spawn(inbound_link(socket, addr, state.clone()));
            }
            Err(e) => warn!("federation: accept failed: {e}"),
        }
    }
}

async fn inbound_link(socket: TcpStream, addr: SocketAddr, state: SharedState) {
    let (id, timeout) = {
        let mut st = state.write().await;
        st.counters.increment(super::counters::Stat::TotalConns);
        st.counters.publish();
        let nl_token = st.token();
        match st
            .servers
            .create_with(|h| Server::peer(h, "", LinkStatus::Handshaking, nl_token))
        {
            Ok(id) => (id, st.config.timings.link_timeout),
            Err(e) => {
                warn!(%addr, "federation: cannot allocate inbound link: {e}");
                return;
            }
        }
    };
    info!(%addr, "federation: inbound link");

    let mut framed = Framed::new(socket, IrcCodec::server());
    let result = inbound_handshake(&mut framed, &state, id, timeout).await;
    finish_link(framed, state, id, result).await;
}

async fn inbound_handshake(
    framed: &mut Framed<TcpStream, IrcCodec>,
    state: &SharedState,
    id: ServerId,
    timeout: Duration,
) -> Result<LinkReady, FederationError> {
    let hello = tokio::time::timeout(timeout, read_hello(framed))
        .await
        .map_err(|_| FederationError::Timeout)??;

    let auth = state
        .read()
        .await
        .registry
        .authenticate(&hello.name, &hello.secret)
        .map(|remote| remote.secret.clone());
    let secret = match auth {
        Ok(secret) => secret,
        Err(e) => {
            super::metrics::link_rejected(&hello.name);
            warn!(peer = %hello.name, "federation: inbound link rejected");
            let _ = framed.send(Message::new("ERROR", vec!["Access denied".into()])).await;
            return Err(e);
        }
    };

    let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    let burst = {
        let mut st = state.write().await;
        let ours = hello_lines(&st, &secret);
        let burst = register_peer(&mut st, id, &hello, false, tx)?;
        drop(st);
        for msg in ours {
            framed.send(msg).await?;
        }
        burst
    };
    Ok(LinkReady { name: hello.name, burst, rx })
}

/// Dial a configured peer and run the link.
pub async fn outbound_link(state: SharedState, request: DialRequest) {
    let DialRequest { server: id, remote } = request;
    let timeout = state.read().await.config.timings.link_timeout;

    let socket = match transport::connect(&remote.address, remote.port, timeout).await {
        Ok(s) => s,
        Err(e) => {
            warn!(peer = %remote.name, "federation: failed to connect: {e}");
            let mut st = state.write().await;
            if let Err(e) = st.drop_server(id, "connect failed") {
                debug!(peer = %remote.name, "federation: provisional entry already gone: {e}");
            }
            return;
        }
    };
    info!(peer = %remote.name, "federation: TCP connected");

    let mut framed = Framed::new(socket, IrcCodec::server());
    let result = outbound_handshake(&mut framed, &state, id, &remote, timeout).await;
    finish_link(framed, state, id, result).await;
}

async fn outbound_handshake(
    framed: &mut Framed<TcpStream, IrcCodec>,
    state: &SharedState,
    id: ServerId,
    remote: &RemoteServerConfig,
    timeout: Duration,
) -> Result<LinkReady, FederationError> {
    let ours = {
        let mut st = state.write().await;
        let server = st.servers.get_mut(id)?;
        server.status = LinkStatus::Handshaking;
        server.touch();
        hello_lines(&st, &remote.secret)
    };
    for msg in ours {
        framed.send(msg).await?;
    }

    let hello = tokio::time::timeout(timeout, read_hello(framed))
        .await
        .map_err(|_| FederationError::Timeout)??;
    if hello.name != remote.name || hello.secret != remote.secret {
        super::metrics::link_rejected(&remote.name);
        warn!(peer = %remote.name, claimed = %hello.name, "federation: outbound link rejected");
        let _ = framed.send(Message::new("ERROR", vec!["Access denied".into()])).await;
        return Err(FederationError::AuthRejected { name: hello.name });
    }

    let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    let mut st = state.write().await;
    let burst = register_peer(&mut st, id, &hello, true, tx)?;
    Ok(LinkReady { name: hello.name, burst, rx })
}

/// A registered link, ready to burst.
struct LinkReady {
    name: String,
    burst: Vec<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

async fn finish_link<T>(
    framed: Framed<T, IrcCodec>,
    state: SharedState,
    id: ServerId,
    ready: Result<LinkReady, FederationError>,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let reason = match ready {
        Ok(ready) => {
            let name = ready.name.clone();
            match run_link(framed, &state, id, ready).await {
                Ok(()) => "link closed".to_owned(),
                Err(e) => {
                    warn!(peer = %name, "federation: link lost: {e}");
                    e.to_string()
                }
            }
        }
        Err(e) => {
            warn!("federation: handshake failed: {e}");
            e.to_string()
        }
    };

    let mut st = state.write().await;
    if st.servers.contains(id) {
        if let Err(e) = st.drop_server(id, &reason) {
            warn!("federation: teardown failed: {e}");
        }
    }
}

/// Stream our burst then relay queued lines, while applying the peer's.
async fn run_link<T>(
    framed: Framed<T, IrcCodec>,
    state: &SharedState,
    id: ServerId,
    ready: LinkReady,
) -> Result<(), FederationError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let LinkReady { name, burst, mut rx } = ready;
    let (mut sink, mut stream) = framed.split::<Bytes>();

    let writer = async {
        let sent = netburst::stream(&mut sink, burst).await;
        super::metrics::burst_outcome(&name, sent.is_ok());
        let sent = sent?;
        debug!(peer = %name, lines = sent, "federation: burst sent");
        while let Some(l) = rx.recv().await {
            sink.send(l).await?;
        }
        Ok::<(), FederationError>(())
    };

    let reader = async {
        let mut receiver = Some(BurstReceiver::new(id));
        while let Some(frame) = stream.next().await {
            let msg = frame?;
            let mut st = state.write().await;
            st.servers.get_mut(id)?.touch();
            if let Some(staging) = receiver.as_mut() {
                match BurstRecord::parse(&msg)? {
                    Some(record) => {
                        if staging.stage(record) {
                            if let Some(done) = receiver.take() {
                                done.commit(&mut st)?;
                            }
                        }
                        continue;
                    }
                    None if is_ping(&msg) => {}
                    None => {
                        debug!(peer = %name, line = %msg, "federation: non-burst line before EB ignored");
                        continue;
                    }
                }
            }
            if apply_link_line(&mut st, id, &msg)? == Flow::Close {
                return Ok(());
            }
        }
        Err::<(), FederationError>(FederationError::Closed)
    };

    tokio::select! {
        r = writer => r,
        r = reader => r,
    }
}

fn is_ping(msg: &Message) -> bool {
    matches!(msg.param(0), "G" | "Z") || msg.command == "ERROR"
}

// ---------------------------------------------------------------------------
// Live events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Apply one post-burst line received from `peer` and relay it onward.
pub fn apply_link_line(state: &mut ServerState, peer: ServerId, msg: &Message) -> Result<Flow, FederationError> {
    if msg.command == "ERROR" {
        info!(error = msg.param(0), "federation: peer closed link");
        return Ok(Flow::Close);
    }
    let relay = msg.to_line();

    if let Some(record) = BurstRecord::parse(msg)? {
        match record {
            BurstRecord::Server(record) => {
                if netburst::apply_server(state, peer, &record)? {
                    if let Some(id) = state.find_server(&record.name) {
                        let announce = netburst::server_line(state.servers.get(id)?);
                        broadcast::broadcast_to_servers(state, Some(peer), &announce);
                    }
                }
            }
            BurstRecord::Client(record) => {
                if netburst::apply_client(state, peer, &record)? {
                    broadcast::broadcast_to_servers(state, Some(peer), &relay);
                }
            }
            BurstRecord::Channel(record) => {
                netburst::apply_channel(state, &record)?;
            }
            BurstRecord::End => debug!("federation: stray EB"),
        }
        return Ok(Flow::Continue);
    }

    let origin = msg.command.as_str();
    match msg.param(0) {
        "G" => {
            let pong = line(format!("{} Z :{}", state.token(), msg.param(1)));
            state.send_to_server(peer, &pong)?;
        }
        "Z" => {}
        "SQ" => {
            let name = msg.param(1);
            match state.find_server(name) {
                Some(id) if id != state.me && state.link_of(id) == Some(peer) => {
                    state.drop_server(id, msg.param(2))?;
                }
                _ => debug!(server = name, "federation: SQ for server not behind this link"),
            }
        }
        verb => {
            let Some(client) = state.find_client_by_token(origin) else {
                debug!(origin, verb, "federation: event from unknown origin");
                return Ok(Flow::Continue);
            };
            apply_client_event(state, peer, client, verb, msg, &relay)?;
        }
    }
    Ok(Flow::Continue)
}

fn apply_client_event(
    state: &mut ServerState,
    peer: ServerId,
    client: ClientId,
    verb: &str,
    msg: &Message,
    relay: &Bytes,
) -> Result<(), FederationError> {
    let prefix = state.clients.get(client)?.prefix();
    let arg = msg.param(1);
    match verb {
        "Q" => {
            state.kill_client(client, arg, Propagate::ToServers { except: Some(peer) })?;
            return Ok(());
        }
        "N" => {
            if state.find_nick(arg).is_some_and(|other| other != client) {
                warn!(nick = arg, "federation: remote nick change collides, ignored");
                return Ok(());
            }
            let notice = Message::with_prefix(&prefix, "NICK", vec![arg.to_owned()]).to_line();
            broadcast::broadcast_to_channels_of(state, client, &notice, false)?;
            state.clients.get_mut(client)?.set_nick(arg);
        }
        "J" if is_channel_name(arg) => {
            let (ch, added) = match msg.param(2).parse::<u64>() {
                Ok(ts) => state.join_channel_at(client, arg, ts)?,
                Err(_) => state.join_channel(client, arg)?,
            };
            if added {
                let join = Message::with_prefix(&prefix, "JOIN", vec![arg.to_owned()]).to_line();
                broadcast::broadcast_to_channel(state, ch, Some(client), &join)?;
            }
        }
        "L" => {
            if let Some(ch) = state.find_channel(arg) {
                let part = Message::with_prefix(&prefix, "PART", vec![arg.to_owned(), msg.param(2).to_owned()])
                    .to_line();
                broadcast::broadcast_to_channel(state, ch, Some(client), &part)?;
                state.part_channel(client, ch)?;
            }
        }
        "P" | "O" => {
            let command = if verb == "P" { "PRIVMSG" } else { "NOTICE" };
            let text = Message::with_prefix(&prefix, command, vec![arg.to_owned(), msg.param(2).to_owned()])
                .to_line();
            if is_channel_name(arg) {
                if let Some(ch) = state.find_channel(arg) {
                    broadcast::broadcast_to_channel(state, ch, Some(client), &text)?;
                }
            } else if let Some(target) = state.find_nick(arg) {
                let target = state.clients.get(target)?;
                if target.is_local() {
                    target.send(&text);
                    return Ok(());
                }
            }
        }
        "T" => {
            if let Some(ch) = state.find_channel(arg) {
                let topic = msg.param(2);
                let change = Message::with_prefix(&prefix, "TOPIC", vec![arg.to_owned(), topic.to_owned()])
                    .to_line();
                broadcast::broadcast_to_channel(state, ch, None, &change)?;
                state.channels.get_mut(ch)?.topic = (!topic.is_empty()).then(|| topic.to_owned());
                if state.channels.get(ch)?.is_disposable() {
                    state.free_channel(ch)?;
                }
            }
        }
        other => {
            debug!(verb = other, "federation: unknown link verb");
            return Ok(());
        }
    }
    broadcast::broadcast_to_servers(state, Some(peer), relay);
    Ok(())
}
