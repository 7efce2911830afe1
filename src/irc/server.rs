//! Daemon entry point and the per-client connection task.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::IrcCodec;
use super::commands::{self, Session};
use super::config::Config;
use super::entity::{ClientId, SEND_QUEUE_DEPTH};
use super::federation::{self, TcpDialer};
use super::housekeeping::{self, IdleTimeout};
use super::message::line;
use super::state::{Propagate, ServerState, SharedState};
use super::transport;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A running daemon: its state and the addresses it actually bound.
pub struct Daemon {
    pub state: SharedState,
    pub client_addrs: Vec<SocketAddr>,
    pub server_addrs: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Bind every listener and start all background tasks.
    pub async fn start(config: Config) -> Result<Self, BoxError> {
        // Bind everything first so a port conflict fails before any task runs.
        let client_listeners = transport::bind_all(&config.client_bind).await?;
        let server_listeners = transport::bind_all(&config.server_bind).await?;

        let timings = config.timings.clone();
        let state = ServerState::new(config)?.into_shared();
        info!(server = %state.read().await.name(), "estuary starting");

        let mut client_addrs = Vec::new();
        let mut server_addrs = Vec::new();
        let mut tasks = Vec::new();

        for listener in client_listeners {
            client_addrs.push(listener.local_addr()?);
            tasks.push(tokio::spawn(accept_clients(listener, Arc::clone(&state))));
        }
        for listener in server_listeners {
            server_addrs.push(listener.local_addr()?);
            tasks.push(tokio::spawn(federation::accept_servers(listener, Arc::clone(&state))));
        }

        tasks.push(housekeeping::spawn(
            Arc::clone(&state),
            Arc::new(IdleTimeout::from_timings(&timings)),
            timings.sweep_delay,
            timings.sweep_period,
        ));
        tasks.push(federation::spawn_reconciler(
            Arc::clone(&state),
            Arc::new(TcpDialer::new(Arc::clone(&state))),
            timings.reconnect_interval,
        ));

        Ok(Self {
            state,
            client_addrs,
            server_addrs,
            tasks,
        })
    }

    /// Wait until any background task ends (they should not).
    pub async fn wait(self) -> Result<(), BoxError> {
        let (result, _, rest) = futures::future::select_all(self.tasks).await;
        for task in rest {
            task.abort();
        }
        result?;
        Err("a daemon task exited".into())
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Run the daemon until it fails.
pub async fn run(config: Config) -> Result<(), BoxError> {
    Daemon::start(config).await?.wait().await
}

/// Accept loop for one client listener.
async fn accept_clients(listener: TcpListener, state: SharedState) {
    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        debug!(%addr, "new connection");
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, addr, state).await {
                warn!(%addr, "client error: {e}");
            }
            debug!(%addr, "disconnected");
        });
    }
}

/// Handle a single client connection.
async fn handle_client(socket: TcpStream, addr: SocketAddr, state: SharedState) -> Result<(), BoxError> {
    let mut framed = Framed::new(socket, IrcCodec::client());
    let (tx, rx) = mpsc::channel::<Bytes>(SEND_QUEUE_DEPTH);

    let accepted = state.write().await.accept_client(transport::peer_ip(&addr), tx);
    let id = match accepted {
        Ok(id) => id,
        Err(e) => {
            framed.send(line("ERROR :Closing link (server full)".into())).await?;
            return Err(e.into());
        }
    };
    let result = client_session(&mut framed, rx, id, &state).await;

    // Clean up on disconnect. A client killed elsewhere is already gone.
    let reason = match &result {
        Ok(()) => "Connection closed".to_owned(),
        Err(e) => format!("Read error: {e}"),
    };
    let mut st = state.write().await;
    if st.clients.contains(id) {
        st.kill_client(id, &reason, Propagate::ToServers { except: None })?;
    }
    result
}

async fn client_session(
    framed: &mut Framed<TcpStream, IrcCodec>,
    mut rx: mpsc::Receiver<Bytes>,
    id: ClientId,
    state: &SharedState,
) -> Result<(), BoxError> {
    loop {
        tokio::select! {
            // Incoming message from the client's TCP stream.
            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                };
                let session = {
                    let mut st = state.write().await;
                    commands::handle_client_message(&mut st, id, &msg)?
                };
                if session == Session::Closed {
                    // Flush what was queued before teardown, ERROR included.
                    while let Ok(line) = rx.try_recv() {
                        framed.send(line).await?;
                    }
                    return Ok(());
                }
            }

            // Outgoing lines from fan-out and our own replies.
            line = rx.recv() => match line {
                Some(line) => framed.send(line).await?,
                // Sender dropped: the client was killed elsewhere.
                None => return Ok(()),
            },
        }
    }
}
