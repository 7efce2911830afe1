//! Fan-out of one prebuilt line to many recipients.
//!
//! Every recipient receives a clone of the same [`Bytes`] buffer. A full
//! queue drops the line for that recipient only; the sender never waits.

use std::collections::HashSet;

use bytes::Bytes;

use super::entity::{ChannelId, ClientId, ClientState, Delivery, ServerId};
use super::message::line;
use super::pool::PoolError;
use super::state::ServerState;

/// Tally of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fanout {
    pub queued: usize,
    pub dropped: usize,
}

impl Fanout {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Queued => self.queued += 1,
            Delivery::Dropped => {
                self.dropped += 1;
                super::metrics::fanout_dropped();
            }
            Delivery::NoLink => {}
        }
    }
}

/// Distinct clients sharing at least one channel with `origin`.
pub fn channel_peers(
    state: &ServerState,
    origin: ClientId,
    include_origin: bool,
) -> Result<HashSet<ClientId>, PoolError> {
    let client = state.clients.get(origin)?;
    let mut recipients = HashSet::new();
    for &ch in &client.channels {
        if let Ok(channel) = state.channels.get(ch) {
            recipients.extend(channel.members.iter().copied());
        }
    }
    if include_origin {
        recipients.insert(origin);
    } else {
        recipients.remove(&origin);
    }
    Ok(recipients)
}

/// Send `line` once to every local client sharing a channel with `origin`.
pub fn broadcast_to_channels_of(
    state: &ServerState,
    origin: ClientId,
    line: &Bytes,
    include_origin: bool,
) -> Result<Fanout, PoolError> {
    let mut fanout = Fanout::default();
    for id in channel_peers(state, origin, include_origin)? {
        if let Ok(client) = state.clients.get(id) {
            if id == origin || client.state != ClientState::Dead {
                fanout.record(client.send(line));
            }
        }
    }
    Ok(fanout)
}

/// `:<sender> <NNN> <text>` with the numeric zero-padded to three digits.
pub fn numeric_line(sender: &str, numeric: u16, text: &str) -> Bytes {
    line(format!(":{sender} {numeric:03} {text}"))
}

/// Numeric variant of [`broadcast_to_channels_of`]; the line is built once.
pub fn broadcast_numeric_to_channels_of(
    state: &ServerState,
    origin: ClientId,
    sender: &str,
    numeric: u16,
    text: &str,
    include_origin: bool,
) -> Result<Fanout, PoolError> {
    let shared = numeric_line(sender, numeric, text);
    broadcast_to_channels_of(state, origin, &shared, include_origin)
}

/// Send `line` to the local members of one channel.
pub fn broadcast_to_channel(
    state: &ServerState,
    channel: ChannelId,
    except: Option<ClientId>,
    line: &Bytes,
) -> Result<Fanout, PoolError> {
    let mut fanout = Fanout::default();
    for &id in &state.channels.get(channel)?.members {
        if Some(id) == except {
            continue;
        }
        if let Ok(client) = state.clients.get(id) {
            fanout.record(client.send(line));
        }
    }
    Ok(fanout)
}

/// Send `line` to every registered, directly linked server except `origin`.
///
/// Self has no link and is never a recipient.
pub fn broadcast_to_servers(state: &ServerState, origin: Option<ServerId>, line: &Bytes) -> Fanout {
    let mut fanout = Fanout::default();
    for (id, server) in state.servers.iter() {
        if Some(id) == origin || id == state.me {
            continue;
        }
        if server.is_registered() && server.local {
            fanout.record(server.send(line));
        }
    }
    fanout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::entity::{LinkStatus, Server};
    use crate::irc::state::tests::{drain, linked_peer, local_client, test_state};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    // ── Channel fan-out ──────────────────────────────────────────

    #[test]
    fn shared_channels_deliver_once() {
        let mut st = test_state("a.test", 'A');
        let (ada, mut ada_rx) = local_client(&mut st, "ada");
        let (bob, mut bob_rx) = local_client(&mut st, "bob");
        let (cy, mut cy_rx) = local_client(&mut st, "cy");
        for ch in ["#one", "#two", "#three"] {
            st.join_channel(ada, ch).unwrap();
            st.join_channel(bob, ch).unwrap();
        }
        st.join_channel(cy, "#two").unwrap();

        let msg = Bytes::from_static(b":ada NICK ada_\r\n");
        let fanout = broadcast_to_channels_of(&st, ada, &msg, false).unwrap();

        assert_eq!(fanout, Fanout { queued: 2, dropped: 0 });
        assert_eq!(drain(&mut bob_rx), vec![":ada NICK ada_"]);
        assert_eq!(drain(&mut cy_rx), vec![":ada NICK ada_"]);
        assert!(drain(&mut ada_rx).is_empty());
    }

    #[test]
    fn include_origin_adds_sender() {
        let mut st = test_state("a.test", 'A');
        let (ada, mut ada_rx) = local_client(&mut st, "ada");
        let msg = Bytes::from_static(b":ada NICK ada_\r\n");
        // Not in any channel: only the origin itself.
        let fanout = broadcast_to_channels_of(&st, ada, &msg, true).unwrap();
        assert_eq!(fanout.queued, 1);
        assert_eq!(drain(&mut ada_rx).len(), 1);
    }

    #[test]
    fn recipients_share_one_buffer() {
        let mut st = test_state("a.test", 'A');
        let (ada, _ada_rx) = local_client(&mut st, "ada");
        let (bob, mut bob_rx) = local_client(&mut st, "bob");
        st.join_channel(ada, "#x").unwrap();
        st.join_channel(bob, "#x").unwrap();

        let msg = Bytes::from(String::from(":ada PRIVMSG #x :hi\r\n"));
        broadcast_to_channels_of(&st, ada, &msg, false).unwrap();
        let got = bob_rx.try_recv().unwrap();
        assert_eq!(got.as_ptr(), msg.as_ptr());
    }

    #[test]
    fn numeric_is_zero_padded() {
        let mut st = test_state("a.test", 'A');
        let (ada, _r1) = local_client(&mut st, "ada");
        let (bob, mut bob_rx) = local_client(&mut st, "bob");
        st.join_channel(ada, "#x").unwrap();
        st.join_channel(bob, "#x").unwrap();

        broadcast_numeric_to_channels_of(&st, ada, "a.test", 5, "hello", false).unwrap();
        assert_eq!(drain(&mut bob_rx), vec![":a.test 005 hello"]);
    }

    #[test]
    fn full_queue_counts_a_drop() {
        let mut st = test_state("a.test", 'A');
        let (ada, _r1) = local_client(&mut st, "ada");
        let (tx, _slow_rx) = mpsc::channel(1);
        let slow = st.accept_client("10.0.0.9".into(), tx).unwrap();
        st.clients.get_mut(slow).unwrap().set_nick("slow");
        st.register_client(slow).unwrap();
        st.join_channel(ada, "#x").unwrap();
        st.join_channel(slow, "#x").unwrap();

        let msg = Bytes::from_static(b":ada PRIVMSG #x :1\r\n");
        broadcast_to_channel(&st, st.find_channel("#x").unwrap(), Some(ada), &msg).unwrap();
        let fanout =
            broadcast_to_channel(&st, st.find_channel("#x").unwrap(), Some(ada), &msg).unwrap();
        assert_eq!(fanout, Fanout { queued: 0, dropped: 1 });
    }

    #[test]
    fn unknown_origin_is_an_error() {
        let mut st = test_state("a.test", 'A');
        let (ada, _r) = local_client(&mut st, "ada");
        st.kill_client(ada, "bye", crate::irc::state::Propagate::No).unwrap();
        let msg = Bytes::from_static(b"x\r\n");
        assert!(broadcast_to_channels_of(&st, ada, &msg, false).is_err());
    }

    // ── Server fan-out ───────────────────────────────────────────

    #[test]
    fn servers_skip_origin_self_and_unregistered() {
        let mut st = test_state("a.test", 'A');
        let (b, mut b_rx) = linked_peer(&mut st, "b.test", 'B');
        let (_c, mut c_rx) = linked_peer(&mut st, "c.test", 'C');
        let (tx, mut pending_rx) = mpsc::channel(4);
        st.servers
            .create_with(|h| {
                let mut s = Server::peer(h, "d.test", LinkStatus::Handshaking, 'A');
                s.tx = Some(tx);
                s
            })
            .unwrap();

        let sq = Bytes::from_static(b"A SQ x.test :gone\r\n");
        let fanout = broadcast_to_servers(&st, Some(b), &sq);

        assert_eq!(fanout.queued, 1);
        assert!(drain(&mut b_rx).is_empty());
        assert_eq!(drain(&mut c_rx), vec!["A SQ x.test :gone"]);
        assert!(drain(&mut pending_rx).is_empty());
    }
}
