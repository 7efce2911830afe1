//! Client command handling.
//!
//! Runs under the state write lock. Every reply, including numerics for the
//! issuing client, goes out through the client's own queue so it stays in
//! order with channel fan-out the client is also part of.

use tracing::debug;

use super::broadcast;
use super::counters::Stat;
use super::entity::{is_channel_name, unix_now, ClientId, ClientState};
use super::message::{line, Message};
use super::pool::PoolError;
use super::state::{Propagate, ServerState};

/// Maximum nick length accepted from local clients.
pub const NICK_LEN: usize = 30;

/// What the connection task should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    Continue,
    /// The client has been torn down.
    Closed,
}

/// Send a numeric (or any server-prefixed command) to one client.
fn reply(state: &ServerState, id: ClientId, command: &str, mut params: Vec<String>) -> Result<(), PoolError> {
    let client = state.clients.get(id)?;
    let target = if client.is_registered() { client.nick.as_str() } else { "*" };
    if command.len() == 3 && command.bytes().all(|b| b.is_ascii_digit()) {
        params.insert(0, target.to_owned());
    }
    client.send(&state.reply(command, params).to_line());
    Ok(())
}

pub fn valid_nick(nick: &str) -> bool {
    let mut chars = nick.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let special = |c: char| "[]\\`_^{|}".contains(c);
    nick.len() <= NICK_LEN
        && (first.is_ascii_alphabetic() || special(first))
        && chars.all(|c| c.is_ascii_alphanumeric() || special(c) || c == '-')
}

/// Dispatch one line from a local client.
pub fn handle_client_message(state: &mut ServerState, id: ClientId, msg: &Message) -> Result<Session, PoolError> {
    state.clients.get_mut(id)?.touch();
    let registered = state.clients.get(id)?.state == ClientState::Registered;
    let command = msg.command.to_ascii_uppercase();

    match command.as_str() {
        "CAP" => {
            if msg.param(0) == "LS" {
                let client = state.clients.get(id)?;
                client.send(&state.reply("CAP", vec!["*".into(), "LS".into(), String::new()]).to_line());
            }
        }
        "PING" => {
            let pong = state.reply("PONG", vec![state.name().to_owned(), msg.param(0).to_owned()]);
            state.clients.get(id)?.send(&pong.to_line());
        }
        "PONG" => {}
        "NICK" => nick(state, id, msg)?,
        "USER" => {
            if registered {
                reply(state, id, "462", vec!["You may not reregister".into()])?;
            } else if msg.params.len() < 4 {
                reply(state, id, "461", vec!["USER".into(), "Not enough parameters".into()])?;
            } else {
                let client = state.clients.get_mut(id)?;
                client.user = msg.params[0].clone();
                client.realname = msg.params[3].clone();
                try_register(state, id)?;
            }
        }
        "QUIT" => {
            let reason = match msg.param(0) {
                "" => "Client quit".to_owned(),
                r => format!("Quit: {r}"),
            };
            state.kill_client(id, &reason, Propagate::ToServers { except: None })?;
            return Ok(Session::Closed);
        }
        _ if !registered => {
            reply(state, id, "451", vec!["You have not registered".into()])?;
        }
        "JOIN" => join(state, id, msg)?,
        "PART" => part(state, id, msg)?,
        "PRIVMSG" | "NOTICE" => message(state, id, msg, command == "NOTICE")?,
        "TOPIC" => topic(state, id, msg)?,
        "LUSERS" => lusers(state, id)?,
        other => {
            debug!(command = other, "unknown command");
            reply(state, id, "421", vec![other.to_owned(), "Unknown command".into()])?;
        }
    }
    Ok(Session::Continue)
}

fn nick(state: &mut ServerState, id: ClientId, msg: &Message) -> Result<(), PoolError> {
    let new = msg.param(0);
    if new.is_empty() {
        return reply(state, id, "431", vec!["No nickname given".into()]);
    }
    if !valid_nick(new) {
        return reply(state, id, "432", vec![new.to_owned(), "Erroneous nickname".into()]);
    }
    if state.find_nick(new).is_some_and(|other| other != id) {
        return reply(state, id, "433", vec![new.to_owned(), "Nickname is already in use".into()]);
    }

    let client = state.clients.get(id)?;
    if !client.is_registered() {
        state.clients.get_mut(id)?.set_nick(new);
        return try_register(state, id);
    }

    let change = Message::with_prefix(&client.prefix(), "NICK", vec![new.to_owned()]).to_line();
    let relay = line(format!("{} N {new} {}", client.token, unix_now()));
    broadcast::broadcast_to_channels_of(state, id, &change, true)?;
    broadcast::broadcast_to_servers(state, None, &relay);
    state.clients.get_mut(id)?.set_nick(new);
    Ok(())
}

/// Complete registration once both NICK and USER have arrived.
fn try_register(state: &mut ServerState, id: ClientId) -> Result<(), PoolError> {
    let client = state.clients.get(id)?;
    if client.nick.is_empty() || client.user.is_empty() || client.is_registered() {
        return Ok(());
    }
    if state.find_nick(&client.nick).is_some() {
        let nick = client.nick.clone();
        reply(state, id, "433", vec![nick, "Nickname is already in use".into()])?;
        state.clients.get_mut(id)?.set_nick("");
        return Ok(());
    }

    state.register_client(id)?;

    let client = state.clients.get(id)?;
    let nick = client.nick.clone();
    let prefix = client.prefix();
    let name = state.name().to_owned();
    let welcome = [
        ("001", vec![format!("Welcome to the network, {prefix}")]),
        ("002", vec![format!("Your host is {name}, running estuary-{}", env!("CARGO_PKG_VERSION"))]),
        ("003", vec![format!("This server was created at {}", state.created_ts)]),
        ("004", vec![name.clone(), format!("estuary-{}", env!("CARGO_PKG_VERSION")), "iow".into(), "nt".into()]),
        ("005", vec!["CHANTYPES=#&".into(), "CASEMAPPING=ascii".into(), format!("NICKLEN={NICK_LEN}"), "are supported by this server".into()]),
    ];
    for (numeric, params) in welcome {
        reply(state, id, numeric, params)?;
    }
    debug!(%nick, "welcome sent");
    lusers(state, id)
}

fn join(state: &mut ServerState, id: ClientId, msg: &Message) -> Result<(), PoolError> {
    if msg.params.is_empty() {
        return reply(state, id, "461", vec!["JOIN".into(), "Not enough parameters".into()]);
    }
    for name in msg.param(0).split(',').filter(|n| !n.is_empty()) {
        if !is_channel_name(name) {
            reply(state, id, "403", vec![name.to_owned(), "No such channel".into()])?;
            continue;
        }
        let (ch, added) = state.join_channel(id, name)?;
        if !added {
            continue;
        }
        let client = state.clients.get(id)?;
        let channel = state.channels.get(ch)?;
        let echo = Message::with_prefix(&client.prefix(), "JOIN", vec![channel.name.clone()]).to_line();
        let relay = line(format!("{} J {} {}", client.token, channel.name, channel.created_ts));
        broadcast::broadcast_to_channel(state, ch, None, &echo)?;
        broadcast::broadcast_to_servers(state, None, &relay);

        let channel = state.channels.get(ch)?;
        let channel_name = channel.name.clone();
        if let Some(topic) = channel.topic.clone().filter(|t| !t.is_empty()) {
            reply(state, id, "332", vec![channel_name.clone(), topic])?;
        }
        let names: Vec<String> = channel
            .members
            .iter()
            .filter_map(|m| state.clients.get(*m).ok())
            .map(|c| c.nick.clone())
            .collect();
        reply(state, id, "353", vec!["=".into(), channel_name.clone(), names.join(" ")])?;
        reply(state, id, "366", vec![channel_name, "End of /NAMES list".into()])?;
    }
    Ok(())
}

fn part(state: &mut ServerState, id: ClientId, msg: &Message) -> Result<(), PoolError> {
    if msg.params.is_empty() {
        return reply(state, id, "461", vec!["PART".into(), "Not enough parameters".into()]);
    }
    let reason = msg.param(1).to_owned();
    for name in msg.param(0).split(',').filter(|n| !n.is_empty()) {
        let Some(ch) = state.find_channel(name) else {
            reply(state, id, "403", vec![name.to_owned(), "No such channel".into()])?;
            continue;
        };
        if !state.channels.get(ch)?.members.contains(&id) {
            reply(state, id, "442", vec![name.to_owned(), "You're not on that channel".into()])?;
            continue;
        }
        let client = state.clients.get(id)?;
        let channel_name = state.channels.get(ch)?.name.clone();
        let echo = Message::with_prefix(&client.prefix(), "PART", vec![channel_name.clone(), reason.clone()]).to_line();
        let relay = line(format!("{} L {channel_name} :{reason}", client.token));
        broadcast::broadcast_to_channel(state, ch, None, &echo)?;
        broadcast::broadcast_to_servers(state, None, &relay);
        state.part_channel(id, ch)?;
    }
    Ok(())
}

fn message(state: &mut ServerState, id: ClientId, msg: &Message, notice: bool) -> Result<(), PoolError> {
    let command = if notice { "NOTICE" } else { "PRIVMSG" };
    let (target, text) = (msg.param(0), msg.param(1));
    if target.is_empty() || msg.params.len() < 2 {
        if notice {
            return Ok(());
        }
        return reply(state, id, "461", vec![command.into(), "Not enough parameters".into()]);
    }

    let client = state.clients.get(id)?;
    let out = Message::with_prefix(&client.prefix(), command, vec![target.to_owned(), text.to_owned()]).to_line();
    let relay = line(format!("{} {} {target} :{text}", client.token, if notice { "O" } else { "P" }));

    if is_channel_name(target) {
        let Some(ch) = state.find_channel(target) else {
            return if notice {
                Ok(())
            } else {
                reply(state, id, "403", vec![target.to_owned(), "No such channel".into()])
            };
        };
        broadcast::broadcast_to_channel(state, ch, Some(id), &out)?;
        broadcast::broadcast_to_servers(state, None, &relay);
        return Ok(());
    }

    match state.find_nick(target) {
        Some(to) => {
            let to = state.clients.get(to)?;
            if to.is_local() {
                to.send(&out);
            } else {
                broadcast::broadcast_to_servers(state, None, &relay);
            }
            Ok(())
        }
        None if notice => Ok(()),
        None => reply(state, id, "401", vec![target.to_owned(), "No such nick/channel".into()]),
    }
}

fn topic(state: &mut ServerState, id: ClientId, msg: &Message) -> Result<(), PoolError> {
    let name = msg.param(0);
    if name.is_empty() {
        return reply(state, id, "461", vec!["TOPIC".into(), "Not enough parameters".into()]);
    }
    let Some(ch) = state.find_channel(name) else {
        return reply(state, id, "403", vec![name.to_owned(), "No such channel".into()]);
    };
    let channel = state.channels.get(ch)?;
    let channel_name = channel.name.clone();

    if msg.params.len() < 2 {
        return match channel.topic.clone().filter(|t| !t.is_empty()) {
            Some(topic) => reply(state, id, "332", vec![channel_name, topic]),
            None => reply(state, id, "331", vec![channel_name, "No topic is set".into()]),
        };
    }
    if !channel.members.contains(&id) {
        return reply(state, id, "442", vec![channel_name, "You're not on that channel".into()]);
    }

    let text = msg.param(1).to_owned();
    let client = state.clients.get(id)?;
    let change = Message::with_prefix(&client.prefix(), "TOPIC", vec![channel_name.clone(), text.clone()]).to_line();
    let relay = line(format!("{} T {channel_name} :{text}", client.token));
    broadcast::broadcast_to_channel(state, ch, None, &change)?;
    broadcast::broadcast_to_servers(state, None, &relay);
    state.channels.get_mut(ch)?.topic = (!text.is_empty()).then_some(text);
    Ok(())
}

fn lusers(state: &ServerState, id: ClientId) -> Result<(), PoolError> {
    let c = &state.counters;
    let servers = state.servers.iter().filter(|(_, s)| s.is_registered()).count();
    let lines = [
        ("251", vec![format!(
            "There are {} users on {servers} servers",
            c.get(Stat::TotalUsers)
        )]),
        ("254", vec![c.get(Stat::Channels).to_string(), "channels formed".into()]),
        ("255", vec![format!("I have {} clients", c.get(Stat::LocalUsers))]),
        ("266", vec![
            c.get(Stat::TotalUsers).to_string(),
            c.get(Stat::MaxUsers).to_string(),
            format!("Current global users {}, max {}", c.get(Stat::TotalUsers), c.get(Stat::MaxUsers)),
        ]),
    ];
    for (numeric, params) in lines {
        reply(state, id, numeric, params)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::entity::SEND_QUEUE_DEPTH;
    use crate::irc::state::tests::{drain, linked_peer, local_client, test_state};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn send(st: &mut ServerState, id: ClientId, raw: &str) -> Session {
        handle_client_message(st, id, &Message::parse(raw).unwrap()).unwrap()
    }

    fn connect(st: &mut ServerState) -> (ClientId, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        (st.accept_client("127.0.0.1".into(), tx).unwrap(), rx)
    }

    fn numerics(lines: &[String]) -> Vec<&str> {
        lines
            .iter()
            .filter_map(|l| l.split(' ').nth(1))
            .collect()
    }

    // ── Registration ─────────────────────────────────────────────

    #[test]
    fn nick_and_user_register_with_welcome() {
        let mut st = test_state("a.test", 'A');
        let (id, mut rx) = connect(&mut st);
        send(&mut st, id, "NICK ada");
        assert!(!st.clients.get(id).unwrap().is_registered());
        send(&mut st, id, "USER ada 0 * :Ada Lovelace");

        let client = st.clients.get(id).unwrap();
        assert!(client.is_registered());
        assert_eq!(client.realname, "Ada Lovelace");
        let lines = drain(&mut rx);
        assert_eq!(
            numerics(&lines),
            vec!["001", "002", "003", "004", "005", "251", "254", "255", "266"]
        );
        assert!(lines[0].starts_with(":a.test 001 ada :Welcome"));
        assert_eq!(st.counters.get(Stat::LocalUsers), 1);
    }

    #[test]
    fn taken_nick_is_refused() {
        let mut st = test_state("a.test", 'A');
        local_client(&mut st, "ada");
        let (id, mut rx) = connect(&mut st);
        send(&mut st, id, "NICK ADA");
        assert_eq!(drain(&mut rx), vec![":a.test 433 * ADA :Nickname is already in use"]);
        send(&mut st, id, "USER x 0 * :x");
        assert!(!st.clients.get(id).unwrap().is_registered());
    }

    #[test]
    fn bad_nicks_are_rejected() {
        assert!(valid_nick("ada"));
        assert!(valid_nick("[bot]-2"));
        assert!(!valid_nick(""));
        assert!(!valid_nick("9lives"));
        assert!(!valid_nick("has space"));
        assert!(!valid_nick(&"n".repeat(NICK_LEN + 1)));
    }

    #[test]
    fn commands_before_registration_get_451() {
        let mut st = test_state("a.test", 'A');
        let (id, mut rx) = connect(&mut st);
        send(&mut st, id, "JOIN #a");
        assert_eq!(drain(&mut rx), vec![":a.test 451 * :You have not registered"]);
        assert!(st.find_channel("#a").is_none());
    }

    #[test]
    fn ping_is_answered() {
        let mut st = test_state("a.test", 'A');
        let (id, mut rx) = connect(&mut st);
        send(&mut st, id, "PING :abc");
        assert_eq!(drain(&mut rx), vec![":a.test PONG a.test :abc"]);
    }

    // ── Channels ─────────────────────────────────────────────────

    #[test]
    fn join_echoes_names_and_propagates() {
        let mut st = test_state("a.test", 'A');
        let (_peer, mut peer_rx) = linked_peer(&mut st, "b.test", 'B');
        let (ada, mut ada_rx) = local_client(&mut st, "ada");
        let (bob, mut bob_rx) = local_client(&mut st, "bob");
        send(&mut st, ada, "JOIN #river");
        drain(&mut ada_rx);
        drain(&mut peer_rx);

        send(&mut st, bob, "JOIN #river");
        let lines = drain(&mut bob_rx);
        assert_eq!(lines[0], ":bob!bob@127.0.0.1 JOIN :#river");
        assert_eq!(numerics(&lines[1..]), vec!["353", "366"]);
        assert!(lines[1].ends_with("#river :ada bob") || lines[1].ends_with("#river :bob ada"));
        assert_eq!(drain(&mut ada_rx), vec![":bob!bob@127.0.0.1 JOIN :#river"]);

        let ts = st.channels.get(st.find_channel("#river").unwrap()).unwrap().created_ts;
        let token = st.clients.get(bob).unwrap().token.clone();
        assert_eq!(drain(&mut peer_rx), vec![format!("{token} J #river {ts}")]);
    }

    #[test]
    fn part_last_member_frees_channel() {
        let mut st = test_state("a.test", 'A');
        let (ada, mut rx) = local_client(&mut st, "ada");
        send(&mut st, ada, "JOIN #tmp");
        drain(&mut rx);
        send(&mut st, ada, "PART #tmp :done");
        assert_eq!(drain(&mut rx), vec![":ada!ada@127.0.0.1 PART #tmp :done"]);
        assert!(st.find_channel("#tmp").is_none());
        assert_eq!(st.counters.get(Stat::Channels), 0);
    }

    #[test]
    fn part_errors() {
        let mut st = test_state("a.test", 'A');
        let (ada, mut rx) = local_client(&mut st, "ada");
        let (bob, _r) = local_client(&mut st, "bob");
        send(&mut st, bob, "JOIN #b");
        drain(&mut rx);
        send(&mut st, ada, "PART #nope");
        send(&mut st, ada, "PART #b");
        assert_eq!(numerics(&drain(&mut rx)), vec!["403", "442"]);
    }

    #[test]
    fn topic_set_and_query() {
        let mut st = test_state("a.test", 'A');
        let (ada, mut rx) = local_client(&mut st, "ada");
        send(&mut st, ada, "JOIN #t");
        send(&mut st, ada, "TOPIC #t");
        assert_eq!(drain(&mut rx).last().unwrap(), ":a.test 331 ada #t :No topic is set");

        send(&mut st, ada, "TOPIC #t :tides");
        send(&mut st, ada, "TOPIC #t");
        assert_eq!(
            drain(&mut rx),
            vec![":ada!ada@127.0.0.1 TOPIC #t :tides", ":a.test 332 ada #t :tides"]
        );
    }

    // ── Messages ─────────────────────────────────────────────────

    #[test]
    fn channel_message_skips_sender() {
        let mut st = test_state("a.test", 'A');
        let (ada, mut ada_rx) = local_client(&mut st, "ada");
        let (bob, mut bob_rx) = local_client(&mut st, "bob");
        send(&mut st, ada, "JOIN #x");
        send(&mut st, bob, "JOIN #x");
        drain(&mut ada_rx);
        drain(&mut bob_rx);

        send(&mut st, ada, "PRIVMSG #x :hi there");
        assert!(drain(&mut ada_rx).is_empty());
        assert_eq!(drain(&mut bob_rx), vec![":ada!ada@127.0.0.1 PRIVMSG #x :hi there"]);
    }

    #[test]
    fn private_message_and_missing_target() {
        let mut st = test_state("a.test", 'A');
        let (ada, mut ada_rx) = local_client(&mut st, "ada");
        let (_bob, mut bob_rx) = local_client(&mut st, "bob");
        send(&mut st, ada, "PRIVMSG BOB :psst");
        assert_eq!(drain(&mut bob_rx), vec![":ada!ada@127.0.0.1 PRIVMSG BOB :psst"]);

        send(&mut st, ada, "PRIVMSG ghost :boo");
        send(&mut st, ada, "NOTICE ghost :boo");
        send(&mut st, ada, "PRIVMSG");
        assert_eq!(numerics(&drain(&mut ada_rx)), vec!["401", "461"]);
    }

    #[test]
    fn message_to_remote_nick_goes_to_links() {
        let mut st = test_state("a.test", 'A');
        let (peer, mut peer_rx) = linked_peer(&mut st, "b.test", 'B');
        st.add_remote_client(|h| {
            let mut c = crate::irc::entity::Client::remote(h, peer, "remy");
            c.token = "B000".into();
            c
        })
        .unwrap();
        let (ada, _rx) = local_client(&mut st, "ada");
        drain(&mut peer_rx);
        send(&mut st, ada, "PRIVMSG remy :over there");
        let token = st.clients.get(ada).unwrap().token.clone();
        assert_eq!(drain(&mut peer_rx), vec![format!("{token} P remy :over there")]);
    }

    #[test]
    fn unknown_command_is_421() {
        let mut st = test_state("a.test", 'A');
        let (ada, mut rx) = local_client(&mut st, "ada");
        send(&mut st, ada, "FROB x");
        assert_eq!(drain(&mut rx), vec![":a.test 421 ada FROB :Unknown command"]);
    }

    // ── Nick changes and quit ────────────────────────────────────

    #[test]
    fn nick_change_reaches_channel_and_links() {
        let mut st = test_state("a.test", 'A');
        let (_peer, mut peer_rx) = linked_peer(&mut st, "b.test", 'B');
        let (ada, mut ada_rx) = local_client(&mut st, "ada");
        let (bob, mut bob_rx) = local_client(&mut st, "bob");
        send(&mut st, ada, "JOIN #x");
        send(&mut st, bob, "JOIN #x");
        drain(&mut ada_rx);
        drain(&mut bob_rx);
        drain(&mut peer_rx);

        send(&mut st, ada, "NICK ada_");
        assert_eq!(drain(&mut ada_rx), vec![":ada!ada@127.0.0.1 NICK :ada_"]);
        assert_eq!(drain(&mut bob_rx), vec![":ada!ada@127.0.0.1 NICK :ada_"]);
        assert!(drain(&mut peer_rx)[0].contains(" N ada_ "));
        assert_eq!(st.find_nick("ada_"), Some(ada));
        assert!(st.find_nick("ada").is_none());
    }

    #[test]
    fn quit_tears_down_and_reports_closed() {
        let mut st = test_state("a.test", 'A');
        let (ada, _r1) = local_client(&mut st, "ada");
        let (bob, mut bob_rx) = local_client(&mut st, "bob");
        send(&mut st, ada, "JOIN #x");
        send(&mut st, bob, "JOIN #x");
        drain(&mut bob_rx);

        assert_eq!(send(&mut st, ada, "QUIT :later"), Session::Closed);
        assert_eq!(drain(&mut bob_rx), vec![":ada!ada@127.0.0.1 QUIT :Quit: later"]);
        assert!(!st.clients.contains(ada));
        assert_eq!(st.counters.get(Stat::LocalUsers), 1);
    }
}
