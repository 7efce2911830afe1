//! Daemon configuration from the environment.
//!
//! | variable | default |
//! |---|---|
//! | `ESTUARY_SERVER_NAME` | system hostname if it contains a dot, else `estuary.local` |
//! | `ESTUARY_DESCRIPTION` | `estuary chat server` |
//! | `ESTUARY_TOKEN` | `A` (one character, unique across the network) |
//! | `ESTUARY_CLIENT_BIND` | `127.0.0.1:6667` (comma-separated) |
//! | `ESTUARY_SERVER_BIND` | `127.0.0.1:4400` (comma-separated) |
//! | `ESTUARY_PEERS_FILE` | unset; JSON array of `{name, address, port, secret}` |
//! | `ESTUARY_PEERS` | unset; comma-separated `name:secret@host[:port]` |
//!
//! A peer source that is configured but yields no usable entry is a startup
//! error: a daemon that was meant to link must not silently run alone.

use std::path::Path;
use std::time::Duration;

use tracing::info;

use super::federation::RemoteServerConfig;

/// Default port for server links.
pub const DEFAULT_LINK_PORT: u16 = 4400;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing peers file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("peers were configured but none are usable")]
    EmptyRegistry,
}

/// Timer and timeout settings.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Delay before the first housekeeping sweep.
    pub sweep_delay: Duration,
    /// Period between housekeeping sweeps.
    pub sweep_period: Duration,
    /// Period between federation reconcile passes.
    pub reconnect_interval: Duration,
    /// Unregistered connections older than this are dropped.
    pub registration_timeout: Duration,
    /// Idle registered connections are sent a PING after this long.
    pub ping_after: Duration,
    /// Idle registered connections are dropped after this long.
    pub ping_timeout: Duration,
    /// Server links still dialing or handshaking after this long are dropped.
    pub link_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            sweep_delay: Duration::from_secs(10),
            sweep_period: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(30),
            registration_timeout: Duration::from_secs(60),
            ping_after: Duration::from_secs(120),
            ping_timeout: Duration::from_secs(240),
            link_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_name: String,
    pub description: String,
    pub token: char,
    pub client_bind: Vec<String>,
    pub server_bind: Vec<String>,
    pub peers: Vec<RemoteServerConfig>,
    pub timings: Timings,
}

impl Config {
    /// Minimal configuration for a named server with no peers.
    pub fn new(server_name: &str, token: char) -> Self {
        Self {
            server_name: server_name.to_owned(),
            description: "estuary chat server".into(),
            token,
            client_bind: vec!["127.0.0.1:6667".into()],
            server_bind: vec![format!("127.0.0.1:{DEFAULT_LINK_PORT}")],
            peers: Vec::new(),
            timings: Timings::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_name = lookup("ESTUARY_SERVER_NAME")
            .filter(|s| s.contains('.'))
            .or_else(|| {
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .filter(|h| h.contains('.'))
            })
            .unwrap_or_else(|| "estuary.local".into());

        let token = match lookup("ESTUARY_TOKEN") {
            None => 'A',
            Some(t) => {
                let mut chars = t.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if c.is_ascii_alphanumeric() => c,
                    _ => {
                        return Err(ConfigError::Invalid(format!(
                            "ESTUARY_TOKEN must be one alphanumeric character, got {t:?}"
                        )))
                    }
                }
            }
        };

        let mut config = Config::new(&server_name, token);
        if let Some(desc) = lookup("ESTUARY_DESCRIPTION") {
            config.description = desc;
        }
        if let Some(bind) = lookup("ESTUARY_CLIENT_BIND") {
            config.client_bind = split_list(&bind);
        }
        if let Some(bind) = lookup("ESTUARY_SERVER_BIND") {
            config.server_bind = split_list(&bind);
        }

        if let Some(path) = lookup("ESTUARY_PEERS_FILE") {
            config.peers.extend(load_peers_file(Path::new(&path))?);
        }
        if let Some(list) = lookup("ESTUARY_PEERS") {
            let parsed = parse_peer_list(&list)?;
            if parsed.is_empty() {
                return Err(ConfigError::EmptyRegistry);
            }
            config.peers.extend(parsed);
        }

        for peer in &config.peers {
            info!(peer = %peer.name, address = %peer.address, port = peer.port, "config: link peer");
        }
        Ok(config)
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Load and validate a JSON peers file.
pub fn load_peers_file(path: &Path) -> Result<Vec<RemoteServerConfig>, ConfigError> {
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let peers: Vec<RemoteServerConfig> = serde_json::from_str(&json)?;
    validate_peers(&peers)?;
    Ok(peers)
}

fn validate_peers(peers: &[RemoteServerConfig]) -> Result<(), ConfigError> {
    if peers.is_empty() {
        return Err(ConfigError::EmptyRegistry);
    }
    for peer in peers {
        if peer.name.is_empty() || peer.address.is_empty() {
            return Err(ConfigError::Invalid("peer with empty name or address".into()));
        }
        if peer.secret.is_empty() {
            return Err(ConfigError::Invalid(format!("peer {} has an empty secret", peer.name)));
        }
        if peer.port == 0 {
            return Err(ConfigError::Invalid(format!("peer {} has port 0", peer.name)));
        }
    }
    Ok(())
}

/// Parse `name:secret@host[:port]` entries, comma-separated.
fn parse_peer_list(list: &str) -> Result<Vec<RemoteServerConfig>, ConfigError> {
    let peers = split_list(list)
        .iter()
        .map(|entry| {
            parse_peer_entry(entry)
                .ok_or_else(|| ConfigError::Invalid(format!("bad peer entry {entry:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if !peers.is_empty() {
        validate_peers(&peers)?;
    }
    Ok(peers)
}

fn parse_peer_entry(entry: &str) -> Option<RemoteServerConfig> {
    let (creds, addr) = entry.rsplit_once('@')?;
    let (name, secret) = creds.split_once(':')?;
    let (address, port) = parse_host_port(addr);
    Some(RemoteServerConfig {
        name: name.to_owned(),
        address,
        port,
        secret: secret.to_owned(),
    })
}

/// Parse host:port from a string. Returns (host, port).
fn parse_host_port(s: &str) -> (String, u16) {
    // Handle IPv6 literal in brackets: [::1]:4400
    if s.starts_with('[') {
        if let Some(bracket_end) = s.find(']') {
            let host = &s[1..bracket_end];
            if let Some(port) = s[bracket_end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
            {
                return (host.to_string(), port);
            }
            return (host.to_string(), DEFAULT_LINK_PORT);
        }
    }

    // Bare IPv6 addresses contain colons too: only treat the tail as a port
    // when there is exactly one colon.
    if s.matches(':').count() == 1 {
        if let Some((host, port_str)) = s.split_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                if !host.is_empty() {
                    return (host.to_string(), port);
                }
            }
        }
    }

    (s.to_string(), DEFAULT_LINK_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    // ── Environment ──────────────────────────────────────────────

    #[test]
    fn defaults_without_variables() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.token, 'A');
        assert_eq!(config.client_bind, vec!["127.0.0.1:6667"]);
        assert_eq!(config.server_bind, vec!["127.0.0.1:4400"]);
        assert!(config.peers.is_empty());
        assert_eq!(config.timings.sweep_period, Duration::from_secs(5));
    }

    #[test]
    fn explicit_identity_and_binds() {
        let config = Config::from_lookup(lookup(&[
            ("ESTUARY_SERVER_NAME", "hub.estuary.test"),
            ("ESTUARY_TOKEN", "H"),
            ("ESTUARY_CLIENT_BIND", "0.0.0.0:6667, [::]:6667"),
        ]))
        .unwrap();
        assert_eq!(config.server_name, "hub.estuary.test");
        assert_eq!(config.token, 'H');
        assert_eq!(config.client_bind, vec!["0.0.0.0:6667", "[::]:6667"]);
    }

    #[test]
    fn rejects_multi_character_token() {
        let err = Config::from_lookup(lookup(&[("ESTUARY_TOKEN", "AB")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn inline_peers() {
        let config = Config::from_lookup(lookup(&[(
            "ESTUARY_PEERS",
            "leaf.test:hunter2@10.0.0.2:4401,edge.test:pw@[200:1::1]",
        )]))
        .unwrap();
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].name, "leaf.test");
        assert_eq!(config.peers[0].secret, "hunter2");
        assert_eq!(config.peers[0].address, "10.0.0.2");
        assert_eq!(config.peers[0].port, 4401);
        assert_eq!(config.peers[1].address, "200:1::1");
        assert_eq!(config.peers[1].port, DEFAULT_LINK_PORT);
    }

    #[test]
    fn configured_but_empty_peers_is_fatal() {
        let err = Config::from_lookup(lookup(&[("ESTUARY_PEERS", " , ")])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyRegistry));
    }

    #[test]
    fn empty_secret_is_fatal() {
        let err = Config::from_lookup(lookup(&[("ESTUARY_PEERS", "leaf.test:@10.0.0.2")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    // ── Peers file ───────────────────────────────────────────────

    /// A per-test file name under the system temp dir.
    fn temp_path(tag: &str) -> std::path::PathBuf {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("estuary-{tag}-{}-{n}.json", std::process::id()))
    }

    #[test]
    fn peers_file_roundtrip() {
        let path = temp_path("peers");
        std::fs::write(
            &path,
            r#"[{"name":"leaf.test","address":"127.0.0.1","port":4401,"secret":"s"}]"#,
        )
        .unwrap();
        let peers = load_peers_file(&path).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port, 4401);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn empty_peers_file_is_fatal() {
        let path = temp_path("peers");
        std::fs::write(&path, "[]").unwrap();
        assert!(matches!(load_peers_file(&path), Err(ConfigError::EmptyRegistry)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_peers_file_is_io_error() {
        let err = load_peers_file(Path::new("/nonexistent/estuary/peers.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    // ── host:port ────────────────────────────────────────────────

    #[test]
    fn parse_host_port_forms() {
        assert_eq!(parse_host_port("hub.test"), ("hub.test".into(), 4400));
        assert_eq!(parse_host_port("hub.test:7000"), ("hub.test".into(), 7000));
        assert_eq!(parse_host_port("[::1]:7000"), ("::1".into(), 7000));
        assert_eq!(parse_host_port("fe80::1"), ("fe80::1".into(), 4400));
    }
}
