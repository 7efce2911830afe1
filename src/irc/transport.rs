//! Link transport: listener binding, address resolution and dialing.
//!
//! Server links are plain TCP. A configured peer address is either a literal
//! IP or a hostname; hostnames resolve through the system resolver and every
//! returned address is tried in order until one connects.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Bind every address in `addrs`. Fails on the first address that cannot be
/// bound; a daemon missing one of its ports should not start.
pub async fn bind_all(addrs: &[String]) -> io::Result<Vec<TcpListener>> {
    let mut listeners = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let listener = TcpListener::bind(addr.as_str()).await.map_err(|e| {
            io::Error::new(e.kind(), format!("binding {addr}: {e}"))
        })?;
        info!(%addr, "transport: listening");
        listeners.push(listener);
    }
    Ok(listeners)
}

/// Resolve `address:port` to candidate socket addresses.
pub async fn resolve(address: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    if let Ok(ip) = address.trim_matches(['[', ']']).parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let addrs: Vec<SocketAddr> = lookup_host((address, port)).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{address} resolved to no addresses"),
        ));
    }
    Ok(addrs)
}

/// Dial a peer, giving up after `timeout` overall.
pub async fn connect(address: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let attempt = async {
        let mut last_err = None;
        for addr in resolve(address, port).await? {
            debug!(%addr, "transport: connecting via TCP");
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(%addr, "transport: connect failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected)))
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connecting to {address}:{port}")))?
}

/// Textual peer IP, with IPv4-mapped IPv6 addresses unwrapped.
pub fn peer_ip(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        ip => ip.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ip_unwraps_mapped_v4() {
        let addr: SocketAddr = "[::ffff:10.0.0.5]:4400".parse().unwrap();
        assert_eq!(peer_ip(&addr), "10.0.0.5");
        let addr: SocketAddr = "[2001:db8::1]:4400".parse().unwrap();
        assert_eq!(peer_ip(&addr), "2001:db8::1");
        let addr: SocketAddr = "127.0.0.1:6667".parse().unwrap();
        assert_eq!(peer_ip(&addr), "127.0.0.1");
    }

    #[tokio::test]
    async fn resolve_literal_addresses_without_dns() {
        assert_eq!(
            resolve("10.1.2.3", 4400).await.unwrap(),
            vec!["10.1.2.3:4400".parse::<SocketAddr>().unwrap()]
        );
        assert_eq!(
            resolve("[::1]", 4400).await.unwrap(),
            vec!["[::1]:4400".parse::<SocketAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn connect_reaches_local_listener() {
        let listeners = bind_all(&["127.0.0.1:0".to_owned()]).await.unwrap();
        let port = listeners[0].local_addr().unwrap().port();
        let stream = connect("127.0.0.1", port, Duration::from_secs(5)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn connect_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(connect("127.0.0.1", port, Duration::from_secs(5)).await.is_err());
    }
}
