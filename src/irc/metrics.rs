//! Metric names for estuary.
//!
//! All metric name constants live here. Call sites use these constants rather
//! than raw strings to prevent typos and keep renaming centralized. No
//! exporter is installed by the daemon; the `metrics` facade is a no-op until
//! the embedding process installs a recorder.

use metrics::counter;

// ---------------------------------------------------------------------------
// Server statistics (mirrored from `Counters`)
// ---------------------------------------------------------------------------

/// Accepted connections, client and server ports (gauge).
pub const STAT_TOTAL_CONNS: &str = "estuary_connections_total";
/// Registered users network-wide (gauge).
pub const STAT_TOTAL_USERS: &str = "estuary_users_total";
/// Registered users on this server (gauge).
pub const STAT_LOCAL_USERS: &str = "estuary_users_local";
/// High-water mark of network-wide users (gauge).
pub const STAT_MAX_USERS: &str = "estuary_users_max";
/// Live channels (gauge).
pub const STAT_CHANNELS: &str = "estuary_channels_active";

// ---------------------------------------------------------------------------
// Fan-out and federation
// ---------------------------------------------------------------------------

/// Lines dropped because a recipient's send queue was full (counter).
pub const FANOUT_DROPPED: &str = "estuary_fanout_dropped_total";
/// Outbound link attempts started by the reconciler (counter).
pub const LINK_DIAL_ATTEMPT: &str = "estuary_link_dial_attempts_total";
/// Inbound or outbound links rejected during the handshake (counter).
pub const LINK_AUTH_REJECTED: &str = "estuary_link_auth_rejected_total";
/// Netbursts sent to completion (counter).
pub const BURST_SENT: &str = "estuary_burst_sent_total";
/// Netbursts abandoned because the link closed (counter).
pub const BURST_ABANDONED: &str = "estuary_burst_abandoned_total";

// ---------------------------------------------------------------------------
// Inline helpers used at call sites
// ---------------------------------------------------------------------------

/// Record a line dropped on a full recipient queue.
#[inline]
pub fn fanout_dropped() {
    counter!(FANOUT_DROPPED).increment(1);
}

/// Record the outcome of a netburst towards `peer`.
#[inline]
pub fn burst_outcome(peer: &str, completed: bool) {
    let labels = [("peer", peer.to_owned())];
    if completed {
        counter!(BURST_SENT, &labels).increment(1);
    } else {
        counter!(BURST_ABANDONED, &labels).increment(1);
    }
}

/// Record an outbound dial started by the reconciler.
#[inline]
pub fn link_dial_attempt(peer: &str) {
    counter!(LINK_DIAL_ATTEMPT, "peer" => peer.to_owned()).increment(1);
}

/// Record a link refused during the PASS/SERVER exchange.
#[inline]
pub fn link_rejected(peer: &str) {
    counter!(LINK_AUTH_REJECTED, "peer" => peer.to_owned()).increment(1);
}
