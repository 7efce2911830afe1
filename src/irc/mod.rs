//! IRC daemon: client sessions, server links and the shared network state.

pub mod broadcast;
pub mod codec;
pub mod commands;
pub mod config;
pub mod counters;
pub mod entity;
pub mod federation;
pub mod housekeeping;
pub mod message;
pub mod metrics;
pub mod netburst;
pub mod pool;
pub mod server;
pub mod state;
pub mod transport;
