//! shakes-daemon - shakespeerd, the NMDC hub/peer daemon core.
//!
//! Everything here runs inside one cooperative `tokio::select!` loop
//! (§5): state lives in plain `HashMap`/`Vec` owned by [`daemon::Daemon`],
//! not behind `Arc`/locks, because the daemon has exactly one writer.
//! Connections are handled by lightweight reader tasks that forward
//! raw lines over bounded channels into the loop; the loop itself
//! holds every write half directly.

pub mod bloom;
pub mod config;
pub mod control;
pub mod daemon;
pub mod hasher;
pub mod hub;
pub mod notify;
pub mod peer;
pub mod queue;
pub mod search;
pub mod share;
pub mod tth_store;

pub use daemon::Daemon;
pub use notify::Event;
