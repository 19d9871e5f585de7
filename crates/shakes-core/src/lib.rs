//! shakes-core - wire primitives, identifiers and configuration shared
//! between every daemon subsystem.
//!
//! This crate has no dependency on networking or the filesystem beyond
//! config load/save; it is the vocabulary the daemon's state machines
//! are built from.

pub mod config;
pub mod error;
pub mod nmdc;
pub mod path;
pub mod types;

pub use config::Config;
pub use error::*;
pub use types::*;
