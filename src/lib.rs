// rust-pppac: a PPP access concentrator core in Rust, covering IPCP option
// negotiation, RADIUS authentication, and kernel interface programming.

// This file serves as the main library entry point, exposing the core
// components and public API for the rust-pppac crate.

pub mod client;
pub mod config;
pub mod dict;
pub mod error;
pub mod iface;
pub mod ipaddr;
pub mod ipcp;
pub mod ipdb;
pub mod packet;
pub mod session;

pub use error::{Error, Result};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
