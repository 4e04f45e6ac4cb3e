// error.rs - Error types for rust-pppac
//
// Every fallible operation in the crate returns a typed result; the variants
// below follow the failure classes the daemon actually distinguishes at
// runtime (load-time parse errors, resource exhaustion, transient network
// errors, kernel programming errors, protocol errors).

use std::io;

use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the concentrator core
#[derive(Debug, Error)]
pub enum Error {
    /// Dictionary file could not be parsed; carries file and line
    #[error("dictionary {file}:{line}: {reason}")]
    Dict {
        file: String,
        line: usize,
        reason: String,
    },

    /// An attribute name has no entry in the loaded dictionary
    #[error("unknown RADIUS attribute: {0}")]
    UnknownAttribute(String),

    /// An attribute was added with a value of the wrong semantic type
    #[error("attribute {attr} is not of type {expected}")]
    AttributeType { attr: String, expected: &'static str },

    /// A packet exceeded the maximum RADIUS wire length
    #[error("packet too large: {0} bytes")]
    PacketTooLarge(usize),

    /// A received datagram failed structural validation
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// All retransmissions of a request went unanswered
    #[error("no reply from {server} after {attempts} attempts")]
    Timeout { server: String, attempts: u32 },

    /// The address pool has no free lease
    #[error("no free IP address")]
    AddressExhausted,

    /// The RADIUS server refused the session
    #[error("access rejected: {0}")]
    AccessRejected(String),

    /// A negotiation invariant was violated
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Kernel interface programming failed and policy escalates it
    #[error("interface programming failed: {0}")]
    Iface(io::Error),

    /// Configuration file errors
    #[error("config: {0}")]
    Config(String),

    /// Underlying socket or file I/O
    #[error(transparent)]
    Io(#[from] io::Error),
}
