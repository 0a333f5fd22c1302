//! Error types for ferrissh-mux.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::channel::BufferError;
use crate::halt::ShutdownCause;

/// Main error type for ferrissh-mux operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The client configuration is incomplete or malformed
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// SSH transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel operation errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Handler registration and forwarding errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Configuration errors, reported before any network I/O.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No host key callback was configured
    #[error("must specify a host key callback")]
    MissingHostKeyCallback,

    /// No halter was configured
    #[error("config must provide a halter")]
    MissingHalter,

    /// The client version string cannot be sent as an SSH identification line
    #[error("invalid client version '{version}': {reason}")]
    InvalidClientVersion { version: String, reason: &'static str },

    /// The dial address could not be resolved for the requested network
    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },
}

/// Transport layer errors (SSH connection, handshake, authentication).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to connect to host
    #[error("Connection failed to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Version exchange, key exchange or host key verification failed
    #[error("handshake failed: {0}")]
    Handshake(#[source] HandshakeError),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// SSH key error
    #[error("SSH key error: {0}")]
    Key(String),

    /// SSH protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// The connection attempt was abandoned because a shutdown signal fired
    #[error("Connection cancelled: {0}")]
    Cancelled(ShutdownCause),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures during the cryptographic handshake.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The host key callback rejected the server's key
    #[error("host key rejected: {0}")]
    HostKey(#[from] HostKeyError),

    /// Version exchange or key exchange failed inside the SSH engine
    #[error("{0}")]
    Ssh(russh::Error),
}

/// Host key verification errors.
#[derive(Error, Debug)]
pub enum HostKeyError {
    /// A fixed host key policy was used without a key
    #[error("required host key was nil")]
    NoFixedKey,

    /// The offered key differs from the configured one
    #[error("host key mismatch for {host}")]
    Mismatch { host: String },

    /// Host not present in known_hosts (strict mode)
    #[error("Host key for {host}:{port} not found in known_hosts")]
    Unknown { host: String, port: u16 },

    /// Host present in known_hosts with a different key
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    Changed { host: String, port: u16, line: usize },

    /// Reading or writing known_hosts failed
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// The signature blob is malformed or carries trailing data
    #[error("signature parse error")]
    SignatureParse,

    /// The signature does not verify against the host key
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// The key could not be encoded for comparison
    #[error("key encoding error: {0}")]
    Encoding(String),
}

/// Channel layer errors.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The server refused to open the channel
    #[error("Failed to open channel: {0}")]
    OpenFailed(russh::Error),

    /// SSH protocol error on the channel
    #[error("Channel SSH error: {0}")]
    Ssh(russh::Error),

    /// Channel closed unexpectedly
    #[error("Channel closed")]
    Closed,

    /// Reading a channel buffer failed
    #[error("Channel read failed: {0}")]
    Buffer(#[from] BufferError),
}

/// Handler registration and forwarding errors.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Another consumer already handles this channel type
    #[error("channel type '{channel_type}' is already handled")]
    AlreadyHandled { channel_type: String },

    /// A forward for this address is already registered
    #[error("forward for {addr} already registered")]
    ForwardExists { addr: String },

    /// No forward is registered for this address
    #[error("no forward registered for {addr}")]
    ForwardNotFound { addr: String },
}

/// Result type alias using ferrissh-mux's Error.
pub type Result<T> = std::result::Result<T, Error>;
