//! # ferrissh-mux
//!
//! Async SSH client transport and connection multiplexer.
//!
//! ferrissh-mux establishes an authenticated connection over russh, checks
//! the server's host key with a pluggable policy, and multiplexes the
//! connection: inbound channel opens are routed to per-type handler queues,
//! global requests are answered, remote forwards are tracked, and every
//! channel's output is buffered with an optional idle timeout. All waits
//! observe one cooperative shutdown signal.
//!
//! ## Features
//!
//! - Config validation before any network I/O
//! - Host key policies: fixed key, `known_hosts`, or none
//! - Per-type channel-open dispatch with exactly-once delivery
//! - Remote TCP forwards
//! - Channel buffers with transient, typed idle timeouts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferrissh_mux::{Client, ClientConfigBuilder, Network, fixed_host_key};
//! use russh::keys::PublicKey;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ferrissh_mux::Error> {
//!     let host_key = PublicKey::from_openssh("ssh-ed25519 AAAA...").expect("valid key");
//!     let config = ClientConfigBuilder::new("admin")
//!         .password("secret")
//!         .host_key_callback(fixed_host_key(host_key))
//!         .build();
//!
//!     let client = Client::dial(Network::Tcp, "192.168.1.1:22", config, CancellationToken::new()).await?;
//!
//!     let session = client.open_session().await?;
//!     let output = session.output("uname -a").await?;
//!     println!("{}", output.stdout_str());
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod error;
pub mod halt;
pub mod idle;
pub mod mux;
pub mod transport;

// Re-export main types for convenience
pub use channel::{Buffer, BufferError, ChannelStream, Output, Session};
pub use client::{Client, DispatcherState, ForwardAddr, ForwardedConnection, Network};
pub use error::Error;
pub use halt::{Halter, Shutdown, ShutdownCause};
pub use idle::{IdleTimeout, IdleTimer};
pub use mux::{NewChannel, RejectReason, Request};
pub use transport::{
    AuthMethod, ClientConfig, ClientConfigBuilder, HostKeyCallback, KnownHostsPolicy,
    fixed_host_key, insecure_ignore_host_key, known_hosts,
};
