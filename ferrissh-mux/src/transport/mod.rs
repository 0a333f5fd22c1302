//! SSH transport layer wrapping russh.
//!
//! This module provides connection setup, host key policy and
//! authentication. The resulting [`Connection`] feeds the multiplexer.

mod abort;
pub mod config;
mod hostkey;
mod ssh;

pub use config::{
    AuthMethod, BaseConfig, ClientConfig, ClientConfigBuilder, HostKeyCallback, PACKAGE_VERSION,
    default_host_key_algorithms,
};
pub use hostkey::{
    FixedHostKey, KnownHostsPolicy, fixed_host_key, insecure_ignore_host_key, known_hosts,
    verify_host_key_signature,
};
pub use ssh::Connection;
