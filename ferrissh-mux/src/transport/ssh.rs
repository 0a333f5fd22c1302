//! SSH connection over russh.
//!
//! russh runs the version exchange, key exchange, ciphers and the user-auth
//! exchanges. This module drives the handshake under the connection's
//! shutdown signals, enforces the host key policy, and turns inbound engine
//! callbacks into [`Mux`] events.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use russh::Channel;
use russh::client::{self, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::abort::AbortableStream;
use super::config::{AuthMethod, ClientConfig, HostKeyCallback};
use crate::channel::ChannelStream;
use crate::error::{
    ChannelError, ConfigError, HandshakeError, HostKeyError, Result, TransportError,
};
use crate::halt::{Shutdown, ShutdownCause};
use crate::mux::wire::{WireError, put_string};
use crate::mux::{
    self, Mux, MuxStreams, NewChannel, PendingOpen, RejectReason, Request, StreamLocalOpen,
    TcpipOpen, X11Open,
};

/// An authenticated SSH connection.
pub struct Connection {
    /// Write-locked only for the requests the engine takes `&mut` for.
    session: RwLock<Handle<ClientHandler>>,
    remote_addr: SocketAddr,
    user: String,
    client_version: String,
    idle_timeout: Option<Duration>,
    mux: Arc<Mux>,
    shutdown: Shutdown,
}

impl Connection {
    /// Run the handshake and authenticate over `stream`.
    ///
    /// The configuration is validated before any I/O; on failure the
    /// stream is dropped unused. A halt request or a fired `cancel` token
    /// abandons the handshake and closes the stream.
    pub async fn establish<S>(
        stream: S,
        remote_addr: SocketAddr,
        addr: &str,
        config: &ClientConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, MuxStreams)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Err(e) = config.validate() {
            drop(stream);
            return Err(e.into());
        }
        let halt = config.halt.clone().ok_or(ConfigError::MissingHalter)?;
        let host_key_callback = config
            .host_key_callback
            .clone()
            .ok_or(ConfigError::MissingHostKeyCallback)?;

        // Until the handshake succeeds every early return aborts the stream,
        // ending the engine task even while it is mid key exchange.
        let abort = CancellationToken::new();
        let abort_on_drop = abort.clone().drop_guard();
        let stream = AbortableStream::new(stream, abort);

        let (mux, streams) = Mux::new();
        let shutdown = Shutdown::new(halt.clone(), mux.closed_token(), cancel.clone());
        let host_key_error = Arc::new(Mutex::new(None));

        let handler = ClientHandler {
            hostname: config.host_port.clone().unwrap_or_else(|| addr.to_string()),
            remote_addr,
            host_key_callback,
            host_key_error: host_key_error.clone(),
            mux: mux.clone(),
            idle_timeout: config.idle_timeout,
            shutdown: shutdown.clone(),
        };

        debug!(
            "handshake with {} ({}) as {}",
            addr,
            remote_addr,
            config.client_version()
        );
        let connect = client::connect_stream(Arc::new(config.engine_config()), stream, handler);
        let mut session = tokio::select! {
            biased;
            _ = halt.stop_requested() => {
                debug!("handshake with {} abandoned: halted", addr);
                return Err(TransportError::Cancelled(ShutdownCause::Halted).into());
            }
            _ = cancel.cancelled() => {
                debug!("handshake with {} abandoned: cancelled", addr);
                return Err(TransportError::Cancelled(ShutdownCause::Cancelled).into());
            }
            res = connect => res.map_err(|e| handshake_error(e, &host_key_error))?,
        };
        debug!("handshake with {} complete", addr);

        let authenticated = tokio::select! {
            biased;
            cause = shutdown.cancelled() => Err(TransportError::Cancelled(cause).into()),
            res = authenticate(&mut session, config) => res,
        };
        if let Err(e) = authenticated {
            // The engine may report a rejected host key only once auth starts.
            if let Some(hk) = lock(&host_key_error).take() {
                return Err(TransportError::Handshake(HandshakeError::HostKey(hk)).into());
            }
            return Err(e);
        }

        let _ = abort_on_drop.disarm();
        let conn = Self {
            session: RwLock::new(session),
            remote_addr,
            user: config.user.clone(),
            client_version: config.client_version().to_string(),
            idle_timeout: config.idle_timeout,
            mux,
            shutdown,
        };
        Ok((conn, streams))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// The identification string we sent.
    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed() || self.session.try_read().is_ok_and(|s| s.is_closed())
    }

    /// Resolves once the engine session has ended.
    pub async fn done(&self) {
        self.mux.closed().await
    }

    /// Halt, connection-closed and caller cancellation combined.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Open an outbound `session` channel.
    pub async fn open_session_channel(&self) -> Result<ChannelStream> {
        let channel = self
            .session
            .read()
            .await
            .channel_open_session()
            .await
            .map_err(ChannelError::OpenFailed)?;
        Ok(ChannelStream::spawn(
            channel,
            self.idle_timeout,
            self.shutdown.clone(),
        ))
    }

    /// Ask the server to listen on `address:port`. Returns the bound port.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32> {
        let bound = self
            .session
            .write()
            .await
            .tcpip_forward(address, port)
            .await
            .map_err(TransportError::Ssh)?;
        Ok(if port == 0 { bound } else { port })
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<()> {
        self.session
            .write()
            .await
            .cancel_tcpip_forward(address, port)
            .await
            .map_err(TransportError::Ssh)?;
        Ok(())
    }

    /// Send a disconnect message.
    pub async fn disconnect(&self) -> Result<()> {
        self.session
            .read()
            .await
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(TransportError::Ssh)?;
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("user", &self.user)
            .field("client_version", &self.client_version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn handshake_error(err: russh::Error, host_key_error: &Mutex<Option<HostKeyError>>) -> TransportError {
    // A detailed host key error replaces the engine's generic UnknownKey.
    match lock(host_key_error).take() {
        Some(e) => TransportError::Handshake(HandshakeError::HostKey(e)),
        None => TransportError::Handshake(HandshakeError::Ssh(err)),
    }
}

/// Try each configured method in order, skipping repeated method names.
async fn authenticate(session: &mut Handle<ClientHandler>, config: &ClientConfig) -> Result<()> {
    let none = [AuthMethod::None];
    let methods = if config.auth.is_empty() {
        &none[..]
    } else {
        &config.auth[..]
    };

    let mut tried = HashSet::new();
    for method in methods {
        if !tried.insert(method.method_name()) {
            debug!("skipping repeated {} method", method.method_name());
            continue;
        }
        debug!(
            "trying {} authentication for {}",
            method.method_name(),
            config.user
        );
        if try_method(session, &config.user, method).await? {
            debug!("authenticated as {}", config.user);
            return Ok(());
        }
    }

    Err(TransportError::AuthenticationFailed {
        user: config.user.clone(),
    }
    .into())
}

async fn try_method(
    session: &mut Handle<ClientHandler>,
    user: &str,
    method: &AuthMethod,
) -> Result<bool> {
    let success = match method {
        AuthMethod::None => session
            .authenticate_none(user)
            .await
            .map_err(TransportError::Ssh)?
            .success(),
        AuthMethod::Password(password) => session
            .authenticate_password(user, password.expose_secret())
            .await
            .map_err(TransportError::Ssh)?
            .success(),
        AuthMethod::PrivateKey { path, passphrase } => {
            let key = load_secret_key(path, passphrase.as_ref().map(|p| p.expose_secret()))
                .map_err(|e| TransportError::Key(e.to_string()))?;

            // Get the best RSA hash algorithm supported by the server
            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .map_err(TransportError::Ssh)?
                .flatten();

            session
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await
                .map_err(TransportError::Ssh)?
                .success()
        }
    };
    Ok(success)
}

/// russh callback handler for one connection.
pub(crate) struct ClientHandler {
    hostname: String,
    remote_addr: SocketAddr,
    host_key_callback: HostKeyCallback,
    /// Detailed host key error, surfaced instead of the engine's generic one.
    host_key_error: Arc<Mutex<Option<HostKeyError>>>,
    mux: Arc<Mux>,
    idle_timeout: Option<Duration>,
    shutdown: Shutdown,
}

impl ClientHandler {
    async fn deliver(
        &self,
        channel_type: &str,
        extra_data: std::result::Result<Bytes, WireError>,
        channel: Channel<Msg>,
    ) {
        let extra_data = match extra_data {
            Ok(data) => data,
            Err(e) => {
                warn!("closing inbound {} channel: {}", channel_type, e);
                let _ = channel.close().await;
                return;
            }
        };
        let pending = ConfirmedOpen {
            channel,
            idle_timeout: self.idle_timeout,
            shutdown: self.shutdown.clone(),
        };
        self.mux
            .deliver_channel(NewChannel::new(channel_type, extra_data, Box::new(pending)))
            .await;
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        // The engine drops its handler when the session ends.
        self.mux.close();
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match (self.host_key_callback)(&self.hostname, self.remote_addr, server_public_key) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("rejecting host key of {}: {}", self.hostname, e);
                *lock(&self.host_key_error) = Some(e);
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let open = TcpipOpen {
            address: connected_address.to_string(),
            port: connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        };
        self.deliver(mux::FORWARDED_TCPIP, open.encode(), channel).await;
        Ok(())
    }

    async fn server_channel_open_forwarded_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let open = StreamLocalOpen {
            socket_path: socket_path.to_string(),
        };
        self.deliver(mux::FORWARDED_STREAMLOCAL, open.encode(), channel)
            .await;
        Ok(())
    }

    async fn server_channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let open = TcpipOpen {
            address: host_to_connect.to_string(),
            port: port_to_connect,
            originator_address: originator_address.to_string(),
            originator_port,
        };
        self.deliver(mux::DIRECT_TCPIP, open.encode(), channel).await;
        Ok(())
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let open = X11Open {
            originator_address: originator_address.to_string(),
            originator_port,
        };
        self.deliver(mux::X11, open.encode(), channel).await;
        Ok(())
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        self.deliver(mux::AUTH_AGENT, Ok(Bytes::new()), channel).await;
        Ok(())
    }

    async fn server_channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        self.deliver(mux::SESSION, Ok(Bytes::new()), channel).await;
        Ok(())
    }

    async fn openssh_ext_host_keys_announced(
        &mut self,
        keys: Vec<PublicKey>,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        for key in &keys {
            let added = key
                .to_bytes()
                .map_err(|e| e.to_string())
                .and_then(|blob| put_string(&mut payload, &blob).map_err(|e| e.to_string()));
            if let Err(e) = added {
                warn!("skipping announced host key: {}", e);
            }
        }
        self.mux
            .deliver_request(Request::notification(mux::HOSTKEYS, payload.freeze()))
            .await;
        Ok(())
    }
}

/// A channel the engine already confirmed to the server.
///
/// Rejecting it closes the channel, since the confirmation was already sent.
struct ConfirmedOpen {
    channel: Channel<Msg>,
    idle_timeout: Option<Duration>,
    shutdown: Shutdown,
}

impl PendingOpen for ConfirmedOpen {
    fn accept(self: Box<Self>) -> Result<ChannelStream> {
        let ConfirmedOpen {
            channel,
            idle_timeout,
            shutdown,
        } = *self;
        Ok(ChannelStream::spawn(channel, idle_timeout, shutdown))
    }

    fn reject(self: Box<Self>, reason: RejectReason, message: String) {
        debug!("closing refused channel: {} ({})", message, reason);
        let channel = self.channel;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    let _ = channel.close().await;
                });
            }
            Err(_) => drop(channel),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
