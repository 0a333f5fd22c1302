//! SSH client: connection plus dispatcher.
//!
//! A [`Client`] owns one authenticated [`Connection`] and five background
//! tasks: the global request loop, the channel-open loop, one router each
//! for TCP and Unix socket forwards, and a supervisor that tears the
//! connection down once any shutdown signal fires.

mod dispatcher;
mod forward;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use dispatcher::{CHANNEL_QUEUE_SIZE, Dispatcher, DispatcherState};
pub use forward::{ForwardAddr, ForwardList, ForwardedConnection};

use crate::channel::Session;
use crate::error::{ConfigError, DispatchError, Result, TransportError};
use crate::halt::{HaltState, Halter, Shutdown, ShutdownCause};
use crate::mux::{self, MuxStreams, NewChannel};
use crate::transport::{ClientConfig, Connection};

/// How long the supervisor waits for the engine to finish after a
/// disconnect.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Address families accepted by [`Client::dial`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Network {
    /// IPv4 or IPv6.
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        })
    }
}

/// A connected, authenticated SSH client.
///
/// Dropping a client that was not closed requests a stop; call
/// [`close`](Self::close) to also wait for the background tasks.
pub struct Client {
    conn: Arc<Connection>,
    dispatcher: Dispatcher,
    forwards: Arc<ForwardList>,
    halt: Halter,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Connect over TCP to `addr` (`host:port`) and run the handshake.
    ///
    /// `config.timeout` bounds the TCP connect; zero means no bound.
    pub async fn dial(
        network: Network,
        addr: &str,
        config: ClientConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(TransportError::Cancelled(ShutdownCause::Cancelled).into());
            }
            res = connect_tcp(network, addr, config.timeout) => res?,
        };
        let remote_addr = stream.peer_addr().map_err(TransportError::Io)?;
        Self::connect_stream(stream, remote_addr, addr, config, cancel).await
    }

    /// Run the handshake over an already connected stream.
    pub async fn connect_stream<S>(
        stream: S,
        remote_addr: SocketAddr,
        addr: &str,
        config: ClientConfig,
        cancel: CancellationToken,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (conn, streams) =
            Connection::establish(stream, remote_addr, addr, &config, cancel).await?;
        Ok(Self::new(conn, streams))
    }

    /// Wrap an established connection and start the background tasks.
    pub fn new(conn: Connection, streams: MuxStreams) -> Self {
        let conn = Arc::new(conn);
        let shutdown = conn.shutdown().clone();
        let halt = shutdown.halter().clone();
        let dispatcher = Dispatcher::new(shutdown.clone());
        let forwards = Arc::new(ForwardList::new());
        let MuxStreams { channels, requests } = streams;

        // Registered before the channel loop runs, so forwarded opens are
        // never seen as unknown.
        let tcpip = dispatcher
            .handle_channel_open(mux::FORWARDED_TCPIP)
            .unwrap_or_else(|_| dispatcher::closed_queue());
        let streamlocal = dispatcher
            .handle_channel_open(mux::FORWARDED_STREAMLOCAL)
            .unwrap_or_else(|_| dispatcher::closed_queue());

        let mut tasks = Vec::with_capacity(5);

        let d = dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            d.serve_global_requests(requests).await
        }));

        let d = dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            d.serve_channel_opens(channels).await
        }));

        for queue in [tcpip, streamlocal] {
            let forwards = forwards.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                forwards.handle_channels(queue, shutdown).await
            }));
        }

        tasks.push(tokio::spawn(supervise(conn.clone(), forwards.clone(), shutdown)));

        debug!("client {}: running", conn.remote_addr());
        Self {
            conn,
            dispatcher,
            forwards,
            halt,
            tasks: Mutex::new(tasks),
        }
    }

    /// Receive inbound channel opens of `channel_type`.
    ///
    /// Returns a closed queue once the client is shutting down.
    pub fn handle_channel_open(&self, channel_type: &str) -> Result<mpsc::Receiver<NewChannel>> {
        Ok(self.dispatcher.handle_channel_open(channel_type)?)
    }

    /// Open a `session` channel.
    pub async fn open_session(&self) -> Result<Session> {
        let stream = self.conn.open_session_channel().await?;
        Ok(Session::new(stream))
    }

    /// Ask the server to listen on `address:port` and forward connections
    /// back over this client. Port 0 lets the server choose.
    ///
    /// The forward is registered before the request goes out, so
    /// connections the server opens ahead of its reply are delivered.
    pub async fn request_remote_forward(
        &self,
        address: &str,
        port: u32,
    ) -> Result<(ForwardAddr, mpsc::Receiver<ForwardedConnection>)> {
        let requested = ForwardAddr::Tcp {
            address: address.to_string(),
            port,
        };
        let queue = self.forwards.add(requested.clone())?;

        let bound = match self.conn.tcpip_forward(address, port).await {
            Ok(bound) => bound,
            Err(e) => {
                let _ = self.forwards.remove(&requested);
                return Err(e);
            }
        };
        if bound == port {
            return Ok((requested, queue));
        }

        let addr = ForwardAddr::Tcp {
            address: address.to_string(),
            port: bound,
        };
        if let Err(e) = self.forwards.rebind(&requested, addr.clone()) {
            let _ = self.forwards.remove(&requested);
            if let Err(cancel) = self.conn.cancel_tcpip_forward(address, bound).await {
                warn!("could not cancel unusable forward {}: {}", addr, cancel);
            }
            return Err(e.into());
        }
        Ok((addr, queue))
    }

    /// Stop a forward started with
    /// [`request_remote_forward`](Self::request_remote_forward).
    pub async fn cancel_remote_forward(&self, addr: &ForwardAddr) -> Result<()> {
        let ForwardAddr::Tcp { address, port } = addr else {
            return Err(DispatchError::ForwardNotFound {
                addr: addr.to_string(),
            }
            .into());
        };
        self.forwards.remove(addr)?;
        self.conn.cancel_tcpip_forward(address, *port).await
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    pub fn halter(&self) -> &Halter {
        &self.halt
    }

    /// Remote forwards currently registered.
    pub fn forwards(&self) -> &ForwardList {
        &self.forwards
    }

    pub fn state(&self) -> DispatcherState {
        self.dispatcher.state()
    }

    /// Wait for the background tasks, then mark the halter stopped.
    pub async fn wait(&self) {
        let tasks = std::mem::take(&mut *self.lock_tasks());
        for res in join_all(tasks).await {
            if let Err(e) = res {
                warn!("client {}: task failed: {}", self.conn.remote_addr(), e);
            }
        }
        self.halt.mark_done();
        debug!("client {}: stopped", self.conn.remote_addr());
    }

    /// Request a stop and wait for it to complete.
    pub async fn close(&self) {
        self.halt.request_stop();
        self.wait().await;
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("conn", &self.conn)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.halt.state() != HaltState::Stopped {
            warn!(
                "client {}: dropped without close, requesting stop",
                self.conn.remote_addr()
            );
            self.halt.request_stop();
        }
    }
}

/// Wait for any shutdown signal, then tear the connection down.
async fn supervise(conn: Arc<Connection>, forwards: Arc<ForwardList>, shutdown: Shutdown) {
    let cause = shutdown.cancelled().await;
    debug!("client {}: shutting down: {}", conn.remote_addr(), cause);
    if cause != ShutdownCause::ConnectionClosed && !conn.is_closed() {
        if let Err(e) = conn.disconnect().await {
            debug!("client {}: disconnect failed: {}", conn.remote_addr(), e);
        }
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, conn.done()).await.is_err() {
        warn!(
            "client {}: engine still running after {:?}",
            conn.remote_addr(),
            DRAIN_TIMEOUT
        );
    }
    forwards.close_all();
}

async fn connect_tcp(network: Network, addr: &str, timeout: Duration) -> Result<TcpStream> {
    if timeout.is_zero() {
        return resolve_and_connect(network, addr).await;
    }
    tokio::time::timeout(timeout, resolve_and_connect(network, addr))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
}

/// Try every resolved address of the requested family in turn.
async fn resolve_and_connect(network: Network, addr: &str) -> Result<TcpStream> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| ConfigError::InvalidAddress {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?
        .filter(|a| network.accepts(a))
        .collect();
    if candidates.is_empty() {
        return Err(ConfigError::InvalidAddress {
            addr: addr.to_string(),
            reason: format!("no {network} address"),
        }
        .into());
    }

    let mut last_err = None;
    for candidate in candidates {
        debug!("dialing {} ({})", addr, candidate);
        match TcpStream::connect(candidate).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(TransportError::ConnectionFailed {
        addr: addr.to_string(),
        source: last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address")),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::transport::{ClientConfigBuilder, insecure_ignore_host_key};

    #[test]
    fn test_network_filter() {
        let v4: SocketAddr = "127.0.0.1:22".parse().unwrap();
        let v6: SocketAddr = "[::1]:22".parse().unwrap();
        assert!(Network::Tcp.accepts(&v4) && Network::Tcp.accepts(&v6));
        assert!(Network::Tcp4.accepts(&v4) && !Network::Tcp4.accepts(&v6));
        assert!(Network::Tcp6.accepts(&v6) && !Network::Tcp6.accepts(&v4));
    }

    #[tokio::test]
    async fn test_dial_validates_before_io() {
        // Unroutable on purpose: validation must fail before any connect.
        let config = ClientConfig::default();
        let err = Client::dial(Network::Tcp, "192.0.2.1:22", config, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::MissingHostKeyCallback)
        ));
    }

    #[tokio::test]
    async fn test_dial_family_mismatch() {
        let config = ClientConfigBuilder::new("u")
            .host_key_callback(insecure_ignore_host_key())
            .build();
        let err = Client::dial(Network::Tcp6, "127.0.0.1:22", config, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let config = ClientConfigBuilder::new("u")
            .host_key_callback(insecure_ignore_host_key())
            .build();
        let err = Client::dial(
            Network::Tcp4,
            &format!("127.0.0.1:{port}"),
            config,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::ConnectionFailed { .. })
        ));
    }
}
