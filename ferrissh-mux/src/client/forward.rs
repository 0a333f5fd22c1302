//! Remote forward bookkeeping.
//!
//! Connections arriving on a remote forward are opened by the server as
//! `forwarded-tcpip` or `forwarded-streamlocal@openssh.com` channels. The
//! dispatcher hands those to [`ForwardList::handle_channels`], which routes
//! each one to the queue registered for the address it arrived on.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, trace};
use tokio::sync::mpsc;

use super::dispatcher::{CHANNEL_QUEUE_SIZE, closed_queue};
use crate::channel::ChannelStream;
use crate::error::{DispatchError, Result};
use crate::halt::Shutdown;
use crate::mux::{self, NewChannel, RejectReason, StreamLocalOpen, TcpipOpen};

/// Address a remote forward listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ForwardAddr {
    Tcp { address: String, port: u32 },
    Unix { path: String },
}

impl fmt::Display for ForwardAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardAddr::Tcp { address, port } if address.contains(':') => {
                write!(f, "[{address}]:{port}")
            }
            ForwardAddr::Tcp { address, port } => write!(f, "{address}:{port}"),
            ForwardAddr::Unix { path } => f.write_str(path),
        }
    }
}

/// A connection that arrived on a remote forward.
#[derive(Debug)]
pub struct ForwardedConnection {
    addr: ForwardAddr,
    originator: Option<(String, u32)>,
    channel: NewChannel,
}

impl ForwardedConnection {
    /// The forward the connection arrived on.
    pub fn addr(&self) -> &ForwardAddr {
        &self.addr
    }

    /// Address and port of the remote peer, for TCP forwards.
    pub fn originator(&self) -> Option<(&str, u32)> {
        self.originator
            .as_ref()
            .map(|(address, port)| (address.as_str(), *port))
    }

    pub fn accept(self) -> Result<ChannelStream> {
        self.channel.accept()
    }

    pub fn reject(self, reason: RejectReason, message: impl Into<String>) {
        self.channel.reject(reason, message)
    }
}

/// Registered remote forwards and their connection queues.
#[derive(Debug)]
pub struct ForwardList {
    entries: Mutex<Option<HashMap<ForwardAddr, mpsc::Sender<ForwardedConnection>>>>,
}

impl Default for ForwardList {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardList {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Register `addr`. After [`close_all`](Self::close_all) the returned
    /// queue is already closed.
    pub fn add(
        &self,
        addr: ForwardAddr,
    ) -> std::result::Result<mpsc::Receiver<ForwardedConnection>, DispatchError> {
        let mut guard = self.lock();
        let Some(entries) = guard.as_mut() else {
            return Ok(closed_queue());
        };
        if entries.contains_key(&addr) {
            return Err(DispatchError::ForwardExists {
                addr: addr.to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE_SIZE);
        debug!("forward: listening on {}", addr);
        entries.insert(addr, tx);
        Ok(rx)
    }

    /// Unregister `addr`, closing its queue.
    pub fn remove(&self, addr: &ForwardAddr) -> std::result::Result<(), DispatchError> {
        let removed = self.lock().as_mut().and_then(|entries| entries.remove(addr));
        match removed {
            Some(_) => {
                debug!("forward: removed {}", addr);
                Ok(())
            }
            None => Err(DispatchError::ForwardNotFound {
                addr: addr.to_string(),
            }),
        }
    }

    /// Move the queue registered under `from` to `to`, once the server has
    /// picked the port for a port 0 request.
    pub fn rebind(
        &self,
        from: &ForwardAddr,
        to: ForwardAddr,
    ) -> std::result::Result<(), DispatchError> {
        let mut guard = self.lock();
        let Some(entries) = guard.as_mut() else {
            return Ok(());
        };
        if entries.contains_key(&to) {
            return Err(DispatchError::ForwardExists {
                addr: to.to_string(),
            });
        }
        let Some(tx) = entries.remove(from) else {
            return Err(DispatchError::ForwardNotFound {
                addr: from.to_string(),
            });
        };
        debug!("forward: {} bound as {}", from, to);
        entries.insert(to, tx);
        Ok(())
    }

    /// Queue for a connection on `addr`. A TCP connection on a port nobody
    /// registered falls back to a pending port 0 request on its address.
    fn route(&self, addr: &ForwardAddr) -> Option<mpsc::Sender<ForwardedConnection>> {
        let guard = self.lock();
        let entries = guard.as_ref()?;
        if let Some(tx) = entries.get(addr) {
            return Some(tx.clone());
        }
        match addr {
            ForwardAddr::Tcp { address, .. } => entries
                .get(&ForwardAddr::Tcp {
                    address: address.clone(),
                    port: 0,
                })
                .cloned(),
            ForwardAddr::Unix { .. } => None,
        }
    }

    /// Close every queue; later registrations get a closed queue.
    pub fn close_all(&self) {
        if let Some(entries) = self.lock().take() {
            debug!("forward: closing {} forwards", entries.len());
        }
    }

    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route forwarded channel opens until the stream ends or shutdown.
    pub async fn handle_channels(
        &self,
        mut channels: mpsc::Receiver<NewChannel>,
        shutdown: Shutdown,
    ) {
        loop {
            let channel = tokio::select! {
                cause = shutdown.cancelled() => {
                    debug!("forward: router stopping: {}", cause);
                    return;
                }
                channel = channels.recv() => match channel {
                    Some(channel) => channel,
                    None => return,
                },
            };

            let Some((addr, originator)) = parse_origin(&channel) else {
                let message = format!("could not parse {} payload", channel.channel_type());
                channel.reject(RejectReason::ConnectFailed, message);
                continue;
            };

            let Some(queue) = self.route(&addr) else {
                channel.reject(RejectReason::Prohibited, "no forward for address");
                continue;
            };

            trace!("forward: connection on {}", addr);
            let conn = ForwardedConnection {
                addr,
                originator,
                channel,
            };
            tokio::select! {
                cause = shutdown.cancelled() => {
                    debug!("forward: router stopping: {}", cause);
                    return;
                }
                res = queue.send(conn) => {
                    if let Err(mpsc::error::SendError(conn)) = res {
                        conn.reject(RejectReason::Prohibited, "forward closed");
                    }
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<HashMap<ForwardAddr, mpsc::Sender<ForwardedConnection>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_origin(channel: &NewChannel) -> Option<(ForwardAddr, Option<(String, u32)>)> {
    let data = channel.extra_data().clone();
    match channel.channel_type() {
        mux::FORWARDED_TCPIP => {
            let open = TcpipOpen::decode(data)?;
            let addr = ForwardAddr::Tcp {
                address: open.address,
                port: open.port,
            };
            Some((addr, Some((open.originator_address, open.originator_port))))
        }
        mux::FORWARDED_STREAMLOCAL => {
            let open = StreamLocalOpen::decode(data)?;
            Some((
                ForwardAddr::Unix {
                    path: open.socket_path,
                },
                None,
            ))
        }
        _ => None,
    }
}
