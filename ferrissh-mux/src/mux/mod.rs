//! Connection multiplexer.
//!
//! The SSH engine decodes frames; this module turns the inbound
//! channel-open and global-request frames into two ordered event streams.
//! Closing the mux closes both streams, which is how consumers learn that
//! the connection is gone.

pub mod wire;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelStream;
use crate::error::{ChannelError, Result};

pub use wire::{StreamLocalOpen, TcpipOpen, X11Open};

/// Capacity of each event stream.
pub const STREAM_CAPACITY: usize = 16;

/// Interactive session channel type.
pub const SESSION: &str = "session";
/// Connection arriving on a remote TCP forward.
pub const FORWARDED_TCPIP: &str = "forwarded-tcpip";
/// Connection arriving on a remote Unix socket forward.
pub const FORWARDED_STREAMLOCAL: &str = "forwarded-streamlocal@openssh.com";
/// Direct TCP/IP channel.
pub const DIRECT_TCPIP: &str = "direct-tcpip";
/// X11 forwarding channel.
pub const X11: &str = "x11";
/// OpenSSH agent forwarding channel.
pub const AUTH_AGENT: &str = "auth-agent@openssh.com";
/// OpenSSH host key announcement global request.
pub const HOSTKEYS: &str = "hostkeys-00@openssh.com";

/// Channel open failure codes (RFC 4254 section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Prohibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
}

impl RejectReason {
    /// Numeric reason code sent on the wire.
    pub fn code(self) -> u32 {
        match self {
            RejectReason::Prohibited => 1,
            RejectReason::ConnectFailed => 2,
            RejectReason::UnknownChannelType => 3,
            RejectReason::ResourceShortage => 4,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Prohibited => "administratively prohibited",
            RejectReason::ConnectFailed => "connect failed",
            RejectReason::UnknownChannelType => "unknown channel type",
            RejectReason::ResourceShortage => "resource shortage",
        };
        f.write_str(s)
    }
}

/// Engine side of an inbound channel open awaiting a decision.
pub trait PendingOpen: Send {
    /// Take the channel into use.
    fn accept(self: Box<Self>) -> Result<ChannelStream>;

    /// Refuse the channel.
    fn reject(self: Box<Self>, reason: RejectReason, message: String);
}

/// One inbound channel-open request.
///
/// Must be accepted or rejected exactly once. Dropping an undecided event
/// rejects it with [`RejectReason::ResourceShortage`].
pub struct NewChannel {
    channel_type: String,
    extra_data: Bytes,
    pending: Option<Box<dyn PendingOpen>>,
}

impl NewChannel {
    pub fn new(
        channel_type: impl Into<String>,
        extra_data: Bytes,
        pending: Box<dyn PendingOpen>,
    ) -> Self {
        Self {
            channel_type: channel_type.into(),
            extra_data,
            pending: Some(pending),
        }
    }

    /// The requested channel type, e.g. `"forwarded-tcpip"`.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Type-specific open parameters in RFC 4254 encoding.
    pub fn extra_data(&self) -> &Bytes {
        &self.extra_data
    }

    /// Accept the channel.
    pub fn accept(mut self) -> Result<ChannelStream> {
        match self.pending.take() {
            Some(pending) => pending.accept(),
            None => Err(ChannelError::Closed.into()),
        }
    }

    /// Reject the channel with a reason and a human readable message.
    ///
    /// russh confirms inbound channels before they reach the mux, so for
    /// channels from a live connection this only closes the channel; the
    /// peer never sees the reason code or message.
    pub fn reject(mut self, reason: RejectReason, message: impl Into<String>) {
        if let Some(pending) = self.pending.take() {
            let message = message.into();
            debug!(
                "rejecting {} channel: {} ({})",
                self.channel_type, message, reason
            );
            pending.reject(reason, message);
        }
    }
}

impl Drop for NewChannel {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            warn!(
                "{} channel open dropped without a decision, rejecting",
                self.channel_type
            );
            pending.reject(
                RejectReason::ResourceShortage,
                "channel open abandoned".to_string(),
            );
        }
    }
}

impl fmt::Debug for NewChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewChannel")
            .field("channel_type", &self.channel_type)
            .field("extra_data", &self.extra_data)
            .field("decided", &self.pending.is_none())
            .finish()
    }
}

/// Reply to a global request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReply {
    pub handled: bool,
    pub payload: Bytes,
}

/// A connection-scoped global request.
#[derive(Debug)]
pub struct Request {
    kind: String,
    want_reply: bool,
    payload: Bytes,
    reply: Option<oneshot::Sender<RequestReply>>,
}

impl Request {
    /// A request whose reply is delivered on the returned receiver.
    pub fn new(
        kind: impl Into<String>,
        want_reply: bool,
        payload: Bytes,
    ) -> (Self, oneshot::Receiver<RequestReply>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            kind: kind.into(),
            want_reply,
            payload,
            reply: Some(tx),
        };
        (request, rx)
    }

    /// A request that does not expect a reply.
    pub fn notification(kind: impl Into<String>, payload: Bytes) -> Self {
        Self {
            kind: kind.into(),
            want_reply: false,
            payload,
            reply: None,
        }
    }

    /// Request name, e.g. `"keepalive@openssh.com"`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Answer the request. Has no effect for notifications.
    pub fn reply(mut self, handled: bool, payload: Bytes) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(RequestReply { handled, payload });
        }
    }
}

/// Receiving ends of the two event streams.
#[derive(Debug)]
pub struct MuxStreams {
    pub channels: mpsc::Receiver<NewChannel>,
    pub requests: mpsc::Receiver<Request>,
}

/// Sending side of the event streams, shared with the engine handler.
#[derive(Debug)]
pub struct Mux {
    channels: Mutex<Option<mpsc::Sender<NewChannel>>>,
    requests: Mutex<Option<mpsc::Sender<Request>>>,
    closed: CancellationToken,
}

impl Mux {
    pub fn new() -> (Arc<Self>, MuxStreams) {
        let (channels_tx, channels_rx) = mpsc::channel(STREAM_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::channel(STREAM_CAPACITY);
        let mux = Arc::new(Self {
            channels: Mutex::new(Some(channels_tx)),
            requests: Mutex::new(Some(requests_tx)),
            closed: CancellationToken::new(),
        });
        let streams = MuxStreams {
            channels: channels_rx,
            requests: requests_rx,
        };
        (mux, streams)
    }

    /// Queue an inbound channel open. Waits while the stream is full.
    pub async fn deliver_channel(&self, channel: NewChannel) {
        let Some(tx) = lock(&self.channels).clone() else {
            channel.reject(RejectReason::ResourceShortage, "connection closed");
            return;
        };
        trace!("mux: incoming {} channel", channel.channel_type());
        if let Err(mpsc::error::SendError(channel)) = tx.send(channel).await {
            channel.reject(RejectReason::ResourceShortage, "connection closed");
        }
    }

    /// Queue an inbound global request. Waits while the stream is full.
    pub async fn deliver_request(&self, request: Request) {
        let Some(tx) = lock(&self.requests).clone() else {
            request.reply(false, Bytes::new());
            return;
        };
        trace!("mux: incoming global request {}", request.kind());
        if let Err(mpsc::error::SendError(request)) = tx.send(request).await {
            request.reply(false, Bytes::new());
        }
    }

    /// Close both streams and signal connection teardown.
    pub fn close(&self) {
        lock(&self.channels).take();
        lock(&self.requests).take();
        if !self.closed.is_cancelled() {
            debug!("mux: closed");
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Token fired by [`close`](Self::close).
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
