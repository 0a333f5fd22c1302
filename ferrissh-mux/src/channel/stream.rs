//! Consumer handle for one open channel.
//!
//! A pump task owns the engine channel. It moves inbound messages into the
//! stdout and stderr [`Buffer`]s and performs outbound requests in the
//! order they were issued. The handle talks to the pump over a queue, so it
//! can be shared by reference between a reader and a writer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, oneshot, watch};

use super::buffer::{Buffer, BufferError};
use crate::error::{ChannelError, Result};
use crate::halt::Shutdown;
use crate::idle::IdleTimer;

/// Extended data type carrying stderr (RFC 4254 section 5.2).
const EXTENDED_DATA_STDERR: u32 = 1;

/// Outbound requests queued before the sender waits.
const REQUEST_QUEUE_SIZE: usize = 16;

/// Outbound operations performed by the pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Data(Bytes),
    Exec(String),
    Shell,
    Eof,
    Close,
}

/// Inbound events the pump reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Inbound {
    Data(Bytes),
    Stderr(Bytes),
    Eof,
    ExitStatus(u32),
    Closed,
}

impl Inbound {
    fn from_msg(msg: ChannelMsg) -> Option<Self> {
        match msg {
            ChannelMsg::Data { data } => Some(Inbound::Data(Bytes::copy_from_slice(&data[..]))),
            ChannelMsg::ExtendedData { data, ext } if ext == EXTENDED_DATA_STDERR => {
                Some(Inbound::Stderr(Bytes::copy_from_slice(&data[..])))
            }
            ChannelMsg::Eof => Some(Inbound::Eof),
            ChannelMsg::ExitStatus { exit_status } => Some(Inbound::ExitStatus(exit_status)),
            ChannelMsg::Close => Some(Inbound::Closed),
            other => {
                trace!("channel: ignoring {:?}", other);
                None
            }
        }
    }
}

/// The engine side of a channel as seen by the pump.
pub(crate) trait ChannelIo: Send + 'static {
    /// Next inbound event; `None` once the channel is gone.
    fn recv(&mut self) -> impl Future<Output = Option<Inbound>> + Send;

    fn perform(
        &mut self,
        command: Command,
    ) -> impl Future<Output = std::result::Result<(), russh::Error>> + Send;
}

impl ChannelIo for Channel<Msg> {
    async fn recv(&mut self) -> Option<Inbound> {
        loop {
            let msg = self.wait().await?;
            if let Some(inbound) = Inbound::from_msg(msg) {
                return Some(inbound);
            }
        }
    }

    async fn perform(&mut self, command: Command) -> std::result::Result<(), russh::Error> {
        match command {
            Command::Data(data) => self.data(&data[..]).await,
            Command::Exec(cmd) => self.exec(true, cmd).await,
            Command::Shell => self.request_shell(true).await,
            Command::Eof => self.eof().await,
            Command::Close => self.close().await,
        }
    }
}

struct Pending {
    command: Command,
    reply: oneshot::Sender<std::result::Result<(), russh::Error>>,
}

/// Where inbound events end up.
struct ChannelSink {
    stdout: Arc<Buffer>,
    stderr: Arc<Buffer>,
    exit_status: watch::Sender<Option<u32>>,
}

impl ChannelSink {
    /// Apply one event. Returns false once the channel is closed.
    fn handle(&self, inbound: Inbound) -> bool {
        match inbound {
            Inbound::Data(data) => self.stdout.write(data),
            Inbound::Stderr(data) => self.stderr.write(data),
            Inbound::Eof => {
                trace!("channel: eof");
                self.stdout.close_for_write();
                self.stderr.close_for_write();
            }
            Inbound::ExitStatus(code) => {
                self.exit_status.send_replace(Some(code));
            }
            Inbound::Closed => return false,
        }
        true
    }

    fn finish(&self) {
        self.stdout.close_for_write();
        self.stderr.close_for_write();
    }
}

async fn pump<C: ChannelIo>(
    mut channel: C,
    sink: ChannelSink,
    mut requests: mpsc::Receiver<Pending>,
    shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            cause = shutdown.cancelled() => {
                debug!("channel: pump stopping: {}", cause);
                break;
            }
            inbound = channel.recv() => match inbound {
                Some(inbound) => {
                    if !sink.handle(inbound) {
                        debug!("channel: closed by peer");
                        break;
                    }
                }
                None => {
                    debug!("channel: engine channel ended");
                    break;
                }
            },
            pending = requests.recv() => match pending {
                Some(Pending { command, reply }) => {
                    let res = channel.perform(command).await;
                    let _ = reply.send(res);
                }
                None => {
                    // every handle is gone
                    let _ = channel.perform(Command::Close).await;
                    break;
                }
            },
        }
    }
    sink.finish();
}

/// An open channel: stdout and stderr buffers plus outbound requests.
#[derive(Debug)]
pub struct ChannelStream {
    stdout: Arc<Buffer>,
    stderr: Arc<Buffer>,
    requests: mpsc::Sender<Pending>,
    exit_status: watch::Receiver<Option<u32>>,
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").field("command", &self.command).finish()
    }
}

impl ChannelStream {
    /// Take ownership of an engine channel and start its pump.
    pub(crate) fn spawn<C: ChannelIo>(
        channel: C,
        idle_timeout: Option<Duration>,
        shutdown: Shutdown,
    ) -> Self {
        let idle = Arc::new(IdleTimer::new(idle_timeout));
        let stdout = Arc::new(Buffer::new(idle.clone(), shutdown.clone()));
        let stderr = Arc::new(Buffer::new(idle, shutdown.clone()));
        let (exit_tx, exit_rx) = watch::channel(None);
        let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);

        let sink = ChannelSink {
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            exit_status: exit_tx,
        };
        tokio::spawn(pump(channel, sink, req_rx, shutdown));

        Self {
            stdout,
            stderr,
            requests: req_tx,
            exit_status: exit_rx,
        }
    }

    async fn request(&self, command: Command) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Pending { command, reply })
            .await
            .map_err(|_| ChannelError::Closed)?;
        rx.await
            .map_err(|_| ChannelError::Closed)?
            .map_err(ChannelError::Ssh)?;
        Ok(())
    }

    /// Send data to the remote side.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.request(Command::Data(data.into())).await
    }

    /// Run a command (`exec` request).
    pub async fn exec(&self, command: &str) -> Result<()> {
        self.request(Command::Exec(command.to_string())).await
    }

    /// Start the user's shell.
    pub async fn request_shell(&self) -> Result<()> {
        self.request(Command::Shell).await
    }

    /// Signal that no more data will be sent.
    pub async fn send_eof(&self) -> Result<()> {
        self.request(Command::Eof).await
    }

    /// Close the channel.
    pub async fn close(&self) -> Result<()> {
        self.request(Command::Close).await
    }

    /// Read from stdout.
    pub async fn read(&self, dst: &mut [u8]) -> std::result::Result<usize, BufferError> {
        self.stdout.read(dst).await
    }

    /// Read from stderr.
    pub async fn read_stderr(&self, dst: &mut [u8]) -> std::result::Result<usize, BufferError> {
        self.stderr.read(dst).await
    }

    pub fn stdout(&self) -> &Arc<Buffer> {
        &self.stdout
    }

    pub fn stderr(&self) -> &Arc<Buffer> {
        &self.stderr
    }

    /// The idle timer shared by both buffers.
    pub fn idle_timer(&self) -> &Arc<IdleTimer> {
        self.stdout.idle_timer()
    }

    /// Waits for the remote exit status. `None` if the channel ended
    /// without one.
    pub async fn exit_status(&self) -> Option<u32> {
        let mut rx = self.exit_status.clone();
        let status = rx.wait_for(Option::is_some).await.ok()?;
        *status
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::fake;
    use super::*;
    use crate::halt::Halter;

    fn shutdown() -> (Halter, Shutdown) {
        let halt = Halter::new();
        (halt.clone(), Shutdown::from_halter(halt))
    }

    #[tokio::test]
    async fn test_routes_stdout_stderr_and_exit_status() {
        let (channel, tx, _) = fake();
        let (_halt, shutdown) = shutdown();
        let stream = ChannelStream::spawn(channel, None, shutdown);

        tx.send(Inbound::Data(Bytes::from_static(b"out"))).unwrap();
        tx.send(Inbound::Stderr(Bytes::from_static(b"err"))).unwrap();
        tx.send(Inbound::ExitStatus(3)).unwrap();
        tx.send(Inbound::Eof).unwrap();

        let mut out = Vec::new();
        stream.stdout().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"out");
        let mut dst = [0u8; 8];
        assert_eq!(stream.read_stderr(&mut dst).await.unwrap(), 3);
        assert_eq!(&dst[..3], b"err");
        assert_eq!(stream.read_stderr(&mut dst).await.unwrap(), 0);
        assert_eq!(stream.exit_status().await, Some(3));
    }

    #[tokio::test]
    async fn test_commands_are_performed_in_order() {
        let (channel, _tx, performed) = fake();
        let (_halt, shutdown) = shutdown();
        let stream = ChannelStream::spawn(channel, None, shutdown);

        stream.exec("uname -a").await.unwrap();
        stream.write(&b"input"[..]).await.unwrap();
        stream.send_eof().await.unwrap();

        assert_eq!(
            performed.lock().unwrap().as_slice(),
            &[
                Command::Exec("uname -a".into()),
                Command::Data(Bytes::from_static(b"input")),
                Command::Eof,
            ]
        );
    }

    #[tokio::test]
    async fn test_peer_close_ends_stream() {
        let (channel, tx, _) = fake();
        let (_halt, shutdown) = shutdown();
        let stream = ChannelStream::spawn(channel, None, shutdown);

        tx.send(Inbound::Data(Bytes::from_static(b"tail"))).unwrap();
        tx.send(Inbound::Closed).unwrap();

        let mut out = Vec::new();
        stream.stdout().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"tail");
        assert_eq!(stream.exit_status().await, None);
        assert!(matches!(
            stream.write(&b"x"[..]).await,
            Err(crate::Error::Channel(ChannelError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_dropping_handle_closes_channel() {
        let (channel, _tx, performed) = fake();
        let (_halt, shutdown) = shutdown();
        let stream = ChannelStream::spawn(channel, None, shutdown);
        drop(stream);

        for _ in 0..50 {
            if !performed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(performed.lock().unwrap().as_slice(), &[Command::Close]);
    }

    #[tokio::test]
    async fn test_halt_stops_pump() {
        let (channel, _tx, _) = fake();
        let (halt, shutdown) = shutdown();
        let stream = ChannelStream::spawn(channel, None, shutdown);

        halt.request_stop();
        let mut out = Vec::new();
        let res = tokio::time::timeout(Duration::from_secs(1), stream.stdout().read_to_end(&mut out))
            .await
            .expect("reader stayed blocked");
        // Either the shutdown or the pump's close reached the reader first.
        match res {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert!(!e.is_temporary()),
        }
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout_is_per_channel() {
        let (quiet, _quiet_tx, _) = fake();
        let (busy, busy_tx, _) = fake();
        let (_halt, shutdown) = shutdown();
        let idle = Some(Duration::from_millis(40));
        let quiet = ChannelStream::spawn(quiet, idle, shutdown.clone());
        let busy = ChannelStream::spawn(busy, idle, shutdown);

        let feeder = tokio::spawn(async move {
            for _ in 0..20 {
                let _ = busy_tx.send(Inbound::Data(Bytes::from_static(b".")));
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            busy_tx
        });

        let mut dst = [0u8; 16];
        let err = quiet.read(&mut dst).await.unwrap_err();
        assert!(err.is_timeout());

        for _ in 0..4 {
            assert!(busy.read(&mut dst).await.unwrap() > 0);
        }
        drop(feeder.await.unwrap());
    }
}
