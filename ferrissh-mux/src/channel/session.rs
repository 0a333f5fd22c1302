//! Interactive and exec sessions.

use std::borrow::Cow;
use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use super::buffer::Buffer;
use super::stream::ChannelStream;
use crate::error::{ChannelError, Result};

/// Collected result of [`Session::output`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Remote exit status, if the server sent one.
    pub exit_status: Option<u32>,
}

impl Output {
    /// Stdout as a string (lossy UTF-8).
    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Stderr as a string (lossy UTF-8).
    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// A `session` channel.
#[derive(Debug)]
pub struct Session {
    stream: ChannelStream,
}

impl Session {
    pub(crate) fn new(stream: ChannelStream) -> Self {
        Self { stream }
    }

    /// Run `command` on the remote side.
    pub async fn exec(&self, command: &str) -> Result<()> {
        debug!("session: exec {:?}", command);
        self.stream.exec(command).await
    }

    /// Start the remote login shell.
    pub async fn shell(&self) -> Result<()> {
        self.stream.request_shell().await
    }

    /// Write to the remote stdin.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.stream.write(data).await
    }

    /// Close the remote stdin.
    pub async fn send_eof(&self) -> Result<()> {
        self.stream.send_eof().await
    }

    pub fn stdout(&self) -> &Arc<Buffer> {
        self.stream.stdout()
    }

    pub fn stderr(&self) -> &Arc<Buffer> {
        self.stream.stderr()
    }

    /// Wait for the remote exit status.
    pub async fn exit_status(&self) -> Option<u32> {
        self.stream.exit_status().await
    }

    /// Run `command` and collect everything it prints.
    ///
    /// Output read before an error is discarded with it; use
    /// [`exec`](Self::exec) and [`collect`](Self::collect) to keep it.
    pub async fn output(&self, command: &str) -> Result<Output> {
        self.exec(command).await?;
        let mut out = Output::default();
        self.collect(&mut out).await?;
        Ok(out)
    }

    /// Read stdout and stderr to end of stream into `out`, then wait for
    /// the exit status.
    ///
    /// On an idle timeout the bytes read so far stay in `out` and the
    /// session stays usable: calling `collect` again continues where this
    /// call stopped.
    pub async fn collect(&self, out: &mut Output) -> Result<()> {
        let Output {
            stdout,
            stderr,
            exit_status,
        } = out;
        tokio::try_join!(
            self.stdout().read_to_end(stdout),
            self.stderr().read_to_end(stderr)
        )
        .map_err(ChannelError::from)?;
        *exit_status = self.exit_status().await;
        Ok(())
    }

    /// Close the channel.
    pub async fn close(self) -> Result<()> {
        match self.stream.close().await {
            // already gone
            Err(crate::Error::Channel(ChannelError::Closed)) => Ok(()),
            res => res,
        }
    }

    /// The underlying channel.
    pub fn stream(&self) -> &ChannelStream {
        &self.stream
    }

    pub fn into_stream(self) -> ChannelStream {
        self.stream
    }
}
