//! Cooperative shutdown signalling.
//!
//! A [`Halter`] is shared by everything that belongs to one connection.
//! Any task may request a stop; every blocking wait in the crate observes
//! the request and unwinds. [`Shutdown`] combines the halter with the
//! connection-closed signal and a caller supplied [`CancellationToken`] so
//! that a single `select!` branch covers all three.

use std::fmt;

use log::debug;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a [`Halter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltState {
    /// No stop has been requested.
    Running,
    /// A stop was requested; waiters are unwinding.
    StopRequested,
    /// Every owned task has finished.
    Stopped,
}

/// Broadcast stop signal for one connection.
///
/// Cloning a `Halter` yields another handle to the same signal.
#[derive(Debug, Clone, Default)]
pub struct Halter {
    req_stop: CancellationToken,
    done: CancellationToken,
}

impl Halter {
    /// Create a halter in the running state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every waiter to stop. Calling this more than once is harmless.
    pub fn request_stop(&self) {
        if !self.req_stop.is_cancelled() {
            debug!("halter: stop requested");
        }
        self.req_stop.cancel();
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.req_stop.is_cancelled()
    }

    /// Resolves once a stop has been requested.
    pub async fn stop_requested(&self) {
        self.req_stop.cancelled().await
    }

    /// Record that all tasks governed by this halter have finished.
    ///
    /// Implies a stop request.
    pub fn mark_done(&self) {
        self.req_stop.cancel();
        self.done.cancel();
    }

    /// Resolves once [`mark_done`](Self::mark_done) has been called.
    pub async fn done(&self) {
        self.done.cancelled().await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HaltState {
        if self.done.is_cancelled() {
            HaltState::Stopped
        } else if self.req_stop.is_cancelled() {
            HaltState::StopRequested
        } else {
            HaltState::Running
        }
    }
}

/// Which of the three shutdown signals fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// The connection's halter requested a stop.
    Halted,
    /// The underlying connection went away.
    ConnectionClosed,
    /// The caller's cancellation token fired.
    Cancelled,
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownCause::Halted => "halt requested",
            ShutdownCause::ConnectionClosed => "connection closed",
            ShutdownCause::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Logical OR of halt request, connection close and caller cancellation.
#[derive(Debug, Clone)]
pub struct Shutdown {
    halt: Halter,
    closed: CancellationToken,
    cancel: CancellationToken,
}

impl Shutdown {
    /// Combine the three signals.
    pub fn new(halt: Halter, closed: CancellationToken, cancel: CancellationToken) -> Self {
        Self {
            halt,
            closed,
            cancel,
        }
    }

    /// A shutdown that only reacts to the given halter.
    pub fn from_halter(halt: Halter) -> Self {
        Self::new(halt, CancellationToken::new(), CancellationToken::new())
    }

    /// Resolves with the cause of the first signal to fire.
    ///
    /// No priority is given to any of the three signals.
    pub async fn cancelled(&self) -> ShutdownCause {
        tokio::select! {
            _ = self.halt.stop_requested() => ShutdownCause::Halted,
            _ = self.closed.cancelled() => ShutdownCause::ConnectionClosed,
            _ = self.cancel.cancelled() => ShutdownCause::Cancelled,
        }
    }

    /// The cause of shutdown if any signal has already fired.
    pub fn cause(&self) -> Option<ShutdownCause> {
        if self.halt.is_stop_requested() {
            Some(ShutdownCause::Halted)
        } else if self.closed.is_cancelled() {
            Some(ShutdownCause::ConnectionClosed)
        } else if self.cancel.is_cancelled() {
            Some(ShutdownCause::Cancelled)
        } else {
            None
        }
    }

    /// Whether any of the signals has fired.
    pub fn is_shutdown(&self) -> bool {
        self.cause().is_some()
    }

    /// The halter half of this shutdown.
    pub fn halter(&self) -> &Halter {
        &self.halt
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_halter_states() {
        let halt = Halter::new();
        assert_eq!(halt.state(), HaltState::Running);

        halt.request_stop();
        halt.request_stop();
        assert_eq!(halt.state(), HaltState::StopRequested);

        halt.mark_done();
        assert_eq!(halt.state(), HaltState::Stopped);
    }

    #[test]
    fn test_mark_done_implies_stop() {
        let halt = Halter::new();
        halt.mark_done();
        assert!(halt.is_stop_requested());
    }

    #[tokio::test]
    async fn test_stop_is_broadcast() {
        let halt = Halter::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let halt = halt.clone();
                tokio::spawn(async move { halt.stop_requested().await })
            })
            .collect();

        halt.request_stop();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter not released")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_shutdown_reports_cause() {
        let closed = CancellationToken::new();
        let cancel = CancellationToken::new();
        let shutdown = Shutdown::new(Halter::new(), closed.clone(), cancel.clone());
        assert_eq!(shutdown.cause(), None);

        cancel.cancel();
        assert_eq!(shutdown.cancelled().await, ShutdownCause::Cancelled);
        assert!(shutdown.is_shutdown());

        let shutdown = Shutdown::new(Halter::new(), closed.clone(), CancellationToken::new());
        closed.cancel();
        assert_eq!(shutdown.cancelled().await, ShutdownCause::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_shutdown_from_halter() {
        let halt = Halter::new();
        let shutdown = Shutdown::from_halter(halt.clone());
        halt.request_stop();
        assert_eq!(shutdown.cancelled().await, ShutdownCause::Halted);
        assert_eq!(shutdown.cause(), Some(ShutdownCause::Halted));
    }
}
