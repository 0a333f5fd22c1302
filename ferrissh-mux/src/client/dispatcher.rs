//! Routing of inbound channel opens and global requests.
//!
//! The registry maps a channel type to the queue of the consumer handling
//! it. It lives behind one mutex that is never held across an await: the
//! channel loop looks the queue up under the lock and forwards outside it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use log::{debug, trace};
use tokio::sync::mpsc;

use crate::error::DispatchError;
use crate::halt::Shutdown;
use crate::mux::{NewChannel, RejectReason, Request};

/// Capacity of each handler queue.
pub const CHANNEL_QUEUE_SIZE: usize = 16;

type Registry = HashMap<String, mpsc::Sender<NewChannel>>;

/// Lifecycle of a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Routing events.
    Active,
    /// A shutdown signal fired; loops are exiting.
    Draining,
    /// The registry was cleared and every handler queue closed.
    Stopped,
}

/// Handler registry plus the two serving loops.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Mutex<Option<Registry>>>,
    shutdown: Shutdown,
}

impl Dispatcher {
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Some(HashMap::new()))),
            shutdown,
        }
    }

    /// Register the consumer of `channel_type` opens.
    ///
    /// After shutdown the returned queue is already closed. A type can be
    /// registered once per connection.
    pub fn handle_channel_open(
        &self,
        channel_type: &str,
    ) -> Result<mpsc::Receiver<NewChannel>, DispatchError> {
        let mut guard = lock(&self.registry);
        let Some(registry) = guard.as_mut() else {
            debug!("dispatcher: {} registered after shutdown", channel_type);
            return Ok(closed_queue());
        };
        if registry.contains_key(channel_type) {
            return Err(DispatchError::AlreadyHandled {
                channel_type: channel_type.to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE_SIZE);
        registry.insert(channel_type.to_string(), tx);
        debug!("dispatcher: handling {} channels", channel_type);
        Ok(rx)
    }

    /// Decline every global request until shutdown or end of stream.
    pub async fn serve_global_requests(&self, mut requests: mpsc::Receiver<Request>) {
        loop {
            tokio::select! {
                cause = self.shutdown.cancelled() => {
                    debug!("dispatcher: request loop stopping: {}", cause);
                    return;
                }
                request = requests.recv() => match request {
                    Some(request) => {
                        trace!("dispatcher: declining global request {}", request.kind());
                        request.reply(false, Bytes::new());
                    }
                    None => {
                        debug!("dispatcher: request loop stopping: connection closed");
                        return;
                    }
                },
            }
        }
    }

    /// Route channel opens to their handlers until shutdown or end of
    /// stream. The registry is cleared on exit.
    pub async fn serve_channel_opens(&self, mut channels: mpsc::Receiver<NewChannel>) {
        let _closer = RegistryCloser(self.registry.clone());
        loop {
            let channel = tokio::select! {
                cause = self.shutdown.cancelled() => {
                    debug!("dispatcher: channel loop stopping: {}", cause);
                    return;
                }
                channel = channels.recv() => match channel {
                    Some(channel) => channel,
                    None => {
                        debug!("dispatcher: channel loop stopping: connection closed");
                        return;
                    }
                },
            };
            if !self.route(channel).await {
                return;
            }
        }
    }

    /// Returns false if shutdown interrupted the hand-off.
    async fn route(&self, channel: NewChannel) -> bool {
        let handler = lock(&self.registry)
            .as_ref()
            .and_then(|registry| registry.get(channel.channel_type()).cloned());

        let Some(handler) = handler else {
            let message = format!("unknown channel type: {}", channel.channel_type());
            channel.reject(RejectReason::UnknownChannelType, message);
            return true;
        };

        trace!("dispatcher: routing {} channel", channel.channel_type());
        tokio::select! {
            cause = self.shutdown.cancelled() => {
                debug!("dispatcher: hand-off interrupted: {}", cause);
                false
            }
            res = handler.send(channel) => {
                if let Err(mpsc::error::SendError(channel)) = res {
                    channel.reject(RejectReason::Prohibited, "channel handler is gone");
                }
                true
            }
        }
    }

    pub fn state(&self) -> DispatcherState {
        if lock(&self.registry).is_none() {
            DispatcherState::Stopped
        } else if self.shutdown.is_shutdown() {
            DispatcherState::Draining
        } else {
            DispatcherState::Active
        }
    }
}

/// Clears the registry when the channel loop exits, however it exits.
struct RegistryCloser(Arc<Mutex<Option<Registry>>>);

impl Drop for RegistryCloser {
    fn drop(&mut self) {
        if let Some(registry) = lock(&self.0).take() {
            debug!("dispatcher: closing {} handler queues", registry.len());
        }
    }
}

/// A queue whose sender is already gone.
pub(crate) fn closed_queue<T>() -> mpsc::Receiver<T> {
    let (_, rx) = mpsc::channel(1);
    rx
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::halt::{Halter, ShutdownCause};
    use crate::mux::testing::{Outcome, channel, new_log};
    use crate::mux::{FORWARDED_TCPIP, Mux, SESSION, X11};

    fn dispatcher() -> (Halter, Dispatcher) {
        let halt = Halter::new();
        (halt.clone(), Dispatcher::new(Shutdown::from_halter(halt)))
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_refused() {
        let (_halt, d) = dispatcher();
        let _rx = d.handle_channel_open(X11).unwrap();
        assert!(matches!(
            d.handle_channel_open(X11),
            Err(DispatchError::AlreadyHandled { channel_type }) if channel_type == X11
        ));
    }

    #[tokio::test]
    async fn test_routes_by_type_and_rejects_unknown() {
        let (_halt, d) = dispatcher();
        let (mux, streams) = Mux::new();
        let mut x11 = d.handle_channel_open(X11).unwrap();

        let loop_b = {
            let d = d.clone();
            tokio::spawn(async move { d.serve_channel_opens(streams.channels).await })
        };

        let log = new_log();
        mux.deliver_channel(channel(X11, "x", &log)).await;
        mux.deliver_channel(channel("mystery", "m", &log)).await;

        let got = x11.recv().await.unwrap();
        assert_eq!(got.channel_type(), X11);
        got.reject(RejectReason::Prohibited, "no display");

        mux.close();
        loop_b.await.unwrap();

        let log = log.lock().unwrap();
        assert!(log.contains(&Outcome::Rejected(
            "m".into(),
            RejectReason::UnknownChannelType,
            "unknown channel type: mystery".into()
        )));
        assert!(log.contains(&Outcome::Rejected(
            "x".into(),
            RejectReason::Prohibited,
            "no display".into()
        )));
    }

    #[tokio::test]
    async fn test_every_event_reaches_exactly_one_consumer() {
        let (_halt, d) = dispatcher();
        let (mux, streams) = Mux::new();
        let mut sessions = d.handle_channel_open(SESSION).unwrap();
        let loop_b = {
            let d = d.clone();
            tokio::spawn(async move { d.serve_channel_opens(streams.channels).await })
        };

        let log = new_log();
        let consumer = tokio::spawn(async move {
            let mut seen = 0;
            while let Some(ch) = sessions.recv().await {
                ch.reject(RejectReason::Prohibited, "seen");
                seen += 1;
            }
            seen
        });

        for i in 0..40 {
            let ty = if i % 4 == 0 { "bogus" } else { SESSION };
            mux.deliver_channel(channel(ty, &i.to_string(), &log)).await;
        }
        mux.close();
        loop_b.await.unwrap();
        assert_eq!(consumer.await.unwrap(), 30);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 40);
        for i in 0..40 {
            let hits = log
                .iter()
                .filter(|o| matches!(o, Outcome::Rejected(l, _, _) if *l == i.to_string()))
                .count();
            assert_eq!(hits, 1, "event {i}");
        }
    }

    #[tokio::test]
    async fn test_dropped_handler_rejects_with_prohibited() {
        let (_halt, d) = dispatcher();
        let (mux, streams) = Mux::new();
        drop(d.handle_channel_open(FORWARDED_TCPIP).unwrap());
        let loop_b = {
            let d = d.clone();
            tokio::spawn(async move { d.serve_channel_opens(streams.channels).await })
        };

        let log = new_log();
        mux.deliver_channel(channel(FORWARDED_TCPIP, "f", &log)).await;
        mux.close();
        loop_b.await.unwrap();

        assert!(matches!(
            log.lock().unwrap()[0],
            Outcome::Rejected(_, RejectReason::Prohibited, _)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry() {
        let (halt, d) = dispatcher();
        let (_mux, streams) = Mux::new();
        let mut rx = d.handle_channel_open(SESSION).unwrap();
        assert_eq!(d.state(), DispatcherState::Active);

        let loop_b = {
            let d = d.clone();
            tokio::spawn(async move { d.serve_channel_opens(streams.channels).await })
        };
        halt.request_stop();
        tokio::time::timeout(Duration::from_secs(1), loop_b)
            .await
            .expect("channel loop did not stop")
            .unwrap();

        assert_eq!(d.state(), DispatcherState::Stopped);
        assert!(rx.recv().await.is_none());

        // late registrations get a closed queue
        let mut late = d.handle_channel_open(X11).unwrap();
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_global_requests_are_declined() {
        let cancel = CancellationToken::new();
        let shutdown = Shutdown::new(Halter::new(), CancellationToken::new(), cancel.clone());
        let d = Dispatcher::new(shutdown.clone());
        let (mux, streams) = Mux::new();
        let loop_a = {
            let d = d.clone();
            tokio::spawn(async move { d.serve_global_requests(streams.requests).await })
        };

        let (request, reply) = Request::new("keepalive@openssh.com", true, Bytes::new());
        mux.deliver_request(request).await;
        let reply = reply.await.unwrap();
        assert!(!reply.handled);

        cancel.cancel();
        loop_a.await.unwrap();
        assert_eq!(shutdown.cause(), Some(ShutdownCause::Cancelled));
        assert_eq!(d.state(), DispatcherState::Draining);
    }

    #[tokio::test]
    async fn test_blocked_hand_off_unblocks_on_halt() {
        let (halt, d) = dispatcher();
        let (mux, streams) = Mux::new();
        let _full = d.handle_channel_open(SESSION).unwrap();
        let loop_b = {
            let d = d.clone();
            tokio::spawn(async move { d.serve_channel_opens(streams.channels).await })
        };

        // fill the handler queue and leave one more in flight
        let log = new_log();
        for i in 0..=CHANNEL_QUEUE_SIZE {
            mux.deliver_channel(channel(SESSION, &i.to_string(), &log)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!loop_b.is_finished());

        halt.request_stop();
        tokio::time::timeout(Duration::from_secs(1), loop_b)
            .await
            .expect("channel loop stayed blocked")
            .unwrap();
    }
}
