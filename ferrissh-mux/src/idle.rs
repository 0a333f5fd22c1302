//! Idle timer used to detect stalled readers.
//!
//! The timer tracks the instant of the last consumer activity. Once the
//! configured interval passes without a [`reset`](IdleTimer::reset), the
//! next call to [`timed_out`](IdleTimer::timed_out) resolves with a reason
//! string. Each expiry is delivered once: consuming it re-arms the timer.

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::Notify;
use tokio::time::Instant;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Liveness watchdog shared by the buffers of one channel.
#[derive(Debug)]
pub struct IdleTimer {
    id: u64,
    state: Mutex<IdleState>,
    changed: Notify,
}

#[derive(Debug)]
struct IdleState {
    timeout: Option<Duration>,
    last_reset: Instant,
}

impl IdleTimer {
    /// Create a timer that expires after `timeout` without a reset.
    ///
    /// `None` or a zero duration disables the timer.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(IdleState {
                timeout: timeout.filter(|t| !t.is_zero()),
                last_reset: Instant::now(),
            }),
            changed: Notify::new(),
        }
    }

    /// A timer that never expires.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Identifier used in timeout errors.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The configured interval.
    pub fn timeout(&self) -> Option<Duration> {
        self.lock().timeout
    }

    /// Time since the last reset.
    pub fn idle_for(&self) -> Duration {
        self.lock().last_reset.elapsed()
    }

    /// Record activity. A pending expiry that has not been consumed yet
    /// is cancelled.
    pub fn reset(&self) {
        self.lock().last_reset = Instant::now();
        self.changed.notify_waiters();
    }

    /// Change the interval and restart the countdown.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        {
            let mut state = self.lock();
            state.timeout = timeout.filter(|t| !t.is_zero());
            state.last_reset = Instant::now();
        }
        self.changed.notify_waiters();
    }

    /// Resolves with a reason once the timer expires.
    ///
    /// The expiry is checked against the latest reset at the moment it is
    /// consumed, so a reset racing with the deadline always wins. Only one
    /// of several concurrent waiters consumes a given expiry.
    pub async fn timed_out(&self) -> String {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                match state.timeout {
                    None => None,
                    Some(timeout) => {
                        let deadline = state.last_reset + timeout;
                        let now = Instant::now();
                        if now >= deadline {
                            state.last_reset = now;
                            return format!("idle for more than {timeout:?}");
                        }
                        Some(deadline)
                    }
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = &mut changed => {}
                    }
                }
                None => changed.await,
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, IdleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for IdleTimer {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Error surfaced to a reader whose idle timer expired.
///
/// Timeouts are transient: the buffer stays readable and a later read may
/// succeed.
pub struct IdleTimeout {
    reason: String,
    timer: u64,
    when: SystemTime,
    stack: Backtrace,
}

impl IdleTimeout {
    /// Build the error, capturing the current call stack.
    pub fn new(reason: impl Into<String>, timer: &IdleTimer) -> Self {
        Self {
            reason: reason.into(),
            timer: timer.id(),
            when: SystemTime::now(),
            stack: Backtrace::force_capture(),
        }
    }

    /// Human readable reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Id of the timer that expired.
    pub fn timer_id(&self) -> u64 {
        self.timer
    }

    /// When the error was constructed.
    pub fn when(&self) -> SystemTime {
        self.when
    }

    /// Call stack at construction.
    pub fn stack(&self) -> &Backtrace {
        &self.stack
    }

    /// Always true.
    pub fn is_timeout(&self) -> bool {
        true
    }

    /// Always true; retrying the read is allowed.
    pub fn is_temporary(&self) -> bool {
        true
    }
}

impl fmt::Display for IdleTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timeout: {}, from idle timer {}, generated at {:?}",
            self.reason, self.timer, self.when
        )
    }
}

impl std::error::Error for IdleTimeout {}

impl fmt::Debug for IdleTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}. stack=\n{}\n", self.stack)
    }
}
