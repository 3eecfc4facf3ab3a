//! Retransmit timer management.
//!
//! Reliable delivery requires that an unacknowledged message is re-sent if no
//! ack arrives within a bounded time.  [`RetransmitTimer`] is a cooperative
//! timer for one directed link: the link worker arms it after every
//! transmission, cancels it when the matching ack arrives, and awaits
//! [`RetransmitTimer::fired`] inside its `select!` loop.
//!
//! The timeout is fixed (no back-off) and retries are unbounded: a peer that
//! is down only delays completion of that link's pending send.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep_until, Instant, Sleep};

/// Default ack timeout.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// A re-armable one-shot timer.
#[derive(Debug)]
pub struct RetransmitTimer {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl RetransmitTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(sleep_until(Instant::now() + timeout)),
            armed: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Arm (or re-arm) the timer to fire one timeout from now.
    pub fn arm(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.timeout);
        self.armed = true;
    }

    /// Disarm the timer.  A pending [`fired`](Self::fired) never completes.
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// Resolves when the armed deadline passes, then disarms.
    ///
    /// Cancel-safe: dropping the future before it completes leaves the timer
    /// armed with the same deadline.
    pub async fn fired(&mut self) {
        if !self.armed {
            pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}
