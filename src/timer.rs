//! Delayed-call scheduling for the control loop.
//!
//! Exposure tasks never sleep inline: every delayed state transition is a
//! message posted back onto the control loop's channel by a timer task.
//! [`DelayedCall`] fires once at a deadline, [`RepeatingCall`] fires at a
//! fixed period. Both abort their timer task on [`cancel`](DelayedCall::cancel)
//! or drop, so a torn-down task can never receive a stale callback.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// A one-shot message delivery at a deadline.
#[derive(Debug)]
pub struct DelayedCall {
    handle: JoinHandle<()>,
}

impl DelayedCall {
    /// Posts `message` on `tx` at `deadline`.
    pub fn at<M: Send + 'static>(
        deadline: Instant,
        tx: mpsc::UnboundedSender<M>,
        message: M,
    ) -> Self {
        let handle = tokio::spawn(async move {
            time::sleep_until(deadline).await;
            let _ = tx.send(message);
        });
        Self { handle }
    }

    /// Posts `message` on `tx` after `delay`.
    pub fn after<M: Send + 'static>(
        delay: Duration,
        tx: mpsc::UnboundedSender<M>,
        message: M,
    ) -> Self {
        Self::at(Instant::now() + delay, tx, message)
    }

    /// Cancels the pending delivery. Idempotent; a message already posted
    /// stays in the channel.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for DelayedCall {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A periodic message delivery at a fixed period.
#[derive(Debug)]
pub struct RepeatingCall {
    handle: JoinHandle<()>,
}

impl RepeatingCall {
    /// Posts a clone of `message` on `tx` every `period`, starting one
    /// period from now. Stops when the receiver is gone.
    pub fn every<M: Clone + Send + 'static>(
        period: Duration,
        tx: mpsc::UnboundedSender<M>,
        message: M,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tx.send(message.clone()).is_err() {
                    break;
                }
            }
        });
        Self { handle }
    }

    /// Stops the periodic delivery. Idempotent.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for RepeatingCall {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
