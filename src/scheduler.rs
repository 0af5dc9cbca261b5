//! Cancellable timer tasks for state machines
//!
//! Connection backoff and poll cadence both need timers that can be replaced
//! without leaking a pending callback. A [`ScheduledTask`] owns the tokio task
//! driving its timer and aborts it on drop, so storing a new task in the same
//! slot cancels the superseded one.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};

/// Handle to a pending one-shot or repeating timer.
///
/// The timer delivers messages into an `mpsc` channel instead of running a
/// callback, which keeps all state transitions on the owning component's
/// message loop. Dropping the handle aborts the timer.
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Arm a one-shot timer that sends `msg` after `delay`
    pub fn once<M>(delay: Duration, tx: UnboundedSender<M>, msg: M) -> Self
    where
        M: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(msg);
        });
        Self { handle }
    }

    /// Arm a repeating timer that sends `make()` every `period`.
    ///
    /// The first message is sent immediately; the task ends on its own once
    /// the receiving side is gone.
    pub fn repeating<M, F>(period: Duration, tx: UnboundedSender<M>, make: F) -> Self
    where
        M: Send + 'static,
        F: Fn() -> M + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(make()).is_err() {
                    break;
                }
            }
        });
        Self { handle }
    }

    /// Whether the timer already fired (one-shot) or ended
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the timer explicitly; equivalent to dropping the handle
    pub fn cancel(self) {}
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
