//! Cancellable background work owned by a session.
//!
//! A [`ScheduledTask`] aborts its task when dropped, so replacing or
//! clearing the field that holds it is enough to cancel the work.

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Delivers `msg` on `tx` once, after `delay`.
    pub fn after<T>(delay: Duration, tx: mpsc::UnboundedSender<T>, msg: T) -> Self
    where
        T: Send + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        })
    }

    /// Delivers `make()` on `tx` every `period`, the first one immediately.
    /// Stops on its own once the receiver is gone.
    pub fn every<T, F>(period: Duration, tx: mpsc::UnboundedSender<T>, mut make: F) -> Self
    where
        T: Send + 'static,
        F: FnMut() -> T + Send + 'static,
    {
        Self::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(make()).is_err() {
                    return;
                }
            }
        })
    }

    /// Like [`every`](Self::every) but the first delivery waits one period.
    pub fn every_after<T, F>(period: Duration, tx: mpsc::UnboundedSender<T>, mut make: F) -> Self
    where
        T: Send + 'static,
        F: FnMut() -> T + Send + 'static,
    {
        Self::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if tx.send(make()).is_err() {
                    return;
                }
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(self) {}
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
