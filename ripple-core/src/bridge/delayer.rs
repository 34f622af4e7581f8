//! Update Delayer
//!
//! Turns a burst of invalidation signals into a single push.
//!
//! ```text
//!   Idle ──signal──▶ PendingPush ──delay elapsed──▶ Pushed ──push done──▶ Idle
//!                      ▲    │                         │
//!                      │  signal (coalesced)        signal
//!                      │                              ▼
//!                      └──────────── push done, re-armed ◀──┘
//! ```
//!
//! The window is fixed: it starts at the first signal and later signals
//! never extend it. A signal that arrives while a push is in progress
//! cannot be served by that push (it may already have read the value), so
//! it arms exactly one more window once the push finishes.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::config::DelayPolicy;

/// Action run when a window closes.
pub type PushFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Where a delayer is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelayerState {
    /// No push is scheduled.
    Idle,
    /// A window is open; the push runs when it closes.
    PendingPush,
    /// The push is running.
    Pushed,
}

struct Slot {
    state: DelayerState,
    rearm: bool,
    cancelled: bool,
    task: Option<AbortHandle>,
}

/// Per-channel push throttle.
pub struct UpdateDelayer {
    policy: DelayPolicy,
    runtime: Handle,
    push: PushFn,
    slot: Mutex<Slot>,
}

impl UpdateDelayer {
    /// Create a delayer whose timers run on `runtime`.
    ///
    /// Signals may come from any thread, including ones outside the
    /// runtime.
    pub fn new<F, Fut>(policy: DelayPolicy, runtime: Handle, push: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let push: PushFn = Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(push()) });
        Arc::new(Self {
            policy,
            runtime,
            push,
            slot: Mutex::new(Slot {
                state: DelayerState::Idle,
                rearm: false,
                cancelled: false,
                task: None,
            }),
        })
    }

    pub fn policy(&self) -> DelayPolicy {
        self.policy
    }

    pub fn state(&self) -> DelayerState {
        self.slot.lock().state
    }

    /// Report that the published value changed.
    ///
    /// Returns `true` if this signal opened a new window.
    pub fn signal(self: &Arc<Self>) -> bool {
        let mut slot = self.slot.lock();
        if slot.cancelled {
            return false;
        }

        match slot.state {
            DelayerState::Idle => {
                slot.state = DelayerState::PendingPush;
                let task = self.runtime.spawn(Self::run(Arc::downgrade(self)));
                slot.task = Some(task.abort_handle());
                trace!(delay = ?self.policy.delay(), "push window opened");
                true
            }
            DelayerState::PendingPush => {
                trace!("signal coalesced into open window");
                false
            }
            DelayerState::Pushed => {
                slot.rearm = true;
                trace!("signal during push, re-arming");
                false
            }
        }
    }

    /// Disarm for good. Pending pushes are dropped and later signals are
    /// ignored.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        slot.cancelled = true;
        slot.rearm = false;
        slot.state = DelayerState::Idle;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
    }

    async fn run(delayer: Weak<Self>) {
        loop {
            let policy = match delayer.upgrade() {
                Some(delayer) => delayer.policy,
                None => return,
            };
            policy.wait().await;

            let Some(delayer) = delayer.upgrade() else {
                return;
            };
            let push = {
                let mut slot = delayer.slot.lock();
                if slot.cancelled {
                    return;
                }
                slot.state = DelayerState::Pushed;
                Arc::clone(&delayer.push)
            };

            push().await;

            let again = {
                let mut slot = delayer.slot.lock();
                if std::mem::take(&mut slot.rearm) && !slot.cancelled {
                    slot.state = DelayerState::PendingPush;
                    true
                } else {
                    if !slot.cancelled {
                        slot.state = DelayerState::Idle;
                    }
                    slot.task = None;
                    false
                }
            };
            if !again {
                return;
            }
        }
    }
}

impl Drop for UpdateDelayer {
    fn drop(&mut self) {
        if let Some(task) = self.slot.get_mut().task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for UpdateDelayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateDelayer")
            .field("policy", &self.policy)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::sleep;

    fn counting(policy: DelayPolicy, pushes: &Arc<AtomicI32>) -> Arc<UpdateDelayer> {
        let pushes = pushes.clone();
        UpdateDelayer::new(policy, Handle::current(), move || {
            let pushes = pushes.clone();
            async move {
                pushes.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn signals_within_a_window_coalesce() {
        let pushes = Arc::new(AtomicI32::new(0));
        let delayer = counting(DelayPolicy::from_millis(500), &pushes);

        assert!(delayer.signal());
        sleep(Duration::from_millis(100)).await;
        assert!(!delayer.signal());
        sleep(Duration::from_millis(100)).await;
        assert!(!delayer.signal());

        assert_eq!(pushes.load(Ordering::SeqCst), 0);
        assert_eq!(delayer.state(), DelayerState::PendingPush);

        // The window closes 500ms after the first signal, not the last.
        sleep(Duration::from_millis(301)).await;
        assert_eq!(pushes.load(Ordering::SeqCst), 1);
        assert_eq!(delayer.state(), DelayerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_pushes_every_signal() {
        let pushes = Arc::new(AtomicI32::new(0));
        let delayer = counting(DelayPolicy::immediate(), &pushes);

        for expected in 1..=3 {
            assert!(delayer.signal());
            sleep(Duration::from_millis(1)).await;
            assert_eq!(pushes.load(Ordering::SeqCst), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn signal_during_push_arms_one_more_window() {
        let pushes = Arc::new(AtomicI32::new(0));
        let gate = Arc::new(Notify::new());
        let delayer = {
            let pushes = pushes.clone();
            let gate = gate.clone();
            UpdateDelayer::new(DelayPolicy::from_millis(10), Handle::current(), move || {
                let pushes = pushes.clone();
                let gate = gate.clone();
                async move {
                    pushes.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                }
            })
        };

        delayer.signal();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(delayer.state(), DelayerState::Pushed);

        assert!(!delayer.signal());
        assert!(!delayer.signal());
        gate.notify_one();
        sleep(Duration::from_millis(5)).await;
        assert_eq!(delayer.state(), DelayerState::PendingPush);
        assert_eq!(pushes.load(Ordering::SeqCst), 1);

        gate.notify_one();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(pushes.load(Ordering::SeqCst), 2);
        assert_eq!(delayer.state(), DelayerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_push() {
        let pushes = Arc::new(AtomicI32::new(0));
        let delayer = counting(DelayPolicy::from_millis(50), &pushes);

        delayer.signal();
        delayer.cancel();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(pushes.load(Ordering::SeqCst), 0);
        assert!(!delayer.signal());
        assert_eq!(delayer.state(), DelayerState::Idle);
    }
}
