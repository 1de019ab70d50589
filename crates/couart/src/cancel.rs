//! Cancellation plumbing: a fire-once token observed by queue reads and
//! notify loops, plus the per-request deadline watcher.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use maitake_sync::WaitQueue;
use tokio::select;
use tokio::time::sleep;

/// A logical cancel signal for one request.
///
/// Cloning shares the signal. Firing is one-way and idempotent; waiters
/// are woken by closing the underlying wait queue, the same way the
/// serial workers' closers operate.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    fired: AtomicBool,
    waiters: WaitQueue,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Fires the signal, unblocking every waiter now and in the future.
    pub fn cancel(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.waiters.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Completes once the signal has fired.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // The queue is only ever closed, never woken, so this returns
        // exactly when `cancel` runs.
        let _ = self.inner.waiters.wait().await;
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Idempotent stop handle for a running deadline watcher.
#[derive(Clone)]
pub(crate) struct StopTimer {
    stopped: Arc<WaitQueue>,
}

impl StopTimer {
    fn new() -> StopTimer {
        StopTimer {
            stopped: Arc::new(WaitQueue::new()),
        }
    }

    pub(crate) fn stop(&self) {
        self.stopped.close();
    }

    async fn stopped(&self) {
        let _ = self.stopped.wait().await;
    }
}

/// Spawns the deadline watcher for one request: fires `cancel` when the
/// timeout elapses or the user's own signal fires, whichever comes
/// first. The returned handle stops the timer without cancelling.
pub(crate) fn spawn_deadline_watcher(
    timeout: Duration,
    user: Option<CancelToken>,
    cancel: CancelToken,
) -> StopTimer {
    let stop = StopTimer::new();
    let watcher_stop = stop.clone();
    tokio::spawn(async move {
        let user_cancelled = async {
            match &user {
                Some(u) => u.cancelled().await,
                None => std::future::pending().await,
            }
        };
        select! {
            _ = sleep(timeout) => cancel.cancel(),
            _ = user_cancelled => cancel.cancel(),
            _ = watcher_stop.stopped() => {}
        }
    });
    stop
}
