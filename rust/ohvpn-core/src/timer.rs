//! Cancels a flow after a period without traffic

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct TimerState {
    token: CancellationToken,
    activity: AtomicBool,
    timeout: Mutex<Duration>,
    rearm: Notify,
}

/// Handle shared by both copy directions of a flow.
#[derive(Clone)]
pub struct ActivityTimer {
    state: Arc<TimerState>,
}

impl ActivityTimer {
    /// Cancel `token` once a whole `timeout` period passes without
    /// [`update`](Self::update).
    pub fn cancel_after_inactivity(token: CancellationToken, timeout: Duration) -> Self {
        let state = Arc::new(TimerState {
            token,
            activity: AtomicBool::new(false),
            timeout: Mutex::new(timeout),
            rearm: Notify::new(),
        });

        if timeout.is_zero() {
            state.token.cancel();
        } else {
            tokio::spawn(check(state.clone()));
        }

        Self { state }
    }

    pub fn update(&self) {
        self.state.activity.store(true, Ordering::Relaxed);
    }

    /// Replace the period; zero cancels immediately.
    pub fn set_timeout(&self, timeout: Duration) {
        if timeout.is_zero() {
            self.state.token.cancel();
            return;
        }
        *self.state.timeout.lock() = timeout;
        self.update();
        self.state.rearm.notify_one();
    }

    pub fn timeout(&self) -> Duration {
        *self.state.timeout.lock()
    }

    pub fn is_expired(&self) -> bool {
        self.state.token.is_cancelled()
    }
}

async fn check(state: Arc<TimerState>) {
    loop {
        let period = *state.timeout.lock();
        tokio::select! {
            _ = state.token.cancelled() => return,
            _ = state.rearm.notified() => continue,
            _ = tokio::time::sleep(period) => {}
        }

        if !state.activity.swap(false, Ordering::Relaxed) {
            tracing::trace!("no activity for {:?}, cancelling flow", period);
            state.token.cancel();
            return;
        }
    }
}
