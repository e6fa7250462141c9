//! Drops a session's connection after a window of inactivity.
//!
//! The timer runs as a tokio task while the session is idle. A command stops
//! it on entry and restarts it on exit. On every tick the task takes the
//! session's run-lock and re-checks the idle time, so a command that started
//! after the tick was scheduled always wins.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// What the idle timer needs from a session.
pub(crate) trait IdleTarget: Send + Sync + 'static {
    /// The lock held by running commands.
    fn run_lock(&self) -> &tokio::sync::Mutex<()>;

    /// Time since the last command finished.
    fn idle_for(&self) -> Duration;

    /// Drops the connection. Called with the run-lock held.
    fn disconnect_idle(&self);
}

#[derive(Debug, Default)]
pub(crate) struct IdleDisconnectTimer {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IdleDisconnectTimer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops the timer if it is running.
    pub(crate) fn stop(&self) {
        if let Some(task) = self.task().take() {
            task.abort();
        }
    }

    /// Returns `true` while a timer task is scheduled.
    pub(crate) fn is_running(&self) -> bool {
        self.task().as_ref().is_some_and(|task| !task.is_finished())
    }

    /// (Re)starts the timer with `window`.
    ///
    /// Does nothing outside a tokio runtime.
    pub(crate) fn restart<T: IdleTarget>(&self, target: Weak<T>, window: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime; idle disconnect timer not started");
            return;
        };
        let task = runtime.spawn(watch(target, window));
        if let Some(previous) = self.task().replace(task) {
            previous.abort();
        }
    }
}

impl Drop for IdleDisconnectTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch<T: IdleTarget>(target: Weak<T>, window: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + window, window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(target) = target.upgrade() else {
            return;
        };
        if fire(&target, window).await {
            return;
        }
    }
}

/// Runs one tick. Returns `true` if the connection was dropped.
async fn fire<T: IdleTarget>(target: &Arc<T>, window: Duration) -> bool {
    let _running = target.run_lock().lock().await;
    let idle_for = target.idle_for();
    if idle_for < window {
        debug!(?idle_for, "idle timer fired after recent activity; skipping");
        return false;
    }
    debug!(?idle_for, "session idle; disconnecting");
    target.disconnect_idle();
    true
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSession {
        run_lock: tokio::sync::Mutex<()>,
        last_activity: Mutex<Instant>,
        disconnects: AtomicUsize,
    }

    impl FakeSession {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                run_lock: tokio::sync::Mutex::new(()),
                last_activity: Mutex::new(Instant::now()),
                disconnects: AtomicUsize::new(0),
            })
        }

        fn touch(&self) {
            *self.last_activity.lock().unwrap() = Instant::now();
        }
    }

    impl IdleTarget for FakeSession {
        fn run_lock(&self) -> &tokio::sync::Mutex<()> {
            &self.run_lock
        }

        fn idle_for(&self) -> Duration {
            self.last_activity.lock().unwrap().elapsed()
        }

        fn disconnect_idle(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn run_async<T>(f: impl std::future::Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn disconnects_after_window() {
        run_async(async {
            let session = FakeSession::new();
            let timer = IdleDisconnectTimer::new();
            timer.restart(Arc::downgrade(&session), Duration::from_millis(20));
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert_eq!(session.disconnects.load(Ordering::SeqCst), 1);
            assert!(!timer.is_running());
        });
    }

    #[test]
    fn stop_prevents_disconnect() {
        run_async(async {
            let session = FakeSession::new();
            let timer = IdleDisconnectTimer::new();
            timer.restart(Arc::downgrade(&session), Duration::from_millis(20));
            timer.stop();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(session.disconnects.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn command_holding_run_lock_defers_and_cancels_disconnect() {
        run_async(async {
            let session = FakeSession::new();
            let timer = IdleDisconnectTimer::new();
            timer.restart(Arc::downgrade(&session), Duration::from_millis(20));

            // A "command" grabs the run-lock before the tick and refreshes
            // activity before releasing it.
            let guard = session.run_lock.lock().await;
            tokio::time::sleep(Duration::from_millis(40)).await;
            session.touch();
            drop(guard);

            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(session.disconnects.load(Ordering::SeqCst), 0);
            assert!(timer.is_running());
        });
    }

    #[test]
    fn dropped_session_ends_the_task() {
        run_async(async {
            let session = FakeSession::new();
            let timer = IdleDisconnectTimer::new();
            timer.restart(Arc::downgrade(&session), Duration::from_millis(10));
            drop(session);
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(!timer.is_running());
        });
    }

    #[test]
    fn restart_outside_runtime_is_a_no_op() {
        let session = FakeSession::new();
        let timer = IdleDisconnectTimer::new();
        timer.restart(Arc::downgrade(&session), Duration::from_millis(10));
        assert!(!timer.is_running());
    }
}
