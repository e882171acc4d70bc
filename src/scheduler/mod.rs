use futures::future::BoxFuture;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    select,
    task::JoinHandle,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};


pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct TimerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TimerHandle {
    fn stop(&self) {
        self.token.cancel();
    }
}

/// Named, cancellable timers. Registering a name again replaces the
/// previous timer with that name.
pub struct Scheduler {
    token: CancellationToken,
    timers: Mutex<HashMap<String, TimerHandle>>,
}

impl Scheduler {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `task` every `period`, the first run after `initial_delay`.
    /// A run that overlaps the next tick delays it instead of stacking up.
    pub fn every(&self, name: &str, initial_delay: Duration, period: Duration, task: TaskFn) {
        let token = self.token.child_token();
        let timer_token = token.clone();
        let timer_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                select! {
                    _ = timer_token.cancelled() => {
                        debug!(name = timer_name, "periodic timer cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        if timer_token.is_cancelled() {
                            break;
                        }
                        select! {
                            _ = timer_token.cancelled() => break,
                            _ = task() => {}
                        }
                    }
                }
            }
        });
        self.install(name, TimerHandle { token, handle });
    }

    /// Runs `task` once after `delay`.
    pub fn after(&self, name: &str, delay: Duration, task: TaskFn) {
        let token = self.token.child_token();
        let timer_token = token.clone();
        let handle = tokio::spawn(async move {
            select! {
                _ = timer_token.cancelled() => {}
                _ = sleep(delay) => {
                    if !timer_token.is_cancelled() {
                        task().await;
                    }
                }
            }
        });
        self.install(name, TimerHandle { token, handle });
    }

    fn install(&self, name: &str, timer: TimerHandle) {
        if let Ok(mut timers) = self.timers.lock() {
            timers.retain(|_, t| !t.handle.is_finished());
            if let Some(previous) = timers.insert(name.to_string(), timer) {
                previous.stop();
            }
        }
    }

    pub fn cancel(&self, name: &str) -> bool {
        let removed = self
            .timers
            .lock()
            .ok()
            .and_then(|mut timers| timers.remove(name));
        match removed {
            Some(timer) => {
                timer.stop();
                debug!(name, "timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.timers
            .lock()
            .map(|timers| timers.get(name).is_some_and(|t| !t.handle.is_finished()))
            .unwrap_or(false)
    }

    pub fn cancel_all(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            let count = timers.len();
            for (_, timer) in timers.drain() {
                timer.stop();
            }
            info!(count, "all timers cancelled");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
