//! Periodic cycle loops with a stop signal.
//!
//! A daemon runs one cycle to completion, then sleeps for its interval or
//! until shutdown is signalled. A failing cycle is logged (and optionally
//! mailed) and the loop carries on.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::CYCLE_DURATION;
use crate::notify::Notifications;

/// Spawn a task that runs `cycle` every `interval` until `shutdown` fires.
pub fn spawn_cycle_loop<F, Fut, E>(
    name: &'static str,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
    notifications: Notifications,
    mut cycle: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        info!("{} loop started", name);
        loop {
            let started = Instant::now();
            let result = cycle().await;
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(()) => {
                    CYCLE_DURATION.with_label_values(&[name, "ok"]).observe(elapsed);
                    debug!("{} cycle finished in {:.2}s", name, elapsed);
                }
                Err(e) => {
                    CYCLE_DURATION
                        .with_label_values(&[name, "error"])
                        .observe(elapsed);
                    let message = e.to_string();
                    error!("{} cycle failed: {}", name, message);
                    notifications.crash(name, &message).await;
                }
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("{} loop received shutdown signal", name);
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("{} loop stopped", name);
    })
}

/// Start/stop bookkeeping for one cycle loop.
pub struct CycleLoop {
    name: &'static str,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CycleLoop {
    pub fn new(name: &'static str) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            name,
            running: AtomicBool::new(false),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Spawn the loop. Returns false if it was already running.
    pub async fn start<F, Fut, E>(
        &self,
        interval: Duration,
        notifications: Notifications,
        cycle: F,
    ) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("{} already running", self.name);
            return false;
        }

        let handle = spawn_cycle_loop(
            self.name,
            interval,
            self.shutdown_tx.subscribe(),
            notifications,
            cycle,
        );
        *self.task.lock().await = Some(handle);
        true
    }

    /// Signal shutdown and wait for the current cycle to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("{} not running", self.name);
            return;
        }

        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                error!("{} loop ended abnormally: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNotifier;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_loop_runs_until_stopped() {
        let count = Arc::new(AtomicU32::new(0));
        let daemon = CycleLoop::new("test");

        let counter = Arc::clone(&count);
        let started = daemon
            .start(Duration::from_millis(5), Notifications::disabled(), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                }
            })
            .await;
        assert!(started);
        assert!(daemon.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        daemon.stop().await;
        assert!(!daemon.is_running());

        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_failing_cycle_does_not_end_loop() {
        let count = Arc::new(AtomicU32::new(0));
        let notifier = Arc::new(MockNotifier::new());
        let notifications = Notifications::new(
            notifier.clone(),
            crate::config::NotifyConfig {
                send_on_crash: true,
                recipient: Some("ops@example.org".to_string()),
                ..Default::default()
            },
        );
        let (tx, rx) = broadcast::channel(1);

        let counter = Arc::clone(&count);
        let handle = spawn_cycle_loop("flaky", Duration::from_millis(5), rx, notifications, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("database is locked")
            }
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(count.load(Ordering::SeqCst) >= 2);
        let sent = notifier.sent().await;
        assert!(!sent.is_empty());
        assert_eq!(sent[0].subject, "flaky cycle failed");
    }

    #[tokio::test]
    async fn test_double_start_is_refused() {
        let daemon = CycleLoop::new("twice");
        let cycle = || async { Ok::<(), String>(()) };
        assert!(daemon.start(Duration::from_secs(60), Notifications::disabled(), cycle).await);
        assert!(!daemon.start(Duration::from_secs(60), Notifications::disabled(), cycle).await);
        daemon.stop().await;
    }
}
