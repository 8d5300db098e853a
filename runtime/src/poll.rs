//! Background polling for catchups.

use crate::catchup::Catchup;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a polling loop started with [`Catchup::poll`].
///
/// Stopping (or dropping the handle) prevents further cycles from being
/// scheduled. A cycle already running is left to finish.
#[derive(Debug)]
pub struct PollHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub(crate) fn spawn<C>(catchup: Arc<C>, interval: Duration) -> Self
    where
        C: Catchup + ?Sized + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
            tracing::info!(interval_ms, "Polling started");

            loop {
                if *stopped.borrow() {
                    break;
                }

                match catchup.run_until_caught_up().await {
                    Ok(0) => {}
                    Ok(applied) => tracing::debug!(applied, "Poll cycle applied items"),
                    Err(error) => tracing::error!(error = %error, "Poll cycle failed"),
                }

                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    changed = stopped.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Polling stopped");
        });

        Self {
            stop,
            task: Some(task),
        }
    }

    /// Stop scheduling cycles.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Stop scheduling cycles and wait for the current one to finish.
    pub async fn stop_and_wait(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                tracing::warn!(error = %error, "Polling task ended abnormally");
            }
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}
