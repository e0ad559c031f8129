use crate::collectors::{MetricSnapshot, MetricSource};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Fixed-interval sampling loop. Each tick captures one [`MetricSnapshot`] on a
/// blocking worker and delivers it in order; ticks never overlap.
pub struct SnapshotPoller {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SnapshotPoller {
    pub fn spawn(
        source: Box<dyn MetricSource>,
        interval: Duration,
        out: UnboundedSender<Arc<MetricSnapshot>>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(source, interval, out, stop_rx));
        Self { stop_tx, task }
    }

    /// Safe to call any number of times.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow() || self.task.is_finished()
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(err) = self.task.await {
            error!(error = %err, "poller task ended abnormally");
        }
    }
}

async fn run(
    source: Box<dyn MetricSource>,
    interval: Duration,
    out: UnboundedSender<Arc<MetricSnapshot>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut source = Some(source);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_ms = interval.as_millis() as u64, "snapshot poller started");

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(current) = source.take() else {
                    break;
                };
                let sampling = tokio::task::spawn_blocking(move || {
                    let mut current = current;
                    let snapshot = MetricSnapshot::capture(current.as_mut(), now_unix());
                    (current, snapshot)
                });

                let sampled = tokio::select! {
                    res = sampling => res,
                    _ = stop.changed() => {
                        debug!("stop requested while sampling");
                        break;
                    }
                };

                let (returned, snapshot) = match sampled {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "metric sampling panicked, poller stopping");
                        break;
                    }
                };
                source = Some(returned);

                for failure in snapshot.errors() {
                    warn!(category = failure.category, error = %failure.message, "metric acquisition failed");
                }
                if out.send(Arc::new(snapshot)).is_err() {
                    debug!("snapshot receiver dropped");
                    break;
                }
            }
        }
    }

    info!("snapshot poller stopped");
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
