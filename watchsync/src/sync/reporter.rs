//! Periodic upstream position reporting

use super::PlayerControl;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use watchsync_signaling::{OutboundMessage, PositionReport, SignalingSink};

/// Background task reporting the local player position at a fixed cadence
///
/// The first report goes out one full period after start. The task is
/// aborted by [`PositionReporter::stop`] or when the reporter is dropped.
pub struct PositionReporter {
    period: Duration,
    task: Option<JoinHandle<()>>,
}

impl PositionReporter {
    /// Spawn the reporting task on `runtime`
    pub fn start(
        runtime: &Handle,
        player: Arc<dyn PlayerControl>,
        signaling: Arc<dyn SignalingSink>,
        period: Duration,
    ) -> Self {
        let task = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = PositionReport {
                    current_time_seconds: player.current_time(),
                };
                debug!("Reporting position {:.3}s", report.current_time_seconds);
                if let Err(e) = signaling.send(OutboundMessage::PositionReport(report)).await {
                    warn!("Failed to send position report: {}", e);
                }
            }
        });
        Self {
            period,
            task: Some(task),
        }
    }

    /// Reporting cadence
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the task is still scheduled
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Abort the reporting task
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PositionReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
