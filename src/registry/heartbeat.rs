use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::broker::{Broker, Fields};
use crate::error::BrokerError;
use crate::shutdown::Shutdown;

/// Refreshes only the heartbeat timestamp of one registry record.
pub async fn touch_record(broker: &dyn Broker, record_key: &str) -> Result<(), BrokerError> {
    let mut fields = Fields::new();
    fields.insert("last_heartbeat".into(), Utc::now().to_rfc3339());
    broker.put_record(record_key, fields).await
}

/// Supervised heartbeat emitter for one registered agent.
///
/// Follows period changes published on its `period` channel. Stopped
/// through its own channel or the process shutdown flag, and always joined
/// by [`HeartbeatHandle::stop`].
pub struct HeartbeatHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl HeartbeatHandle {
    pub fn spawn(
        broker: Arc<dyn Broker>,
        record_key: String,
        mut period: watch::Receiver<Duration>,
        mut process_shutdown: Shutdown,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let mut stopped = Shutdown::new(stop_rx);

        let task = tokio::spawn(async move {
            let mut ticks = ticker(*period.borrow_and_update());
            let mut tunable = true;

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        if let Err(e) = touch_record(broker.as_ref(), &record_key).await {
                            log::warn!("Heartbeat for {} failed: {}", record_key, e);
                        }
                    }
                    changed = period.changed(), if tunable => {
                        if changed.is_err() {
                            tunable = false;
                        } else {
                            let next = *period.borrow_and_update();
                            log::debug!("Heartbeat period for {} is now {:?}", record_key, next);
                            ticks = ticker(next);
                        }
                    }
                    _ = stopped.wait() => break,
                    _ = process_shutdown.wait() => break,
                }
            }
            log::debug!("Heartbeat emitter for {} stopped", record_key);
        });

        Self { stop, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            log::warn!("Heartbeat task ended abnormally: {}", e);
        }
    }
}
