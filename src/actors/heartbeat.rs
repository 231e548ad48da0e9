//! Heartbeat pump for in-process workers.
//!
//! Automated workers managed by this process have no external agent to call
//! [`WorkerRegistry::heartbeat`], so the actor does it for them. External
//! workers heartbeat on their own and are not listed here.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::orchestration::registry::{WorkerId, WorkerRegistry};
use crate::{mlog_debug, mlog_trace};

use super::ActorHandle;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

pub struct HeartbeatActor {
    registry: Arc<WorkerRegistry>,
    workers: Vec<WorkerId>,
    interval: Duration,
}

impl HeartbeatActor {
    pub fn new(registry: Arc<WorkerRegistry>, workers: Vec<WorkerId>) -> Self {
        Self {
            registry,
            workers,
            interval: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn spawn(self) -> ActorHandle {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        mlog_debug!(
            "HeartbeatActor::spawn workers={} interval={:?}",
            self.workers.len(),
            self.interval
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        mlog_debug!("HeartbeatActor cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        for id in &self.workers {
                            if let Err(e) = self.registry.heartbeat(id).await {
                                mlog_debug!("HeartbeatActor: {}", e);
                            }
                        }
                        mlog_trace!("HeartbeatActor: pumped {} workers", self.workers.len());
                    }
                }
            }
        });

        ActorHandle::new(cancel)
    }
}
