//! Fan-out of keyframe notifications to detector queues.

use std::sync::Arc;

use crate::detect::DetectorKind;
use crate::error::PipelineError;
use crate::queue::{JobQueue, StorageEvent};

/// One detector kind listening on one queue.
#[derive(Clone)]
pub struct DetectorSubscription {
    pub kind: DetectorKind,
    pub queue: Arc<dyn JobQueue>,
}

#[derive(Debug)]
pub struct DispatchFailure {
    pub kind: DetectorKind,
    pub queue: String,
    pub key: String,
    pub error: PipelineError,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub sent: usize,
    pub failures: Vec<DispatchFailure>,
}

impl DispatchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct Dispatcher {
    subscriptions: Vec<DetectorSubscription>,
}

impl Dispatcher {
    pub fn new(subscriptions: Vec<DetectorSubscription>) -> Self {
        Self { subscriptions }
    }

    pub fn subscriptions(&self) -> &[DetectorSubscription] {
        &self.subscriptions
    }

    /// Send every event to every subscription. A failed send is recorded and
    /// the remaining sends still go out.
    pub fn dispatch(&self, events: &[StorageEvent]) -> DispatchReport {
        let mut report = DispatchReport::default();
        for event in events {
            let body = event.encode();
            for subscription in &self.subscriptions {
                match subscription.queue.send(&body) {
                    Ok(()) => report.sent += 1,
                    Err(error) => {
                        log::warn!(
                            "dispatch: {} -> {} failed: {}",
                            event.key,
                            subscription.queue.name(),
                            error
                        );
                        report.failures.push(DispatchFailure {
                            kind: subscription.kind,
                            queue: subscription.queue.name().to_string(),
                            key: event.key.clone(),
                            error,
                        });
                    }
                }
            }
        }
        log::info!(
            "dispatch: {} notification(s) sent, {} failed",
            report.sent,
            report.failures.len()
        );
        report
    }
}
