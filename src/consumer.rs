//! Detector job consumer.
//!
//! One job is one keyframe notification for one detector kind:
//!
//! `Queued → Fetched → Detecting → Merged → Acked`
//!
//! A job is deleted from the queue only after its status has been merged.
//! Any retryable failure leaves it in flight; the queue hands it out again
//! once the visibility timeout passes. Because merges are idempotent a
//! redelivery that succeeds leaves the record as a single success would.
//! A job that can never succeed is moved to the queue's dead letters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::aggregate::AnnotationAggregator;
use crate::detect::{DetectionService, DetectorKind};
use crate::error::{PipelineError, Result};
use crate::identity;
use crate::queue::{Delivery, JobQueue, StorageEvent};
use crate::storage::ObjectStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Fetched,
    Detecting,
    Merged,
    Acked,
    Requeued,
    Rejected,
}

/// What happened to one delivery.
#[derive(Debug)]
pub enum ConsumeOutcome {
    /// Merged and deleted from the queue.
    Acked,
    /// Retryable failure; the job will be redelivered.
    Requeued(PipelineError),
    /// The job can never succeed. It is not acknowledged; it is moved to the
    /// queue's dead letters and never handed to the detector again.
    Rejected(PipelineError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub receive_errors: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: &ConsumeOutcome) {
        self.received += 1;
        match outcome {
            ConsumeOutcome::Acked => self.acked += 1,
            ConsumeOutcome::Requeued(_) => self.requeued += 1,
            ConsumeOutcome::Rejected(_) => self.rejected += 1,
        }
    }
}

pub struct JobConsumer {
    kind: DetectorKind,
    queue: Arc<dyn JobQueue>,
    objects: Arc<dyn ObjectStore>,
    detector: Arc<dyn DetectionService>,
    aggregator: AnnotationAggregator,
    poll_interval: Duration,
}

impl JobConsumer {
    pub fn new(
        kind: DetectorKind,
        queue: Arc<dyn JobQueue>,
        objects: Arc<dyn ObjectStore>,
        detector: Arc<dyn DetectionService>,
        aggregator: AnnotationAggregator,
    ) -> Self {
        Self {
            kind,
            queue,
            objects,
            detector,
            aggregator,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn kind(&self) -> DetectorKind {
        self.kind
    }

    /// Process one delivery to completion.
    pub fn consume(&self, delivery: &Delivery) -> ConsumeOutcome {
        match self.process(delivery) {
            Ok(()) => ConsumeOutcome::Acked,
            Err(err) if err.is_retryable() => {
                self.transition(delivery, JobState::Requeued);
                log::warn!(
                    "{} job (receive #{}) left for redelivery: {}",
                    self.kind,
                    delivery.receive_count,
                    err
                );
                ConsumeOutcome::Requeued(err)
            }
            Err(err) => {
                self.transition(delivery, JobState::Rejected);
                log::error!(
                    "{} job rejected (receive #{}): {}",
                    self.kind,
                    delivery.receive_count,
                    err
                );
                match self.queue.dead_letter(&delivery.receipt) {
                    Ok(true) => {}
                    Ok(false) => log::warn!(
                        "{}: receipt for rejected job was stale; not dead-lettered",
                        self.queue.name()
                    ),
                    Err(dead_letter_err) => log::warn!(
                        "{}: failed to dead-letter rejected job: {}",
                        self.queue.name(),
                        dead_letter_err
                    ),
                }
                ConsumeOutcome::Rejected(err)
            }
        }
    }

    fn process(&self, delivery: &Delivery) -> Result<()> {
        self.transition(delivery, JobState::Queued);
        let event = StorageEvent::decode(&delivery.body)?;
        let frame = identity::resolve(&event.key);

        let image = self.objects.get(&event.bucket, &event.key)?;
        self.transition(delivery, JobState::Fetched);

        self.transition(delivery, JobState::Detecting);
        let outcome = self.detector.detect(&image)?;
        let positive = outcome.is_positive();
        let status = self.kind.status_for(outcome);

        self.aggregator
            .merge(&frame.stream_id, &frame.frame_id, self.kind, status)?;
        self.transition(delivery, JobState::Merged);

        if !self.queue.delete(&delivery.receipt)? {
            log::warn!(
                "{}: receipt for {} was stale; job was already redelivered",
                self.queue.name(),
                event.key
            );
        }
        self.transition(delivery, JobState::Acked);
        log::info!(
            "{}: stream '{}' frame '{}' annotated ({})",
            self.kind,
            frame.stream_id,
            frame.frame_id,
            if positive { "detected" } else { "clear" }
        );
        Ok(())
    }

    fn transition(&self, delivery: &Delivery, state: JobState) {
        log::debug!(
            "{} job {}: {:?}",
            self.kind,
            short_receipt(&delivery.receipt),
            state
        );
    }

    /// Receive and consume at most one job.
    pub fn poll_once(&self) -> Result<Option<ConsumeOutcome>> {
        Ok(self.queue.receive()?.map(|delivery| self.consume(&delivery)))
    }

    /// Consume until the queue has nothing visible.
    pub fn run_until_idle(&self) -> Result<ConsumerStats> {
        let mut stats = ConsumerStats::default();
        while let Some(outcome) = self.poll_once()? {
            stats.record(&outcome);
        }
        Ok(stats)
    }

    /// Consume until `shutdown` is set, sleeping on an empty queue. Receive
    /// failures are counted and retried after the poll interval.
    pub fn run(&self, shutdown: &AtomicBool) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        log::info!("{} consumer polling {}", self.kind, self.queue.name());
        while !shutdown.load(Ordering::SeqCst) {
            match self.poll_once() {
                Ok(Some(outcome)) => stats.record(&outcome),
                Ok(None) => std::thread::sleep(self.poll_interval),
                Err(err) => {
                    stats.receive_errors += 1;
                    log::warn!("{}: receive failed: {}", self.queue.name(), err);
                    std::thread::sleep(self.poll_interval);
                }
            }
        }
        log::info!(
            "{} consumer stopped: {} acked, {} requeued, {} rejected",
            self.kind,
            stats.acked,
            stats.requeued,
            stats.rejected
        );
        stats
    }
}

fn short_receipt(receipt: &str) -> &str {
    receipt.get(..8).unwrap_or(receipt)
}
