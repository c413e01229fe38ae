//! The sync pipeline: ordered event processing into the graph.
//!
//! Events fan out to a worker pool hashed by resource uid, so all events for
//! one resource are serialised on one worker while different resources
//! proceed concurrently. Failures retry with exponential backoff; events
//! that keep failing are parked on a dead-letter queue and the pipeline
//! moves on.

mod causality;
mod processor;

use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spectre_event::ChangeEvent;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

pub use self::{
    causality::{CausalityConfig, CausalityEngine, CausalLink},
    processor::{EventProcessor, ProcessError, ProcessorConfig},
};

/// Pipeline tuning knobs.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Worker count; all events for one uid land on `uid % workers`.
    pub workers: usize,
    /// Per-worker input queue depth.
    pub queue_capacity: usize,
    /// Attempts per event before it is dead-lettered.
    pub max_attempts: u32,
    /// Base delay of the exponential backoff between attempts.
    pub retry_base_delay: Duration,
    /// Dead letters retained for inspection.
    pub dead_letter_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 1_000,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            dead_letter_capacity: 1_000,
        }
    }
}

/// An event the pipeline gave up on, with the error that parked it.
#[derive(Debug)]
pub struct DeadLetter {
    pub event: ChangeEvent,
    pub error: String,
    pub attempts: u32,
}

/// Bounded in-memory dead-letter queue.
#[derive(Debug)]
pub struct DeadLetterQueue {
    capacity: usize,
    letters: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            letters: Mutex::new(Vec::new()),
        }
    }

    pub fn park(&self, letter: DeadLetter) {
        let mut letters = self.letters.lock().expect("dead letter lock poisoned");
        if letters.len() >= self.capacity {
            // Oldest letters give way; the log line above is the durable
            // trace.
            letters.remove(0);
        }
        letters.push(letter);
    }

    pub fn len(&self) -> usize {
        self.letters.lock().expect("dead letter lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains the queue, e.g. for replay after an operator fixed the cause.
    pub fn drain(&self) -> Vec<DeadLetter> {
        let mut letters = self.letters.lock().expect("dead letter lock poisoned");
        std::mem::take(&mut *letters)
    }
}

/// Handle to a running pipeline.
#[derive(Debug)]
pub struct SyncPipeline {
    senders: Vec<mpsc::Sender<ChangeEvent>>,
    workers: Vec<JoinHandle<()>>,
    dead_letters: Arc<DeadLetterQueue>,
}

impl SyncPipeline {
    /// Spawns the worker pool.
    pub fn spawn(config: PipelineConfig, processor: Arc<EventProcessor>) -> Self {
        let workers_count = config.workers.max(1);
        let dead_letters = Arc::new(DeadLetterQueue::new(config.dead_letter_capacity));

        let mut senders = Vec::with_capacity(workers_count);
        let mut workers = Vec::with_capacity(workers_count);
        for worker_id in 0..workers_count {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            senders.push(tx);
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                rx,
                processor.clone(),
                config.clone(),
                dead_letters.clone(),
            )));
        }

        info!(workers = workers_count, "sync pipeline started");
        Self {
            senders,
            workers,
            dead_letters,
        }
    }

    pub fn dead_letters(&self) -> Arc<DeadLetterQueue> {
        self.dead_letters.clone()
    }

    /// Submits one event, preserving per-uid ordering. Waits when the
    /// owning worker's queue is full.
    pub async fn submit(&self, event: ChangeEvent) {
        let index = worker_index(&event.resource.uid, self.senders.len());
        if self.senders[index].send(event).await.is_err() {
            error!("pipeline worker {index} is gone, dropping event");
        }
    }

    /// Closes the input queues and waits for the workers to drain.
    pub async fn shutdown(self) {
        drop(self.senders);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("sync pipeline drained");
    }
}

fn worker_index(uid: &str, workers: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    uid.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<ChangeEvent>,
    processor: Arc<EventProcessor>,
    config: PipelineConfig,
    dead_letters: Arc<DeadLetterQueue>,
) {
    while let Some(event) = rx.recv().await {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match processor.process(&event).await {
                Ok(()) => break,
                Err(error) if error.is_permanent() => {
                    warn!(
                        worker = worker_id,
                        event_id = event.id,
                        uid = %event.resource.uid,
                        %error,
                        "dropping invalid event"
                    );
                    break;
                }
                Err(error) if attempts < config.max_attempts => {
                    let delay = config.retry_base_delay * 2u32.saturating_pow(attempts - 1);
                    debug!(
                        worker = worker_id,
                        event_id = event.id,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "event processing failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    warn!(
                        worker = worker_id,
                        event_id = event.id,
                        uid = %event.resource.uid,
                        attempts,
                        %error,
                        "event processing failed permanently, parking on dead-letter queue"
                    );
                    dead_letters.park(DeadLetter {
                        event,
                        error: error.to_string(),
                        attempts,
                    });
                    break;
                }
            }
        }
    }
    debug!(worker = worker_id, "pipeline worker drained");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_index_is_stable_per_uid() {
        let a = worker_index("uid-a", 8);
        for _ in 0..10 {
            assert_eq!(worker_index("uid-a", 8), a);
        }
    }

    #[test]
    fn dead_letter_queue_is_bounded() {
        let queue = DeadLetterQueue::new(2);
        for i in 0..3 {
            queue.park(DeadLetter {
                event: crate::test_util::pod_event(&format!("uid-{i}"), "1", 1),
                error: "boom".into(),
                attempts: 3,
            });
        }
        assert_eq!(queue.len(), 2);
        let drained = queue.drain();
        assert_eq!(drained[0].event.resource.uid, "uid-1");
        assert!(queue.is_empty());
    }
}
