//! Bounded worker pool consuming task deliveries from a queue

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::error::{DaemonError, Result};
use crate::task::{Dispatcher, Task, TaskOutcome};

/// Queue receiving tasks whose delivery attempts ran out
pub const DEAD_LETTER_QUEUE: &str = "failed_tasks";

/// One delivery of a task body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub body: Vec<u8>,
    /// Zero for the first delivery
    pub attempt: u32,
}

/// Acknowledgement side of a task queue
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// The delivery is settled and will not be seen again
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// The delivery was not handled; put it back when `requeue` is set
    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<()>;

    /// Publish the delivery to [`DEAD_LETTER_QUEUE`]
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: &'static str,
    pub delivery: Delivery,
    pub reason: String,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process queue over an unbounded channel
pub struct ChannelQueue {
    sender: mpsc::UnboundedSender<Delivery>,
    next_id: AtomicU64,
    pending: AtomicUsize,
    idle: Notify,
    acked: Mutex<Vec<u64>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl ChannelQueue {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            sender,
            next_id: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            acked: Mutex::new(Vec::new()),
            dead_letters: Mutex::new(Vec::new()),
        });
        (queue, receiver)
    }

    pub fn publish(&self, body: impl Into<Vec<u8>>) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            id,
            body: body.into(),
            attempt: 0,
        };
        if self.sender.send(delivery).is_err() {
            self.settle();
            return Err(DaemonError::Queue("task channel closed".into()));
        }
        debug!(delivery = id, "Published task");
        Ok(id)
    }

    pub fn publish_task(&self, task: &Task) -> Result<u64> {
        self.publish(serde_json::to_vec(&task.to_json())?)
    }

    /// Deliveries published but not yet settled
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolves once every published delivery has been settled
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn acked(&self) -> Vec<u64> {
        lock(&self.acked).clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.dead_letters).clone()
    }

    fn settle(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[async_trait]
impl TaskQueue for ChannelQueue {
    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        lock(&self.acked).push(delivery.id);
        self.settle();
        Ok(())
    }

    async fn nack(&self, mut delivery: Delivery, requeue: bool) -> Result<()> {
        if !requeue {
            self.settle();
            return Ok(());
        }
        delivery.attempt += 1;
        let id = delivery.id;
        self.sender.send(delivery).map_err(|_| {
            self.settle();
            DaemonError::Queue(format!("cannot requeue delivery {}", id))
        })
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        lock(&self.dead_letters).push(DeadLetter {
            queue: DEAD_LETTER_QUEUE,
            delivery: delivery.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

/// Runs up to `concurrency` tasks at a time
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    queue: Arc<dyn TaskQueue>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    delivery_attempts: u32,
}

impl WorkerPool {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        queue: Arc<dyn TaskQueue>,
        concurrency: usize,
        delivery_attempts: u32,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            dispatcher,
            queue,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            delivery_attempts: delivery_attempts.max(1),
        }
    }

    /// Consume deliveries until the channel closes or `shutdown` resolves,
    /// then wait for the tasks still running
    pub async fn run(
        &self,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        info!("Worker pool started with {} slots", self.concurrency);
        tokio::pin!(shutdown);

        loop {
            let delivery = tokio::select! {
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
                _ = &mut shutdown => break,
            };

            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|e| DaemonError::Queue(format!("worker pool closed: {}", e)))?;
            let dispatcher = Arc::clone(&self.dispatcher);
            let queue = Arc::clone(&self.queue);
            let attempts = self.delivery_attempts;

            tokio::spawn(async move {
                let id = delivery.id;
                if let Err(e) = process(dispatcher, queue, delivery, attempts).await {
                    error!(delivery = id, "Could not settle delivery: {}", e);
                }
                drop(permit);
            });
        }

        // wait for running tasks to release their slots
        let slots = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        let _all = self
            .semaphore
            .acquire_many(slots)
            .await
            .map_err(|e| DaemonError::Queue(format!("worker pool closed: {}", e)))?;
        info!("Worker pool stopped");
        Ok(())
    }
}

async fn process(
    dispatcher: Arc<Dispatcher>,
    queue: Arc<dyn TaskQueue>,
    delivery: Delivery,
    delivery_attempts: u32,
) -> Result<()> {
    debug!(delivery = delivery.id, attempt = delivery.attempt, "Processing delivery");
    match dispatcher.handle(&delivery.body).await {
        TaskOutcome::Ack | TaskOutcome::AckKnownError => queue.ack(&delivery).await,
        TaskOutcome::Retry if delivery.attempt + 1 < delivery_attempts => {
            warn!(
                delivery = delivery.id,
                attempt = delivery.attempt,
                "Requeueing task"
            );
            queue.nack(delivery, true).await
        }
        TaskOutcome::Retry => {
            warn!(
                delivery = delivery.id,
                "Delivery attempts exhausted, moving task to {}", DEAD_LETTER_QUEUE
            );
            queue
                .dead_letter(
                    &delivery,
                    &format!("failed {} deliveries", delivery_attempts),
                )
                .await?;
            queue.ack(&delivery).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::Archiver;
    use crate::store::RecordStore;
    use crate::testing::TestEnvironment;
    use std::fs;

    #[tokio::test]
    async fn test_pool_processes_tasks() {
        let env = TestEnvironment::new().unwrap();
        let (queue, deliveries) = ChannelQueue::new();
        for name in ["a.txt", "b.txt", "c.txt"] {
            let path = env.write_original(name, name.as_bytes()).unwrap();
            queue
                .publish_task(&Task::Archive {
                    file_path: path,
                    owner_name: "alice".into(),
                })
                .unwrap();
        }
        queue.publish(b"garbage".to_vec()).unwrap();

        let pool = WorkerPool::new(Arc::new(env.dispatcher()), queue.clone(), 2, 3);
        pool.run(deliveries, queue.wait_idle()).await.unwrap();

        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.acked().len(), 4);
        assert!(queue.dead_letters().is_empty());
        assert_eq!(env.store.all_file_ids().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unclassified_failure_dead_lettered() {
        let env = TestEnvironment::new().unwrap();
        // evidence root is a plain file, so creating evidence directories fails
        let blocked = env.root.path().join("blocked");
        fs::write(&blocked, b"").unwrap();
        let mut settings = env.settings();
        settings.storage_dir = blocked;
        let archiver = Archiver::new(
            env.store.clone(),
            env.source.clone(),
            env.trust.clone(),
            settings,
        );
        let dispatcher = Dispatcher::new(archiver, env.retimestamper(), env.validator());

        let (queue, deliveries) = ChannelQueue::new();
        let path = env.write_original("report.txt", b"hello").unwrap();
        let id = queue
            .publish_task(&Task::Archive {
                file_path: path,
                owner_name: "alice".into(),
            })
            .unwrap();

        let pool = WorkerPool::new(Arc::new(dispatcher), queue.clone(), 1, 3);
        pool.run(deliveries, queue.wait_idle()).await.unwrap();

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].queue, DEAD_LETTER_QUEUE);
        assert_eq!(dead[0].delivery.id, id);
        assert_eq!(dead[0].delivery.attempt, 2);
        assert_eq!(queue.acked(), vec![id]);
    }
}
