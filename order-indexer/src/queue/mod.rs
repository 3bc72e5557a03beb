//! Durable, Redis-backed job queues.
//!
//! Jobs carry a deterministic id (their `context`): enqueuing a job whose
//! id is already queued coalesces the two, while a job that has started
//! executing no longer blocks a fresh enqueue. Failed jobs retry with
//! exponential backoff through a delayed set; completed and failed ids
//! are retained for inspection.

use core::{marker::PhantomData, time::Duration};
use std::sync::Arc;

use anyhow::{Context as _, Result as AnyResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use structopt::StructOpt;
use tokio::{spawn, sync::Semaphore, time::{sleep, timeout}};
use tracing::{error, info, trace, warn};
use url::Url;

use crate::utils::{spawn_or_abort, unix_now};

static EXECUTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("queue_executed", "Jobs executed by queue.", &["queue"]).unwrap()
});
static MERGED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("queue_merged", "Jobs coalesced by queue.", &["queue"]).unwrap()
});
static RETRIED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("queue_retried", "Job retries by queue.", &["queue"]).unwrap()
});
static FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "queue_failed",
        "Jobs that exhausted their retries by queue.",
        &["queue"]
    )
    .unwrap()
});

/// How long a blocking pop waits before the consumer loop re-checks.
const POP_TIMEOUT: Duration = Duration::from_secs(5);

/// How often delayed (backing-off) jobs are promoted to the ready list.
const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, StructOpt)]
pub struct Options {
    /// Redis connection string.
    #[structopt(long, env = "REDIS", default_value = "redis://localhost:6379")]
    pub redis: Url,
}

pub async fn connect(options: &Options) -> AnyResult<ConnectionManager> {
    info!("Connecting to Redis at {}", options.redis);
    let client = redis::Client::open(options.redis.as_str())
        .with_context(|| format!("Error creating Redis client for {}", options.redis))?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("Error connecting to Redis {}", options.redis))
}

/// A queueable unit of work with a deterministic deduplication id.
pub trait Job: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Queue name. Also the Redis key namespace.
    const QUEUE: &'static str;

    /// Deterministic job id: specific enough not to drop a distinct
    /// update, general enough to coalesce redundant in-flight triggers.
    fn context(&self) -> String;
}

#[async_trait]
pub trait JobHandler<J: Job>: Send + Sync + 'static {
    async fn process(&self, job: J) -> AnyResult<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueueOptions {
    pub max_attempts:    u32,
    pub initial_backoff: Duration,
    pub timeout:         Duration,
    pub keep_completed:  isize,
    pub keep_failed:     isize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_attempts:    5,
            initial_backoff: Duration::from_secs(10),
            timeout:         Duration::from_secs(60),
            keep_completed:  1000,
            keep_failed:     10_000,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Envelope<J> {
    attempts: u32,
    job:      J,
}

pub struct JobQueue<J: Job> {
    redis:   ConnectionManager,
    options: QueueOptions,
    _job:    PhantomData<fn() -> J>,
}

impl<J: Job> Clone for JobQueue<J> {
    fn clone(&self) -> Self {
        Self {
            redis:   self.redis.clone(),
            options: self.options.clone(),
            _job:    PhantomData,
        }
    }
}

impl<J: Job> core::fmt::Debug for JobQueue<J> {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        fmt.debug_tuple("JobQueue").field(&J::QUEUE).finish()
    }
}

impl<J: Job> JobQueue<J> {
    #[must_use]
    pub fn new(redis: ConnectionManager, options: QueueOptions) -> Self {
        Self {
            redis,
            options,
            _job: PhantomData,
        }
    }

    fn key(part: &str) -> String {
        format!("queues:{}:{}", J::QUEUE, part)
    }

    /// Enqueue a job. Two jobs with the same context are coalesced while
    /// the earlier one is still queued.
    pub async fn enqueue(&self, job: &J) -> AnyResult<()> {
        let id = job.context();
        let envelope = Envelope {
            attempts: 0,
            job: job.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;
        let mut redis = self.redis.clone();
        let fresh: bool = redis.hset_nx(Self::key("data"), &id, payload).await?;
        if fresh {
            redis.rpush::<_, _, ()>(Self::key("ready"), &id).await?;
            trace!(queue = J::QUEUE, id = %id, "Enqueued job");
        } else {
            MERGED.with_label_values(&[J::QUEUE]).inc();
            trace!(queue = J::QUEUE, id = %id, "Coalesced job");
        }
        Ok(())
    }

    /// Start consuming with the given handler and concurrency cap. Runs
    /// until the process exits.
    pub fn run(&self, handler: Arc<dyn JobHandler<J>>, concurrency: usize) {
        info!(queue = J::QUEUE, concurrency, "Starting queue worker");
        let semaphore = Arc::new(Semaphore::new(concurrency));

        // Promote delayed retries back onto the ready list.
        spawn_or_abort({
            let queue = self.clone();
            async move {
                loop {
                    queue.promote_delayed().await?;
                    sleep(PROMOTE_INTERVAL).await;
                }
            }
        });

        spawn_or_abort({
            let queue = self.clone();
            async move {
                loop {
                    // .unwrap() is safe because we never close the semaphore.
                    let permit = semaphore.clone().acquire_owned().await.unwrap();
                    let envelope = match queue.pop().await? {
                        Some(envelope) => envelope,
                        None => {
                            drop(permit);
                            continue;
                        }
                    };
                    let queue = queue.clone();
                    let handler = handler.clone();
                    spawn(async move {
                        let _permit = permit;
                        queue.execute(handler.as_ref(), envelope).await;
                    });
                }
            }
        });
    }

    async fn pop(&self) -> AnyResult<Option<Envelope<J>>> {
        let mut redis = self.redis.clone();
        #[allow(clippy::cast_possible_truncation)]
        let popped: Option<(String, String)> = redis
            .blpop(Self::key("ready"), POP_TIMEOUT.as_secs() as usize)
            .await?;
        let id = match popped {
            Some((_key, id)) => id,
            None => return Ok(None),
        };
        let payload: Option<String> = redis.hget(Self::key("data"), &id).await?;
        // Removing the payload ends the deduplication window: re-triggers
        // arriving from here on schedule a fresh run.
        redis.hdel::<_, _, ()>(Self::key("data"), &id).await?;
        let payload = match payload {
            Some(payload) => payload,
            None => return Ok(None),
        };
        let envelope = serde_json::from_str(&payload)
            .with_context(|| format!("corrupt payload on queue {}", J::QUEUE))?;
        Ok(Some(envelope))
    }

    async fn execute(&self, handler: &dyn JobHandler<J>, envelope: Envelope<J>) {
        let id = envelope.job.context();
        EXECUTED.with_label_values(&[J::QUEUE]).inc();
        let result = timeout(self.options.timeout, handler.process(envelope.job.clone())).await;
        let result = match result {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };
        match result {
            Ok(()) => {
                if let Err(error) = self.complete(&id).await {
                    warn!(?error, queue = J::QUEUE, "Error recording completion");
                }
            }
            Err(error) => {
                let attempts = envelope.attempts + 1;
                if attempts < self.options.max_attempts {
                    warn!(?error, queue = J::QUEUE, id = %id, attempts, "Job failed, retrying");
                    RETRIED.with_label_values(&[J::QUEUE]).inc();
                    let retry = Envelope {
                        attempts,
                        job: envelope.job,
                    };
                    if let Err(error) = self.delay(&retry).await {
                        error!(?error, queue = J::QUEUE, "Error scheduling retry");
                    }
                } else {
                    error!(?error, queue = J::QUEUE, id = %id, "Job failed permanently");
                    FAILED.with_label_values(&[J::QUEUE]).inc();
                    if let Err(error) = self.fail(&envelope).await {
                        error!(?error, queue = J::QUEUE, "Error recording failure");
                    }
                }
            }
        }
    }

    async fn complete(&self, id: &str) -> AnyResult<()> {
        let mut redis = self.redis.clone();
        redis.lpush::<_, _, ()>(Self::key("completed"), id).await?;
        redis
            .ltrim::<_, ()>(Self::key("completed"), 0, self.options.keep_completed - 1)
            .await?;
        Ok(())
    }

    async fn fail(&self, envelope: &Envelope<J>) -> AnyResult<()> {
        let payload = serde_json::to_string(envelope)?;
        let mut redis = self.redis.clone();
        redis.lpush::<_, _, ()>(Self::key("failed"), payload).await?;
        redis
            .ltrim::<_, ()>(Self::key("failed"), 0, self.options.keep_failed - 1)
            .await?;
        Ok(())
    }

    async fn delay(&self, envelope: &Envelope<J>) -> AnyResult<()> {
        let backoff = self.options.initial_backoff.as_secs()
            * 2_u64.pow(envelope.attempts.saturating_sub(1));
        #[allow(clippy::cast_possible_wrap)]
        let ready_at = unix_now() + backoff as i64;
        let payload = serde_json::to_string(envelope)?;
        let mut redis = self.redis.clone();
        redis
            .zadd::<_, _, _, ()>(Self::key("delayed"), payload, ready_at)
            .await?;
        Ok(())
    }

    async fn promote_delayed(&self) -> AnyResult<()> {
        let mut redis = self.redis.clone();
        let due: Vec<String> = redis
            .zrangebyscore_limit(Self::key("delayed"), 0, unix_now(), 0, 100)
            .await?;
        for payload in due {
            // Only requeue if we won the removal; other workers promote too.
            let removed: i64 = redis.zrem(Self::key("delayed"), &payload).await?;
            if removed == 0 {
                continue;
            }
            let envelope: Envelope<J> = match serde_json::from_str(&payload) {
                Ok(envelope) => envelope,
                Err(error) => {
                    error!(?error, queue = J::QUEUE, "Corrupt delayed payload, dropping");
                    continue;
                }
            };
            let id = envelope.job.context();
            let fresh: bool = redis.hset_nx(Self::key("data"), &id, &payload).await?;
            if fresh {
                redis.rpush::<_, _, ()>(Self::key("ready"), &id).await?;
            } else {
                // An equivalent job was enqueued meanwhile; the retry is
                // subsumed by it.
                MERGED.with_label_values(&[J::QUEUE]).inc();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod test {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct TestJob {
        context: String,
        payload: u64,
    }

    impl Job for TestJob {
        const QUEUE: &'static str = "test";

        fn context(&self) -> String {
            self.context.clone()
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope {
            attempts: 2,
            job:      TestJob {
                context: "0xabc-5-0xdef".to_owned(),
                payload: 7,
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope<TestJob> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.attempts, 2);
        assert_eq!(back.job, envelope.job);
    }

    #[test]
    fn test_key_namespace() {
        assert_eq!(JobQueue::<TestJob>::key("ready"), "queues:test:ready");
    }

    #[tokio::test]
    #[ignore]
    async fn test_enqueue_dedup() {
        let options = Options {
            redis: Url::parse("redis://localhost:6379").unwrap(),
        };
        let redis = connect(&options).await.unwrap();
        let queue = JobQueue::<TestJob>::new(redis, QueueOptions::default());
        let job = TestJob {
            context: "dedup".to_owned(),
            payload: 1,
        };
        for _ in 0..10 {
            queue.enqueue(&job).await.unwrap();
        }
        let popped = queue.pop().await.unwrap();
        assert_eq!(popped.unwrap().job, job);
        assert!(queue.pop().await.unwrap().is_none());
    }
}
