//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the gateway loops."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

/// Simple async rate limiter that ensures deterministic loop intervals.
#[derive(Debug)]
pub struct RateLimiter {
    interval: tokio::time::Interval,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

/// Executor that runs at most `limit` tasks at once, in batches.
///
/// Once `limit` tasks are in flight the next [`spawn`](Self::spawn) waits for
/// the whole batch to finish before starting anything new. [`join`](Self::join)
/// waits for every outstanding task, so no task outlives the executor's owner.
#[derive(Debug)]
pub struct BoundedBatchExecutor<T> {
    limit: usize,
    pending: Vec<JoinHandle<T>>,
    completed: Vec<T>,
}

impl<T: Send + 'static> BoundedBatchExecutor<T> {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            pending: Vec::with_capacity(limit),
            completed: Vec::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub async fn spawn<F>(&mut self, fut: F) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.pending.push(tokio::spawn(fut));
        if self.pending.len() >= self.limit {
            self.drain().await?;
        }
        Ok(())
    }

    pub async fn join(mut self) -> Result<Vec<T>> {
        self.drain().await?;
        Ok(self.completed)
    }

    async fn drain(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.pending);
        trace!(tasks = batch.len(), "joining task batch");
        for outcome in join_all(batch).await {
            let value = outcome.map_err(|err| anyhow::anyhow!("task join failure: {}", err))?;
            self.completed.push(value);
        }
        Ok(())
    }
}
