//! Redis Manager - cross-process wake signals and result publishing
//!
//! This module handles:
//! - Waking the grader when another process pushes to `grader:wake` (BLPOP)
//! - Storing each finished submission under `grader:result:<id>` and
//!   publishing it on `grader:results`
//!
//! A blocking BLPOP ties up its connection, so the listener and the
//! publisher each own a separate `RedisManager`.

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::grader::Waker;
use crate::store::{Submission, SubmissionStatus};

/// Redis key constants
pub mod keys {
    /// List other processes push to after queueing a submission
    pub const WAKE_LIST: &str = "grader:wake";

    /// Finished submission key prefix (for polling)
    pub const RESULT_PREFIX: &str = "grader:result:";

    /// Finished submission channel (for pub/sub)
    pub const RESULT_CHANNEL: &str = "grader:results";
}

const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour

/// Snapshot of a finished submission as published to Redis
#[derive(Debug, Serialize)]
pub struct FinishedSubmission {
    pub submission_id: i64,
    pub problem_id: i64,
    pub status: SubmissionStatus,
    pub score: i64,
    pub compile_error: bool,
    pub max_time_ms: i64,
    pub max_memory_kb: i64,
}

impl From<&Submission> for FinishedSubmission {
    fn from(sub: &Submission) -> Self {
        Self {
            submission_id: sub.id,
            problem_id: sub.problem_id,
            status: sub.status,
            score: sub.score,
            compile_error: sub.compile_error,
            max_time_ms: sub.max_time_ms,
            max_memory_kb: sub.max_memory_kb,
        }
    }
}

pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisManager {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);
        Ok(Self { client, conn })
    }

    /// Block until something is pushed to the wake list.
    ///
    /// Reconnects on connection failure.
    pub async fn pop_wake(&mut self) -> Result<()> {
        loop {
            let popped: Option<(String, String)> =
                match self.conn.blpop(keys::WAKE_LIST, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.reconnect().await?;
                        continue;
                    }
                };
            if let Some((_, payload)) = popped {
                debug!("Wake request: {}", payload);
                return Ok(());
            }
        }
    }

    /// Store a finished submission with a 1-hour expiration and publish it.
    pub async fn store_result(&mut self, sub: &Submission) -> Result<()> {
        let key = format!("{}{}", keys::RESULT_PREFIX, sub.id);
        let json = serde_json::to_string(&FinishedSubmission::from(sub))?;

        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn
                .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // No subscribers is not an error
        let _ = self
            .conn
            .publish::<_, _, ()>(keys::RESULT_CHANNEL, &json)
            .await;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

/// Forward every wake request from Redis to the grader
pub fn spawn_wake_listener(
    mut redis: RedisManager,
    waker: Waker,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                popped = redis.pop_wake() => match popped {
                    Ok(()) => waker.wake(),
                    Err(e) => {
                        warn!("Wake listener error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
        debug!("Wake listener stopped");
    })
}

/// Resolves once `shutdown` is true or its sender is gone. The borrowed
/// value is released before returning, so this can sit in a `select!` arm.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Publish every finished submission until the grader goes away
pub fn spawn_result_publisher(
    mut redis: RedisManager,
    mut finished: broadcast::Receiver<Submission>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match finished.recv().await {
                Ok(sub) => {
                    if let Err(e) = redis.store_result(&sub).await {
                        warn!(submission_id = sub.id, "Failed to publish result: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Result publisher fell behind, {} results not published", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Result publisher stopped");
    })
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}
