//! Serialized processing for stateful modules.
//!
//! An [`Actor`] is a bounded FIFO queue of jobs drained by exactly one tokio
//! worker. Modules submit one job per request; jobs never overlap, and they
//! run in submission order. The worker is bound to the owning stream's
//! [`CancellationToken`]: once it fires, jobs still queued are dropped
//! without running and further submissions fail.

use std::future::Future;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::XmppError;

/// Queue capacity used by module actors.
pub const ACTOR_QUEUE_CAPACITY: usize = 32;

type Job = BoxFuture<'static, ()>;

/// Handle to a single-worker job queue.
#[derive(Debug)]
pub struct Actor {
    name: String,
    sender: mpsc::Sender<Job>,
    token: CancellationToken,
}

impl Actor {
    /// Spawn a worker with the default queue capacity.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(name: impl Into<String>, token: CancellationToken) -> Self {
        Self::with_capacity(name, token, ACTOR_QUEUE_CAPACITY)
    }

    /// Spawn a worker with a custom queue capacity.
    pub fn with_capacity(name: impl Into<String>, token: CancellationToken, capacity: usize) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(capacity);
        tokio::spawn(run_worker(name.clone(), receiver, token.clone()));
        Self { name, sender, token }
    }

    /// Enqueue a job.
    ///
    /// Waits only while the queue is full. Fails once the owning stream was
    /// cancelled.
    pub async fn submit<F>(&self, job: F) -> Result<(), XmppError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            return Err(self.stopped());
        }
        self.sender
            .send(Box::pin(job))
            .await
            .map_err(|_| self.stopped())
    }

    /// Wait until every job submitted before this call has run.
    pub async fn barrier(&self) -> Result<(), XmppError> {
        let (tx, rx) = oneshot::channel();
        self.submit(async move {
            let _ = tx.send(());
        })
        .await?;
        rx.await.map_err(|_| self.stopped())
    }

    /// Whether the worker still accepts jobs.
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled() && !self.sender.is_closed()
    }

    /// Actor name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn stopped(&self) -> XmppError {
        XmppError::internal(format!("{} actor stopped", self.name))
    }
}

async fn run_worker(name: String, mut receiver: mpsc::Receiver<Job>, token: CancellationToken) {
    trace!(actor = %name, "Actor started");
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(actor = %name, dropped = receiver.len(), "Actor cancelled, dropping queued jobs");
                break;
            }
            job = receiver.recv() => match job {
                Some(job) => job.await,
                None => break,
            },
        }
    }
    receiver.close();
    trace!(actor = %name, "Actor stopped");
}
