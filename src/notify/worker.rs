use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::job::NotificationJob;
use crate::pipeline::PipelineState;

const RECV_POLL: Duration = Duration::from_secs(1);

/// Result of one delivery attempt that reached the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    Rejected(u16),
}

/// Destination for notification jobs. Called on the blocking pool.
pub trait NotificationSink: Send + Sync + 'static {
    fn deliver(&self, job: &NotificationJob) -> Result<Delivery>;
}

/// JSON POST to a fixed endpoint. Only HTTP 200 counts as accepted.
pub struct HttpSink {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl NotificationSink for HttpSink {
    fn deliver(&self, job: &NotificationJob) -> Result<Delivery> {
        match self.agent.post(&self.endpoint).send_json(job) {
            Ok(response) if response.status() == 200 => Ok(Delivery::Accepted),
            Ok(response) => Ok(Delivery::Rejected(response.status())),
            Err(ureq::Error::Status(code, _)) => Ok(Delivery::Rejected(code)),
            Err(err) => Err(anyhow!("POST {} failed: {}", self.endpoint, err)),
        }
    }
}

/// Producer side of the bounded notification queue.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<NotificationJob>,
}

impl NotificationQueue {
    /// Non-blocking enqueue. Drops the job with a warning when the queue is
    /// full or the worker has gone away.
    pub fn try_enqueue(&self, job: NotificationJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                log::warn!("notification queue full, dropping {}", job.summary());
                false
            }
            Err(TrySendError::Closed(job)) => {
                log::warn!("notification worker stopped, dropping {}", job.summary());
                false
            }
        }
    }
}

pub fn channel(capacity: usize) -> (NotificationQueue, mpsc::Receiver<NotificationJob>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (NotificationQueue { tx }, rx)
}

/// Drain the queue one job at a time until stop is requested or every
/// producer is gone. Returns the number of accepted deliveries.
pub async fn run_worker(
    mut rx: mpsc::Receiver<NotificationJob>,
    sink: Arc<dyn NotificationSink>,
    state: Arc<PipelineState>,
) -> u64 {
    let mut accepted = 0u64;
    while !state.should_stop() {
        let job = match tokio::time::timeout(RECV_POLL, rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => continue,
        };
        let summary = job.summary();
        let sink = sink.clone();
        match tokio::task::spawn_blocking(move || sink.deliver(&job)).await {
            Ok(Ok(Delivery::Accepted)) => {
                accepted += 1;
                log::info!("notification sent: {}", summary);
            }
            Ok(Ok(Delivery::Rejected(code))) => {
                log::warn!("notification {} rejected: HTTP {}", summary, code);
            }
            Ok(Err(err)) => log::error!("notification {} failed: {:#}", summary, err),
            Err(err) => log::error!("notification task for {} panicked: {}", summary, err),
        }
    }
    log::info!("notification worker stopped ({} delivered)", accepted);
    accepted
}
