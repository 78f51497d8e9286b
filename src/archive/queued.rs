//! Asynchronous archival queue
//!
//! Rendering hands frames to a [`QueuedArchive`] without waiting on storage.
//! A drain task appends them in submission order, retrying IO failures with
//! exponential backoff. Delivery is at-least-once: a retried append that had
//! in fact succeeded comes back as a duplicate and is discarded.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use super::{AppendOutcome, FrameArchive, FrameSink};
use crate::render::Frame;
use crate::{Error, Result};

/// Backoff for retried appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound on any delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// What the drain task did before the queue closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Frames stored
    pub appended: u64,
    /// Frames discarded as duplicates
    pub duplicates: u64,
    /// Frames dropped after exhausting retries or failing permanently
    pub failed: u64,
}

/// Sink that forwards frames to a background drain task.
///
/// Dropping every clone closes the queue; the drain task then finishes and
/// its handle yields a [`DrainReport`].
#[derive(Debug, Clone)]
pub struct QueuedArchive {
    sender: mpsc::UnboundedSender<Frame>,
}

impl QueuedArchive {
    /// Spawn the drain task on the current tokio runtime.
    #[must_use]
    pub fn spawn<A>(archive: Arc<A>, retry: RetryPolicy) -> (Self, JoinHandle<DrainReport>)
    where
        A: FrameArchive + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Frame>();
        let handle = tokio::spawn(async move {
            let mut report = DrainReport::default();
            while let Some(frame) = receiver.recv().await {
                match append_with_retry(&archive, frame, retry).await {
                    Ok(AppendOutcome::Appended(_)) => report.appended += 1,
                    Ok(AppendOutcome::Duplicate(_)) => report.duplicates += 1,
                    Err(err) => {
                        warn!(error = %err, "frame dropped by archive queue");
                        report.failed += 1;
                    }
                }
            }
            debug!(?report, "archive queue drained");
            report
        });
        (Self { sender }, handle)
    }
}

impl FrameSink for QueuedArchive {
    fn submit(&self, frame: Frame) -> Result<()> {
        self.sender.send(frame).map_err(|_| Error::QueueClosed)
    }
}

async fn append_with_retry<A>(archive: &Arc<A>, frame: Frame, retry: RetryPolicy) -> Result<AppendOutcome>
where
    A: FrameArchive + 'static,
{
    let mut attempt = 0;
    loop {
        let target = Arc::clone(archive);
        let pending = frame.clone();
        // Storage backends block on IO; keep them off the reactor.
        let result = tokio::task::spawn_blocking(move || target.append(pending))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))
            .and_then(|r| r);

        match result {
            Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    error = %err,
                    attempt = attempt + 1,
                    max = retry.max_retries + 1,
                    ?delay,
                    "frame append failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
