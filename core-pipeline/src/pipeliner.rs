//! # Two-Stage Pipeliner
//!
//! Overlaps synthesis of one item with encoding of the previous one:
//!
//! ```text
//! submit ──▶ [synthesis queue] ──▶ synthesis stage ──▶ [encoding queue] ──▶ encoding stage
//! ```
//!
//! Both queues are bounded, so a slow encoder throttles synthesis and a slow
//! synthesizer throttles the producer. `finish()` enqueues a drain marker
//! that flows through both stages and ends them in order. Each stage polls
//! its queue with a timeout so `cancel()` is noticed within one poll
//! interval even when nothing arrives.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Queue entry: a work item or the drain marker.
#[derive(Debug)]
pub enum StageMessage<T> {
    Item(T),
    Drain,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub struct StagePipeliner<S, E> {
    synthesis_tx: mpsc::Sender<StageMessage<S>>,
    synthesis_rx: Mutex<Option<mpsc::Receiver<StageMessage<S>>>>,
    encoding_tx: mpsc::Sender<StageMessage<E>>,
    encoding_rx: Mutex<Option<mpsc::Receiver<StageMessage<E>>>>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl<S: Send, E: Send> StagePipeliner<S, E> {
    pub fn new(queue_size: usize, poll_interval: Duration) -> Self {
        let (synthesis_tx, synthesis_rx) = mpsc::channel(queue_size.max(1));
        let (encoding_tx, encoding_rx) = mpsc::channel(queue_size.max(1));
        Self {
            synthesis_tx,
            synthesis_rx: Mutex::new(Some(synthesis_rx)),
            encoding_tx,
            encoding_rx: Mutex::new(Some(encoding_rx)),
            cancel: CancellationToken::new(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Enqueues an item for synthesis, waiting while the queue is full.
    pub async fn submit(&self, item: S) -> Result<()> {
        self.send(&self.synthesis_tx, StageMessage::Item(item)).await
    }

    /// Enqueues the drain marker behind all submitted items.
    pub async fn finish(&self) -> Result<()> {
        self.send(&self.synthesis_tx, StageMessage::Drain).await
    }

    /// Runs `f` on each queued item and forwards successes downstream.
    pub async fn run_synthesis_stage<F, Fut>(&self, mut f: F) -> Result<StageReport>
    where
        F: FnMut(S) -> Fut,
        Fut: Future<Output = Result<E>>,
    {
        let mut rx = take_receiver(&self.synthesis_rx, "synthesis")?;
        let mut report = StageReport::default();

        loop {
            let Some(message) = self.poll(&mut rx, &mut report).await else {
                break;
            };
            match message {
                StageMessage::Drain => {
                    if self.send(&self.encoding_tx, StageMessage::Drain).await.is_err() {
                        report.cancelled = true;
                    }
                    break;
                }
                StageMessage::Item(item) => match f(item).await {
                    Ok(output) => {
                        report.completed += 1;
                        if self
                            .send(&self.encoding_tx, StageMessage::Item(output))
                            .await
                            .is_err()
                        {
                            report.cancelled = true;
                            break;
                        }
                    }
                    Err(err) if err.is_cancelled() => {
                        report.cancelled = true;
                        break;
                    }
                    Err(err) => {
                        report.failed += 1;
                        warn!(error = %err, "Synthesis stage dropped an item");
                    }
                },
            }
        }

        debug!(?report, "Synthesis stage finished");
        Ok(report)
    }

    /// Runs `f` on each synthesized item and collects the outputs in arrival
    /// order.
    pub async fn run_encoding_stage<F, Fut, O>(&self, mut f: F) -> Result<(StageReport, Vec<O>)>
    where
        F: FnMut(E) -> Fut,
        Fut: Future<Output = Result<O>>,
    {
        let mut rx = take_receiver(&self.encoding_rx, "encoding")?;
        let mut report = StageReport::default();
        let mut outputs = Vec::new();

        loop {
            let Some(message) = self.poll(&mut rx, &mut report).await else {
                break;
            };
            match message {
                StageMessage::Drain => break,
                StageMessage::Item(item) => match f(item).await {
                    Ok(output) => {
                        report.completed += 1;
                        outputs.push(output);
                    }
                    Err(err) if err.is_cancelled() => {
                        report.cancelled = true;
                        break;
                    }
                    Err(err) => {
                        report.failed += 1;
                        warn!(error = %err, "Encoding stage dropped an item");
                    }
                },
            }
        }

        debug!(?report, "Encoding stage finished");
        Ok((report, outputs))
    }

    /// Next message, or `None` once cancelled or every sender is gone.
    async fn poll<T>(
        &self,
        rx: &mut mpsc::Receiver<StageMessage<T>>,
        report: &mut StageReport,
    ) -> Option<StageMessage<T>> {
        loop {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                return None;
            }
            match timeout(self.poll_interval, rx.recv()).await {
                Ok(Some(message)) => return Some(message),
                Ok(None) => return None,
                Err(_) => continue,
            }
        }
    }

    async fn send<T>(&self, tx: &mpsc::Sender<StageMessage<T>>, message: StageMessage<T>) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            sent = tx.send(message) => sent.map_err(|_| PipelineError::Cancelled),
        }
    }
}

fn take_receiver<T>(
    slot: &Mutex<Option<mpsc::Receiver<StageMessage<T>>>>,
    stage: &str,
) -> Result<mpsc::Receiver<StageMessage<T>>> {
    slot.lock()
        .take()
        .ok_or_else(|| PipelineError::Worker(format!("{} stage is already running", stage)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_items_flow_through_both_stages_in_order() {
        let pipeliner: StagePipeliner<u32, u32> = StagePipeliner::new(2, Duration::from_millis(10));

        let producer = async {
            for item in 1..=5 {
                pipeliner.submit(item).await.unwrap();
            }
            pipeliner.finish().await.unwrap();
        };
        let synthesis = pipeliner.run_synthesis_stage(|item| async move { Ok(item * 10) });
        let encoding = pipeliner.run_encoding_stage(|item| async move { Ok(item + 1) });

        let ((), synthesis, encoding) = tokio::join!(producer, synthesis, encoding);
        let synthesis = synthesis.unwrap();
        let (encoding, outputs) = encoding.unwrap();

        assert_eq!(outputs, vec![11, 21, 31, 41, 51]);
        assert_eq!(synthesis.completed, 5);
        assert_eq!(encoding.completed, 5);
        assert!(!synthesis.cancelled && !encoding.cancelled);
    }

    #[tokio::test]
    async fn test_synthesis_failure_drops_item() {
        let pipeliner: StagePipeliner<u32, u32> = StagePipeliner::new(4, Duration::from_millis(10));

        let producer = async {
            for item in 0..4 {
                pipeliner.submit(item).await.unwrap();
            }
            pipeliner.finish().await.unwrap();
        };
        let synthesis = pipeliner.run_synthesis_stage(|item| async move {
            if item == 2 {
                Err(PipelineError::chapter(2, "No audio generated"))
            } else {
                Ok(item)
            }
        });
        let encoding = pipeliner.run_encoding_stage(|item| async move { Ok(item) });

        let ((), synthesis, encoding) = tokio::join!(producer, synthesis, encoding);
        let synthesis = synthesis.unwrap();
        let (encoding, outputs) = encoding.unwrap();

        assert_eq!(synthesis.failed, 1);
        assert_eq!(synthesis.completed, 3);
        assert_eq!(encoding.completed, 3);
        assert_eq!(outputs, vec![0, 1, 3]);
    }

    #[tokio::test]
    async fn test_cancel_exits_within_poll_interval() {
        let poll = Duration::from_millis(20);
        let pipeliner: StagePipeliner<u32, u32> = StagePipeliner::new(1, poll);

        let started = Instant::now();
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            pipeliner.cancel();
        };
        let synthesis = pipeliner.run_synthesis_stage(|item| async move { Ok(item) });
        let encoding = pipeliner.run_encoding_stage(|item| async move { Ok(item) });

        let ((), synthesis, encoding) = tokio::join!(canceller, synthesis, encoding);

        assert!(synthesis.unwrap().cancelled);
        assert!(encoding.unwrap().0.cancelled);
        assert!(started.elapsed() < Duration::from_millis(30) + poll * 5);
        assert!(pipeliner.submit(1).await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_cancel() {
        let pipeliner: StagePipeliner<u32, u32> = StagePipeliner::new(1, Duration::from_millis(10));
        pipeliner.submit(1).await.unwrap();

        let blocked = pipeliner.submit(2);
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pipeliner.cancel();
        };
        let (result, ()) = tokio::join!(blocked, canceller);

        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_stage_cannot_run_twice() {
        let pipeliner: StagePipeliner<u32, u32> = StagePipeliner::new(1, Duration::from_millis(5));
        pipeliner.finish().await.unwrap();

        let first = pipeliner
            .run_synthesis_stage(|item| async move { Ok(item) })
            .await
            .unwrap();
        assert_eq!(first, StageReport::default());

        let second = pipeliner
            .run_synthesis_stage(|item| async move { Ok(item) })
            .await;
        assert!(matches!(second, Err(PipelineError::Worker(_))));
    }
}
