//! # Text Token Aggregator
//!
//! Text arrives from the backend fragment-by-fragment (sub-word tokens). The
//! aggregator concatenates fragments into a buffer and flushes the buffer as
//! one complete utterance once no new fragment has arrived for the debounce
//! window (600 ms by default). A fragment arriving before the timer fires
//! restarts it. Session teardown flushes any non-empty buffer immediately
//! rather than discarding it.
//!
//! The buffer and its timer are owned by a single task; callers only hand
//! fragments in and read utterances out, so there is no shared mutable state.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Debounced fragment buffer. Flushed utterances appear on the channel given
/// to [`TextAggregator::spawn`].
pub struct TextAggregator {
    fragments: mpsc::UnboundedSender<String>,
    worker: JoinHandle<()>,
}

impl TextAggregator {
    /// Spawn the aggregation task. `utterances` receives each flushed
    /// utterance as a single string.
    pub fn spawn(debounce: Duration, utterances: mpsc::Sender<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(debounce, rx, utterances));
        Self {
            fragments: tx,
            worker,
        }
    }

    /// Hand one text-frame payload to the aggregator.
    ///
    /// Payloads are expected to be UTF-8; anything else is recovered lossily
    /// and logged, never propagated as an error.
    pub fn push(&self, payload: &[u8]) {
        let fragment = match std::str::from_utf8(payload) {
            Ok(text) => text.to_string(),
            Err(err) => {
                warn!(error = %err, "text fragment is not valid UTF-8, recovering lossily");
                String::from_utf8_lossy(payload).into_owned()
            }
        };
        // The worker only goes away at teardown, where the buffer is flushed.
        let _ = self.fragments.send(fragment);
    }

    /// Tear down the aggregator, flushing a non-empty buffer immediately.
    pub async fn shutdown(self) {
        drop(self.fragments);
        let _ = self.worker.await;
    }
}

async fn run(
    debounce: Duration,
    mut fragments: mpsc::UnboundedReceiver<String>,
    utterances: mpsc::Sender<String>,
) {
    let mut buffer = String::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let flush_timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            fragment = fragments.recv() => match fragment {
                Some(fragment) => {
                    buffer.push_str(&fragment);
                    deadline = Some(Instant::now() + debounce);
                }
                // Channel closed: session teardown.
                None => break,
            },
            _ = flush_timer => {
                deadline = None;
                flush(&mut buffer, &utterances).await;
            }
        }
    }

    flush(&mut buffer, &utterances).await;
}

async fn flush(buffer: &mut String, utterances: &mpsc::Sender<String>) {
    if buffer.is_empty() {
        return;
    }
    let utterance = std::mem::take(buffer);
    debug!(chars = utterance.len(), "flushing utterance");
    if utterances.send(utterance).await.is_err() {
        debug!("utterance consumer gone, dropping flush");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(600);

    #[tokio::test(start_paused = true)]
    async fn test_fragments_flush_as_one_utterance() {
        let (tx, mut rx) = mpsc::channel(4);
        let aggregator = TextAggregator::spawn(DEBOUNCE, tx);

        for fragment in ["Hel", "lo", " there", "!"] {
            aggregator.push(fragment.as_bytes());
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        // 700ms of silence follows; exactly one flush.
        assert_eq!(rx.recv().await.unwrap(), "Hello there!");
        assert!(rx.try_recv().is_err());
        aggregator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_fragment_restarts_timer() {
        let (tx, mut rx) = mpsc::channel(4);
        let aggregator = TextAggregator::spawn(DEBOUNCE, tx);

        // Each gap is shorter than the debounce window, so no flush happens
        // until the silence after the last fragment.
        for fragment in ["a", "b", "c"] {
            aggregator.push(fragment.as_bytes());
            tokio::time::sleep(Duration::from_millis(400)).await;
        }

        assert_eq!(rx.recv().await.unwrap(), "abc");
        aggregator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_flushes_pending_buffer() {
        let (tx, mut rx) = mpsc::channel(4);
        let aggregator = TextAggregator::spawn(DEBOUNCE, tx);

        aggregator.push(b"cut off mid-");
        aggregator.push(b"sentence");
        aggregator.shutdown().await;

        assert_eq!(rx.recv().await.unwrap(), "cut off mid-sentence");
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_with_empty_buffer_emits_nothing() {
        let (tx, mut rx) = mpsc::channel(4);
        let aggregator = TextAggregator::spawn(DEBOUNCE, tx);
        aggregator.shutdown().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_utterances_flush_separately() {
        let (tx, mut rx) = mpsc::channel(4);
        let aggregator = TextAggregator::spawn(DEBOUNCE, tx);

        aggregator.push(b"first");
        assert_eq!(rx.recv().await.unwrap(), "first");

        aggregator.push(b"second");
        assert_eq!(rx.recv().await.unwrap(), "second");
        aggregator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_utf8_is_recovered() {
        let (tx, mut rx) = mpsc::channel(4);
        let aggregator = TextAggregator::spawn(DEBOUNCE, tx);

        aggregator.push(&[b'o', b'k', 0xff]);
        let flushed = rx.recv().await.unwrap();
        assert!(flushed.starts_with("ok"));
        aggregator.shutdown().await;
    }
}
