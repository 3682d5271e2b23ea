//! Batches finalized transcript fragments into "process now" triggers.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::TranscriptId;

/// Bounded queue between the accept path and the coalescer loop.
const FRAGMENT_QUEUE_CAPACITY: usize = 100;

pub type Fragment = (String, TranscriptId);
pub type FragmentSender = mpsc::Sender<Fragment>;

#[derive(Debug, Clone, Copy)]
pub struct CoalescerConfig {
    /// Flush once this many words have accumulated.
    pub word_threshold: usize,
    /// Flush on this timeout when at least one fragment is buffered.
    pub window: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            word_threshold: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Collects transcript fragments and invokes a flush handler every
/// `word_threshold` words or `window` elapsed, whichever comes first.
///
/// The handler gets the latest transcript id of the flushed batch and is
/// never invoked with an empty buffer. Flushes are serialized: the next
/// window opens only after the handler returns. When every sender is
/// dropped, buffered fragments get one final flush and the loop exits.
pub struct TextCoalescer {
    tx: mpsc::Sender<Fragment>,
    rx: mpsc::Receiver<Fragment>,
    config: CoalescerConfig,
}

impl TextCoalescer {
    pub fn new(config: CoalescerConfig) -> Self {
        let (tx, rx) = mpsc::channel(FRAGMENT_QUEUE_CAPACITY);
        Self { tx, rx, config }
    }

    /// Producer handle. Dropping every clone closes the coalescer.
    pub fn sender(&self) -> FragmentSender {
        self.tx.clone()
    }

    /// Consumer loop; run inside the session task scope.
    ///
    /// Handler errors are logged and swallowed; the buffer and word count
    /// reset regardless so one bad flush cannot wedge the window.
    pub async fn run<F, Fut, E>(self, mut handler: F)
    where
        F: FnMut(TranscriptId) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: fmt::Display,
    {
        let TextCoalescer { tx, mut rx, config } = self;
        // Only external senders keep the queue open.
        drop(tx);

        let mut word_count = 0usize;
        let mut has_fragments = false;
        let mut last_transcript: Option<TranscriptId> = None;

        loop {
            let window = tokio::time::sleep(config.window);
            tokio::pin!(window);
            let mut closed = false;

            while word_count < config.word_threshold {
                tokio::select! {
                    _ = &mut window => break,
                    fragment = rx.recv() => match fragment {
                        Some((text, transcript_id)) => {
                            last_transcript = Some(transcript_id);
                            word_count += text.split_whitespace().count();
                            has_fragments = true;
                        }
                        None => {
                            closed = true;
                            break;
                        }
                    },
                }
            }

            if !has_fragments {
                if closed {
                    break;
                }
                // Window elapsed with nothing buffered: keep waiting.
                continue;
            }

            let transcript_id =
                last_transcript.expect("buffered batch always has a transcript id");
            if let Err(error) = handler(transcript_id).await {
                tracing::warn!(%error, "coalescer flush handler failed");
            }

            word_count = 0;
            has_fragments = false;
            last_transcript = None;

            if closed {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    fn collecting_handler(
        flushes: Arc<Mutex<Vec<TranscriptId>>>,
    ) -> impl FnMut(TranscriptId) -> std::future::Ready<Result<(), Infallible>> {
        move |tid| {
            flushes.lock().unwrap().push(tid);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_word_threshold_flushes_once() {
        let coalescer = TextCoalescer::new(CoalescerConfig {
            word_threshold: 10,
            window: Duration::from_secs(3600),
        });
        let sender = coalescer.sender();
        let flushes = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(coalescer.run(collecting_handler(flushes.clone())));

        let mut last = TranscriptId::generate();
        for _ in 0..10 {
            last = TranscriptId::generate();
            sender.send(("word".into(), last)).await.unwrap();
        }
        // Let the loop drain the queue and flush.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(flushes.lock().unwrap().as_slice(), &[last]);

        drop(sender);
        task.await.unwrap();
        // No extra flush on close: the buffer was already empty.
        assert_eq!(flushes.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_timeout_flushes_buffered_fragment() {
        let coalescer = TextCoalescer::new(CoalescerConfig {
            word_threshold: 1000,
            window: Duration::from_secs(1),
        });
        let sender = coalescer.sender();
        let flushes = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(coalescer.run(collecting_handler(flushes.clone())));

        let tid = TranscriptId::generate();
        sender.send(("three little words".into(), tid)).await.unwrap();
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(999)).await;
        tokio::task::yield_now().await;
        assert!(flushes.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(flushes.lock().unwrap().as_slice(), &[tid]);

        drop(sender);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_remainder() {
        let coalescer = TextCoalescer::new(CoalescerConfig {
            word_threshold: 100,
            window: Duration::from_secs(3600),
        });
        let sender = coalescer.sender();
        let flushes = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(coalescer.run(collecting_handler(flushes.clone())));

        let tid = TranscriptId::generate();
        sender.send(("partial batch".into(), tid)).await.unwrap();
        drop(sender);

        task.await.unwrap();
        assert_eq!(flushes.lock().unwrap().as_slice(), &[tid]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_without_fragments_exits_cleanly() {
        let coalescer = TextCoalescer::new(CoalescerConfig::default());
        let sender = coalescer.sender();
        let flushes = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(coalescer.run(collecting_handler(flushes.clone())));

        drop(sender);
        task.await.unwrap();
        assert!(flushes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_error_resets_window() {
        let coalescer = TextCoalescer::new(CoalescerConfig {
            word_threshold: 2,
            window: Duration::from_secs(3600),
        });
        let sender = coalescer.sender();
        let calls = Arc::new(Mutex::new(0usize));
        let calls_in_handler = calls.clone();
        let task = tokio::spawn(coalescer.run(move |_tid| {
            *calls_in_handler.lock().unwrap() += 1;
            std::future::ready(Err::<(), _>("analyzer queue full"))
        }));

        for _ in 0..2 {
            sender
                .send(("one two".into(), TranscriptId::generate()))
                .await
                .unwrap();
            tokio::task::yield_now().await;
            tokio::time::advance(Duration::from_millis(1)).await;
            tokio::task::yield_now().await;
        }

        // Both batches flushed despite the handler failing each time.
        assert_eq!(*calls.lock().unwrap(), 2);
        drop(sender);
        task.await.unwrap();
    }
}
