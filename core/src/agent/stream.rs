//! Streaming answer handle.
//!
//! Synthesis chunks are forwarded to the caller while the full text
//! accumulates in a shared buffer the agent keeps. The accumulated text
//! is what gets committed to conversation memory at the next turn
//! boundary, so the commit happens after the stream has drained, not
//! when it starts. If the caller drops the handle early the drain task
//! keeps accumulating so nothing is lost.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

use crate::llm::CompletionChunks;

/// A streamed answer: text chunks plus the growing full text.
#[derive(Debug)]
pub struct ResponseStream {
    rx: mpsc::Receiver<String>,
    collected: Arc<Mutex<String>>,
}

impl ResponseStream {
    /// Spawn the drain task over raw completion chunks. Returns the
    /// caller-facing stream and the shared buffer the agent keeps for
    /// the deferred memory commit.
    pub(crate) fn spawn(mut chunks: CompletionChunks) -> (Self, Arc<Mutex<String>>) {
        let collected = Arc::new(Mutex::new(String::new()));
        let buffer = collected.clone();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            while let Some(item) = chunks.recv().await {
                match item {
                    Ok(chunk) => {
                        buffer.lock().unwrap().push_str(&chunk);
                        // Receiver may be gone; keep accumulating regardless
                        let _ = tx.send(chunk).await;
                    }
                    Err(e) => {
                        warn!(target: "response_stream", error = %e, "Stream ended with error");
                        break;
                    }
                }
            }
        });

        (
            Self {
                rx,
                collected: collected.clone(),
            },
            collected,
        )
    }

    /// Next text increment; `None` once generation is complete
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drain the remainder and return the full answer text
    pub async fn collect(mut self) -> String {
        while self.rx.recv().await.is_some() {}
        let text = self.collected.lock().unwrap().clone();
        text
    }

    /// The text accumulated so far without consuming the stream
    pub fn text_so_far(&self) -> String {
        self.collected.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chunks_and_collect() {
        let (tx, rx) = mpsc::channel(8);
        for part in ["Hello", ", ", "world"] {
            tx.send(Ok(part.to_string())).await.unwrap();
        }
        drop(tx);

        let (stream, buffer) = ResponseStream::spawn(rx);
        let text = stream.collect().await;
        assert_eq!(text, "Hello, world");
        assert_eq!(*buffer.lock().unwrap(), "Hello, world");
    }

    #[tokio::test]
    async fn test_accumulates_after_handle_dropped() {
        let (tx, rx) = mpsc::channel(8);
        let (stream, buffer) = ResponseStream::spawn(rx);
        drop(stream);

        tx.send(Ok("still ".to_string())).await.unwrap();
        tx.send(Ok("recorded".to_string())).await.unwrap();
        drop(tx);

        // Give the drain task a moment to finish
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(*buffer.lock().unwrap(), "still recorded");
    }

    #[tokio::test]
    async fn test_error_ends_stream() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok("partial".to_string())).await.unwrap();
        tx.send(Err(crate::SkeinError::Llm("cut off".into())))
            .await
            .unwrap();
        drop(tx);

        let (stream, _) = ResponseStream::spawn(rx);
        assert_eq!(stream.collect().await, "partial");
    }
}
