// src/pipe.rs
//! Bounded push/pull buffer linking transport delivery to a call's
//! consumer.
//!
//! A pipe is split into a producer handle and a consumer handle, each
//! used exclusively by one side. The producer blocks while the buffer is
//! full; closing never blocks, even against a full buffer. Buffered
//! items always drain before the consumer observes the terminal state.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::CallError;

/// The terminal state recorded by the first close.
#[derive(Debug, Clone)]
enum Terminal {
    Clean,
    Errored(CallError),
}

#[derive(Debug)]
struct Shared {
    terminal: Mutex<Option<Terminal>>,
}

/// Create a pipe with room for `capacity` buffered items.
pub fn pipe<T>(capacity: usize) -> (PipeSender<T>, PipeReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let shared = Arc::new(Shared {
        terminal: Mutex::new(None),
    });
    let sender = PipeSender {
        inner: Arc::new(SenderInner {
            tx: Mutex::new(Some(tx)),
            shared: shared.clone(),
        }),
    };
    let receiver = PipeReceiver {
        rx,
        shared,
        done: false,
    };
    (sender, receiver)
}

#[derive(Debug)]
struct SenderInner<T> {
    /// Dropped on close so the receiver sees the channel end after
    /// draining the buffer.
    tx: Mutex<Option<mpsc::Sender<T>>>,
    shared: Arc<Shared>,
}

/// Producer half of a pipe. Cheap to clone; clones share closure state.
#[derive(Debug)]
pub struct PipeSender<T> {
    inner: Arc<SenderInner<T>>,
}

impl<T> Clone for PipeSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// The pipe was closed before or during a pour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeClosed;

impl std::fmt::Display for PipeClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipe closed")
    }
}

impl std::error::Error for PipeClosed {}

impl<T> PipeSender<T> {
    /// Push one item, waiting while the buffer is full.
    pub async fn pour(&self, item: T) -> Result<(), PipeClosed> {
        let tx = self.inner.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(item).await.map_err(|_| PipeClosed),
            None => Err(PipeClosed),
        }
    }

    /// End the pipe cleanly. The consumer drains buffered items, then
    /// sees end of stream.
    pub fn close(&self) {
        self.terminate(Terminal::Clean);
    }

    /// End the pipe with an error. The consumer drains buffered items,
    /// then sees the error.
    pub fn close_with_error(&self, err: CallError) {
        self.terminate(Terminal::Errored(err));
    }

    fn terminate(&self, terminal: Terminal) {
        {
            let mut slot = self.inner.shared.terminal.lock();
            if slot.is_none() {
                *slot = Some(terminal);
            }
            // First close wins; later closes only release the sender.
        }
        *self.inner.tx.lock() = None;
    }
}

/// Consumer half of a pipe.
#[derive(Debug)]
pub struct PipeReceiver<T> {
    rx: mpsc::Receiver<T>,
    shared: Arc<Shared>,
    done: bool,
}

impl<T> PipeReceiver<T> {
    /// Pull the next item. After the pipe ends this keeps returning the
    /// terminal result: `Ok(None)` for a clean close (or a dropped
    /// producer), the stored error for an error close.
    pub async fn next(&mut self) -> Result<Option<T>, CallError> {
        if !self.done {
            if let Some(item) = self.rx.recv().await {
                return Ok(Some(item));
            }
            self.done = true;
        }
        match &*self.shared.terminal.lock() {
            Some(Terminal::Errored(err)) => Err(err.clone()),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn items_arrive_in_order() {
        let (tx, mut rx) = pipe(5);
        tx.pour(1).await.unwrap();
        tx.pour(2).await.unwrap();
        tx.pour(3).await.unwrap();
        assert_eq!(rx.next().await.unwrap(), Some(1));
        assert_eq!(rx.next().await.unwrap(), Some(2));
        assert_eq!(rx.next().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn pour_blocks_at_capacity() {
        let (tx, mut rx) = pipe(2);
        tx.pour(1).await.unwrap();
        tx.pour(2).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(20), tx.pour(3)).await;
        assert!(blocked.is_err(), "third pour should wait for room");

        assert_eq!(rx.next().await.unwrap(), Some(1));
        tokio::time::timeout(Duration::from_millis(20), tx.pour(3))
            .await
            .expect("room after one pull")
            .unwrap();
    }

    #[tokio::test]
    async fn buffered_items_drain_before_clean_end() {
        let (tx, mut rx) = pipe(5);
        tx.pour("a").await.unwrap();
        tx.pour("b").await.unwrap();
        tx.close();

        assert_eq!(rx.next().await.unwrap(), Some("a"));
        assert_eq!(rx.next().await.unwrap(), Some("b"));
        assert_eq!(rx.next().await.unwrap(), None);
        // End of stream repeats.
        assert_eq!(rx.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn error_close_surfaces_after_drain() {
        let (tx, mut rx) = pipe(5);
        tx.pour(7).await.unwrap();
        tx.close_with_error(CallError::new("bad"));

        assert_eq!(rx.next().await.unwrap(), Some(7));
        assert_eq!(rx.next().await.unwrap_err().message, "bad");
        // The stored error repeats.
        assert_eq!(rx.next().await.unwrap_err().message, "bad");
    }

    #[tokio::test]
    async fn close_wins_over_later_error() {
        let (tx, mut rx) = pipe::<i32>(5);
        tx.close();
        tx.close_with_error(CallError::new("late"));
        assert_eq!(rx.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_does_not_block_on_full_buffer() {
        let (tx, mut rx) = pipe(1);
        tx.pour(1).await.unwrap();
        tx.close_with_error(CallError::new("full"));
        assert_eq!(rx.next().await.unwrap(), Some(1));
        assert_eq!(rx.next().await.unwrap_err().message, "full");
    }

    #[tokio::test]
    async fn pour_after_close_fails() {
        let (tx, _rx) = pipe(5);
        tx.close();
        assert_eq!(tx.pour(1).await, Err(PipeClosed));
    }

    #[tokio::test]
    async fn dropped_sender_reads_as_clean_end() {
        let (tx, mut rx) = pipe::<i32>(5);
        drop(tx);
        assert_eq!(rx.next().await.unwrap(), None);
    }
}
