//! One command at a time to the chip.
//!
//! The chip firmware misbehaves if a command arrives before the previous one
//! was answered, while the vendor application happily pipelines them. The
//! sequencer queues the application's commands and writes the next one only
//! after the chip reader reports a response.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use futures::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::bglib::Frame;
use crate::tracing::prelude::*;

pub const QUEUE_CAPACITY: usize = 100;

#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("Command queue full ({0} pending)")]
    QueueFull(usize),

    #[error("Chip link write failed: {0}")]
    Link(String),
}

pub struct CommandSequencer {
    queue: Mutex<VecDeque<Frame>>,
    capacity: usize,
    queued: Notify,
    /// Holds at most one permit, so responses that arrive while nothing is
    /// waiting collapse into one.
    response_ready: Notify,
    last_sent_reset: AtomicBool,
}

impl CommandSequencer {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            queued: Notify::new(),
            response_ready: Notify::new(),
            last_sent_reset: AtomicBool::new(false),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, frame: Frame) -> Result<(), SequencerError> {
        let mut queue = self.queue();
        if queue.len() >= self.capacity {
            return Err(SequencerError::QueueFull(queue.len()));
        }
        queue.push_back(frame);
        drop(queue);
        self.queued.notify_one();
        Ok(())
    }

    /// Drop all pending commands.
    pub fn clear_queue(&self) {
        let dropped = std::mem::take(&mut *self.queue()).len();
        if dropped > 0 {
            debug!(dropped, "Cleared command queue");
        }
    }

    /// Let the writer send the next command. Never blocks.
    pub fn signal_response_ready(&self) {
        self.response_ready.notify_one();
    }

    /// True if the most recent command written to the chip was a reset.
    pub fn last_sent_was_reset(&self) -> bool {
        self.last_sent_reset.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    async fn next(&self) -> Frame {
        loop {
            if let Some(frame) = self.queue().pop_front() {
                return frame;
            }
            self.queued.notified().await;
        }
    }

    /// Write queued commands to `link` until shutdown or a write error.
    pub async fn run<W>(&self, mut link: W, shutdown: CancellationToken) -> Result<(), SequencerError>
    where
        W: Sink<Frame> + Unpin,
        W::Error: Display,
    {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                frame = self.next() => frame,
            };

            self.last_sent_reset
                .store(frame.is_reset_command(), Ordering::Release);
            trace!(frame = ?frame, "=>chip");
            link.send(frame)
                .await
                .map_err(|e| SequencerError::Link(e.to_string()))?;

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = self.response_ready.notified() => {}
            }
        }
    }
}

impl Default for CommandSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bglib::protocol::Header;
    use futures::channel::mpsc;
    use futures::StreamExt;
    use std::sync::Arc;

    fn command(id: u8) -> Frame {
        Frame::command(0x03, id, &[])
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn start(seq: &Arc<CommandSequencer>) -> (mpsc::UnboundedReceiver<Frame>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded();
        let shutdown = CancellationToken::new();
        tokio::spawn({
            let seq = seq.clone();
            let shutdown = shutdown.clone();
            async move { seq.run(tx, shutdown).await }
        });
        (rx, shutdown)
    }

    #[tokio::test]
    async fn waits_for_response_between_writes() {
        let seq = Arc::new(CommandSequencer::new());
        seq.enqueue(command(1)).unwrap();
        seq.enqueue(command(2)).unwrap();
        let (mut rx, shutdown) = start(&seq);

        assert_eq!(rx.next().await.unwrap().command_id(), 1);
        settle().await;
        assert!(rx.try_next().is_err());
        assert_eq!(seq.pending(), 1);

        seq.signal_response_ready();
        assert_eq!(rx.next().await.unwrap().command_id(), 2);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn concurrent_enqueue_is_serialized() {
        let seq = Arc::new(CommandSequencer::new());
        let (mut rx, shutdown) = start(&seq);

        let producers: Vec<_> = (0..10u8)
            .map(|p| {
                let seq = seq.clone();
                tokio::spawn(async move {
                    for i in 0..10u8 {
                        seq.enqueue(command(p * 10 + i)).unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let mut written = Vec::new();
        while written.len() < 100 {
            written.push(rx.next().await.unwrap().command_id());
            settle().await;
            // Nothing else may be written until the response arrives
            assert!(rx.try_next().is_err());
            seq.signal_response_ready();
        }
        for producer in producers {
            producer.await.unwrap();
        }

        written.sort_unstable();
        assert_eq!(written, (0..100u8).collect::<Vec<_>>());
        shutdown.cancel();
    }

    #[test]
    fn full_queue_rejects() {
        let seq = CommandSequencer::with_capacity(2);
        seq.enqueue(command(1)).unwrap();
        seq.enqueue(command(2)).unwrap();
        assert!(matches!(seq.enqueue(command(3)), Err(SequencerError::QueueFull(2))));

        seq.clear_queue();
        assert_eq!(seq.pending(), 0);
        seq.enqueue(command(3)).unwrap();
    }

    #[tokio::test]
    async fn remembers_reset_command() {
        let seq = Arc::new(CommandSequencer::new());
        let (mut rx, shutdown) = start(&seq);

        seq.enqueue(Frame::command(0x01, 0x01, &[0x00])).unwrap();
        let sent = rx.next().await.unwrap();
        assert_eq!(sent.header(), Some(Header::SystemReset));
        assert!(seq.last_sent_was_reset());

        seq.signal_response_ready();
        seq.enqueue(command(0x18)).unwrap();
        rx.next().await.unwrap();
        assert!(!seq.last_sent_was_reset());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn signal_while_idle_is_kept_once() {
        let seq = Arc::new(CommandSequencer::new());
        seq.signal_response_ready();
        seq.signal_response_ready();
        let (mut rx, shutdown) = start(&seq);

        seq.enqueue(command(1)).unwrap();
        seq.enqueue(command(2)).unwrap();
        seq.enqueue(command(3)).unwrap();
        // The stored permit releases exactly one extra write
        rx.next().await.unwrap();
        rx.next().await.unwrap();
        settle().await;
        assert!(rx.try_next().is_err());
        shutdown.cancel();
    }
}
