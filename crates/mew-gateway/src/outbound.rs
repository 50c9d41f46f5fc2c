// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-participant bounded outbound queue.
//!
//! Each participant owns one queue. The router enqueues once per recipient;
//! a single writer task drains the queue to the live socket. Overflow
//! evicts the oldest entry so senders are never blocked by a slow
//! recipient. The queue outlives individual connections: a reconnect within
//! the grace window re-attaches a fresh writer to the same queue.

use mew_core::Envelope;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Notify;
use uuid::Uuid;

/// One unit of outbound work.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// A sealed envelope, serialized canonically at send time.
    Envelope(Box<Envelope>),
    /// A raw stream data frame.
    StreamData {
        /// Stream the frame belongs to.
        stream_id: Uuid,
        /// Authenticated frame writer, kept for drop accounting.
        from: String,
        /// Opaque frame bytes.
        data: Vec<u8>,
    },
    /// Ask the writer to close the socket.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// What a writer gets back from [`OutboundQueue::pop`].
#[derive(Debug)]
pub enum PopOutcome {
    /// Next frame to write.
    Frame(OutboundFrame),
    /// A newer connection took over this queue; the caller must stop.
    Superseded,
}

/// Result of pushing a stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPush {
    /// Frame enqueued.
    Enqueued,
    /// The per-queue stream frame bound was hit; the frame was refused.
    Overflow,
}

/// Bounded FIFO with drop-oldest overflow, pause support, and generation
/// tokens for last-writer-wins connection takeover.
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<VecDeque<OutboundFrame>>,
    notify: Notify,
    capacity: usize,
    stream_capacity: usize,
    stream_len: AtomicUsize,
    paused: AtomicBool,
    generation: AtomicU64,
}

impl OutboundQueue {
    /// Queue with the given envelope and stream frame bounds.
    pub fn new(capacity: usize, stream_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            stream_capacity,
            stream_len: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Enqueue an envelope. Returns the evicted oldest frame on overflow.
    pub fn push(&self, frame: OutboundFrame) -> Option<OutboundFrame> {
        let evicted = {
            let mut q = self.inner.lock().expect("outbound queue poisoned");
            let evicted = if q.len() >= self.capacity {
                q.pop_front()
            } else {
                None
            };
            q.push_back(frame);
            evicted
        };
        if let Some(OutboundFrame::StreamData { .. }) = &evicted {
            self.stream_len.fetch_sub(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Enqueue a stream data frame, subject to the separate (smaller)
    /// stream bound.
    pub fn push_stream(&self, stream_id: Uuid, from: &str, data: Vec<u8>) -> StreamPush {
        if self.stream_len.load(Ordering::Relaxed) >= self.stream_capacity {
            return StreamPush::Overflow;
        }
        self.stream_len.fetch_add(1, Ordering::Relaxed);
        self.push(OutboundFrame::StreamData {
            stream_id,
            from: from.to_string(),
            data,
        });
        StreamPush::Enqueued
    }

    /// Wait for the next frame. `my_generation` is the token handed to the
    /// writer at attach time; a takeover by a newer connection resolves
    /// every pending pop with [`PopOutcome::Superseded`].
    pub async fn pop(&self, my_generation: u64) -> PopOutcome {
        loop {
            let notified = self.notify.notified();
            if self.generation.load(Ordering::Acquire) != my_generation {
                return PopOutcome::Superseded;
            }
            if !self.paused.load(Ordering::Acquire) {
                let frame = self.inner.lock().expect("outbound queue poisoned").pop_front();
                if let Some(frame) = frame {
                    if matches!(frame, OutboundFrame::StreamData { .. }) {
                        self.stream_len.fetch_sub(1, Ordering::Relaxed);
                    }
                    return PopOutcome::Frame(frame);
                }
            }
            notified.await;
        }
    }

    /// Suspend delivery. Frames accumulate up to the bound.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resume delivery and wake the writer.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    /// Whether delivery is currently suspended.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Take over the queue for a new connection. Returns the new writer's
    /// generation token; any previous writer's pops resolve `Superseded`.
    pub fn attach_writer(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.notify.notify_waiters();
        generation
    }

    /// Current writer generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("outbound queue poisoned").len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mew_core::EnvelopeDraft;
    use serde_json::json;

    fn envelope_frame(n: usize) -> OutboundFrame {
        OutboundFrame::Envelope(Box::new(
            EnvelopeDraft::new("chat", json!({"n": n})).seal("alice"),
        ))
    }

    #[test]
    fn overflow_evicts_the_oldest() {
        let q = OutboundQueue::new(2, 2);
        assert!(q.push(envelope_frame(0)).is_none());
        assert!(q.push(envelope_frame(1)).is_none());
        let evicted = q.push(envelope_frame(2)).expect("oldest evicted");
        match evicted {
            OutboundFrame::Envelope(env) => assert_eq!(env.payload, json!({"n": 0})),
            other => panic!("unexpected eviction: {other:?}"),
        }
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn stream_bound_is_separate_and_refusing() {
        let q = OutboundQueue::new(16, 1);
        let id = Uuid::new_v4();
        assert_eq!(q.push_stream(id, "alice", vec![1]), StreamPush::Enqueued);
        assert_eq!(q.push_stream(id, "alice", vec![2]), StreamPush::Overflow);
        // Envelope pushes are unaffected by the stream bound.
        assert!(q.push(envelope_frame(0)).is_none());
    }

    #[tokio::test]
    async fn pop_waits_while_paused() {
        let q = std::sync::Arc::new(OutboundQueue::new(8, 8));
        let generation = q.attach_writer();
        q.pause();
        q.push(envelope_frame(0));

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop(generation).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        q.resume();
        match waiter.await.unwrap() {
            PopOutcome::Frame(OutboundFrame::Envelope(_)) => {}
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn takeover_supersedes_the_old_writer() {
        let q = std::sync::Arc::new(OutboundQueue::new(8, 8));
        let old = q.attach_writer();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop(old).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let new = q.attach_writer();
        assert!(matches!(waiter.await.unwrap(), PopOutcome::Superseded));

        // The new writer still sees queued frames.
        q.push(envelope_frame(1));
        assert!(matches!(q.pop(new).await, PopOutcome::Frame(_)));
    }
}
