//! Bounded per-connection message buffer.
//!
//! The buffer absorbs the speed difference between event production and a
//! single client's consumption. It never blocks: when full, the oldest
//! payload is discarded to make room for the newest one.

use crate::config::BufferConfig;
use crate::event::Payload;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Weight of the newest sample in the latency average.
const LATENCY_EWMA_ALPHA: f64 = 0.1;

/// What the buffer does when an enqueue finds it full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Discard the longest-queued payload.
    #[default]
    DropOldest,
}

/// A watermark crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkTransition {
    /// Depth rose to the high watermark.
    Paused,
    /// Depth fell to the low watermark.
    Resumed,
}

/// Result of [`MessageBuffer::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// `false` when an older payload was dropped to make room.
    pub accepted: bool,
    /// Watermark crossed by this enqueue, if any.
    pub transition: Option<WatermarkTransition>,
}

/// Result of [`MessageBuffer::dequeue`].
#[derive(Debug, Clone, PartialEq)]
pub struct Dequeued {
    /// The oldest retained payload.
    pub payload: Payload,
    /// Time the payload spent queued.
    pub waited: Duration,
    /// Watermark crossed by this dequeue, if any.
    pub transition: Option<WatermarkTransition>,
}

/// Point-in-time buffer metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferMetrics {
    /// Current number of queued payloads.
    pub depth: usize,
    /// Maximum number of queued payloads.
    pub capacity: usize,
    /// Payloads discarded since creation.
    pub dropped: u64,
    /// Rolling average of enqueue-to-dequeue latency.
    pub avg_latency: Duration,
    /// Whether the buffer is above its high watermark.
    pub paused: bool,
    /// Number of times the high watermark was crossed.
    pub pause_count: u64,
    /// Number of times the low watermark was crossed.
    pub resume_count: u64,
}

#[derive(Debug)]
struct Entry {
    payload: Payload,
    enqueued_at: Instant,
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<Entry>,
    dropped: u64,
    paused: bool,
    pause_count: u64,
    resume_count: u64,
    avg_latency_us: f64,
    latency_samples: u64,
}

/// A bounded FIFO queue with drop-oldest backpressure.
#[derive(Debug)]
pub struct MessageBuffer {
    capacity: usize,
    high_mark: usize,
    low_mark: usize,
    policy: DropPolicy,
    inner: Mutex<Inner>,
}

impl MessageBuffer {
    /// Create a buffer from a config.
    pub fn new(config: BufferConfig) -> Self {
        let capacity = config.capacity.max(1);
        let config = BufferConfig { capacity, ..config };
        Self {
            capacity,
            high_mark: config.high_mark(),
            low_mark: config.low_mark(),
            policy: DropPolicy::DropOldest,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                dropped: 0,
                paused: false,
                pause_count: 0,
                resume_count: 0,
                avg_latency_us: 0.0,
                latency_samples: 0,
            }),
        }
    }

    /// Create a buffer with default watermarks.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(BufferConfig::with_capacity(capacity))
    }

    /// Append a payload, discarding the oldest one if the buffer is full.
    pub fn enqueue(&self, payload: Payload) -> EnqueueOutcome {
        let mut inner = self.inner.lock();

        let mut accepted = true;
        if inner.queue.len() >= self.capacity {
            match self.policy {
                DropPolicy::DropOldest => {
                    inner.queue.pop_front();
                    inner.dropped += 1;
                    accepted = false;
                }
            }
        }

        inner.queue.push_back(Entry {
            payload,
            enqueued_at: Instant::now(),
        });

        let transition = if !inner.paused && inner.queue.len() >= self.high_mark {
            inner.paused = true;
            inner.pause_count += 1;
            Some(WatermarkTransition::Paused)
        } else {
            None
        };

        EnqueueOutcome {
            accepted,
            transition,
        }
    }

    /// Remove the oldest payload, if any.
    pub fn dequeue(&self) -> Option<Dequeued> {
        let mut inner = self.inner.lock();
        let entry = inner.queue.pop_front()?;

        let waited = entry.enqueued_at.elapsed();
        let sample = waited.as_secs_f64() * 1_000_000.0;
        inner.avg_latency_us = if inner.latency_samples == 0 {
            sample
        } else {
            inner.avg_latency_us + LATENCY_EWMA_ALPHA * (sample - inner.avg_latency_us)
        };
        inner.latency_samples += 1;

        let transition = if inner.paused && inner.queue.len() <= self.low_mark {
            inner.paused = false;
            inner.resume_count += 1;
            Some(WatermarkTransition::Resumed)
        } else {
            None
        };

        Some(Dequeued {
            payload: entry.payload,
            waited,
            transition,
        })
    }

    /// Remove every queued payload, returning how many were discarded.
    ///
    /// Discarded payloads count as dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.queue.len();
        inner.queue.clear();
        inner.dropped += n as u64;
        if inner.paused {
            inner.paused = false;
            inner.resume_count += 1;
        }
        n
    }

    /// Current depth.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Maximum depth.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The drop policy in force.
    pub fn policy(&self) -> DropPolicy {
        self.policy
    }

    /// Whether the buffer sits above its high watermark.
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Payloads discarded since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Snapshot of the buffer's metrics.
    pub fn metrics(&self) -> BufferMetrics {
        let inner = self.inner.lock();
        BufferMetrics {
            depth: inner.queue.len(),
            capacity: self.capacity,
            dropped: inner.dropped,
            avg_latency: Duration::from_micros(inner.avg_latency_us as u64),
            paused: inner.paused,
            pause_count: inner.pause_count,
            resume_count: inner.resume_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn payload(s: &str) -> Payload {
        Arc::from(s)
    }

    fn drain(buffer: &MessageBuffer) -> Vec<String> {
        std::iter::from_fn(|| buffer.dequeue().map(|d| d.payload.to_string())).collect()
    }

    #[test]
    fn test_fifo_order() {
        let buffer = MessageBuffer::with_capacity(10);
        for s in ["a", "b", "c"] {
            assert!(buffer.enqueue(payload(s)).accepted);
        }
        assert_eq!(drain(&buffer), vec!["a", "b", "c"]);
        assert!(buffer.dequeue().is_none());
    }

    #[test]
    fn test_drop_oldest_scenario() {
        let buffer = MessageBuffer::with_capacity(3);
        assert!(buffer.enqueue(payload("A")).accepted);
        assert!(buffer.enqueue(payload("B")).accepted);
        assert!(buffer.enqueue(payload("C")).accepted);
        assert!(!buffer.enqueue(payload("D")).accepted);

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(drain(&buffer), vec!["B", "C", "D"]);
    }

    #[test]
    fn test_watermark_scenario() {
        let buffer = MessageBuffer::with_capacity(10);

        for i in 0..7 {
            let outcome = buffer.enqueue(payload(&i.to_string()));
            assert_eq!(outcome.transition, None);
        }
        assert!(!buffer.is_paused());

        // Depth 8 is 80% of 10
        let outcome = buffer.enqueue(payload("7"));
        assert_eq!(outcome.transition, Some(WatermarkTransition::Paused));
        assert!(buffer.is_paused());

        // Draining to 6 keeps the connection paused
        for _ in 0..2 {
            assert_eq!(buffer.dequeue().unwrap().transition, None);
        }
        assert!(buffer.is_paused());

        // Depth 5 is 50% of 10
        let dequeued = buffer.dequeue().unwrap();
        assert_eq!(dequeued.transition, Some(WatermarkTransition::Resumed));
        assert!(!buffer.is_paused());
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_watermark_edge_triggered_while_full() {
        let buffer = MessageBuffer::with_capacity(10);
        for i in 0..50 {
            buffer.enqueue(payload(&i.to_string()));
        }
        let metrics = buffer.metrics();
        assert_eq!(metrics.pause_count, 1);
        assert_eq!(metrics.resume_count, 0);
        assert_eq!(metrics.dropped, 40);
        assert!(metrics.paused);
    }

    #[test]
    fn test_clear_counts_as_dropped() {
        let buffer = MessageBuffer::with_capacity(10);
        for i in 0..9 {
            buffer.enqueue(payload(&i.to_string()));
        }
        assert_eq!(buffer.clear(), 9);
        assert!(buffer.is_empty());
        assert!(!buffer.is_paused());
        assert_eq!(buffer.dropped(), 9);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer = MessageBuffer::with_capacity(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.enqueue(payload("a"));
        buffer.enqueue(payload("b"));
        assert_eq!(buffer.len(), 1);
        assert_eq!(drain(&buffer), vec!["b"]);
    }

    #[test]
    fn test_metrics_latency_recorded() {
        let buffer = MessageBuffer::with_capacity(4);
        buffer.enqueue(payload("a"));
        std::thread::sleep(Duration::from_millis(2));
        let dequeued = buffer.dequeue().unwrap();
        assert!(dequeued.waited >= Duration::from_millis(2));
        assert!(buffer.metrics().avg_latency >= Duration::from_millis(1));
    }

    #[test]
    fn test_concurrent_enqueue_dequeue() {
        let buffer = Arc::new(MessageBuffer::with_capacity(64));
        let producer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    buffer.enqueue(payload(&i.to_string()));
                }
            })
        };

        let mut last: Option<u64> = None;
        let mut received = 0u64;
        while !producer.is_finished() || !buffer.is_empty() {
            if let Some(d) = buffer.dequeue() {
                let n: u64 = d.payload.parse().unwrap();
                if let Some(prev) = last {
                    assert!(n > prev, "order violated: {} after {}", n, prev);
                }
                last = Some(n);
                received += 1;
            }
            assert!(buffer.len() <= 64);
        }
        producer.join().unwrap();
        assert_eq!(received + buffer.dropped(), 10_000);
    }

    proptest! {
        /// Property: depth never exceeds capacity
        #[test]
        fn prop_len_bounded(capacity in 1usize..64, ops in prop::collection::vec(any::<bool>(), 0..500)) {
            let buffer = MessageBuffer::with_capacity(capacity);
            for (i, enqueue) in ops.into_iter().enumerate() {
                if enqueue {
                    buffer.enqueue(payload(&i.to_string()));
                } else {
                    buffer.dequeue();
                }
                prop_assert!(buffer.len() <= capacity);
            }
        }

        /// Property: after N > capacity enqueues exactly the last `capacity` remain, in order
        #[test]
        fn prop_drop_oldest_keeps_tail(capacity in 1usize..32, extra in 1usize..100) {
            let buffer = MessageBuffer::with_capacity(capacity);
            let n = capacity + extra;
            let mut rejected = 0;
            for i in 0..n {
                if !buffer.enqueue(payload(&i.to_string())).accepted {
                    rejected += 1;
                }
            }
            let expected: Vec<String> = (n - capacity..n).map(|i| i.to_string()).collect();
            prop_assert_eq!(drain(&buffer), expected);
            prop_assert_eq!(buffer.dropped(), extra as u64);
            prop_assert_eq!(rejected, extra);
        }

        /// Property: pause and resume transitions strictly alternate
        #[test]
        fn prop_watermarks_alternate(ops in prop::collection::vec(any::<bool>(), 0..400)) {
            let buffer = MessageBuffer::with_capacity(10);
            let mut paused = false;
            for (i, enqueue) in ops.into_iter().enumerate() {
                let transition = if enqueue {
                    buffer.enqueue(payload(&i.to_string())).transition
                } else {
                    buffer.dequeue().and_then(|d| d.transition)
                };
                match transition {
                    Some(WatermarkTransition::Paused) => {
                        prop_assert!(!paused);
                        prop_assert_eq!(buffer.len(), 8);
                        paused = true;
                    }
                    Some(WatermarkTransition::Resumed) => {
                        prop_assert!(paused);
                        prop_assert_eq!(buffer.len(), 5);
                        paused = false;
                    }
                    None => {}
                }
                prop_assert_eq!(buffer.is_paused(), paused);
            }
            let metrics = buffer.metrics();
            prop_assert!(metrics.pause_count - metrics.resume_count <= 1);
        }
    }
}
