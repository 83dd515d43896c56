//! Bounded, single-producer/single-consumer line queue with a mandatory
//! drop-newest overflow policy, and the pipeline that drains it into a
//! `Parser`.
//!
//! Dropping newest lines instead of blocking the worker is load-bearing: a
//! blocked worker would distort the offered load we're trying to measure.
//! The drop counter and the derived `degraded` flag make that distortion
//! observable instead of silent.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::parsers::Parser;

/// Maximum number of lines held in flight between producer and consumer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default fraction of dropped/read lines above which a stream is
/// considered degraded.
pub const DEFAULT_DROP_THRESHOLD: f64 = 0.01;

/// Shared, lock-free counters for one line stream.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    lines_read: AtomicU64,
    lines_dropped: AtomicU64,
    lines_parsed: AtomicU64,
}

impl PipelineCounters {
    pub fn lines_read(&self) -> u64 {
        self.lines_read.load(Ordering::Relaxed)
    }

    pub fn lines_dropped(&self) -> u64 {
        self.lines_dropped.load(Ordering::Relaxed)
    }

    pub fn lines_parsed(&self) -> u64 {
        self.lines_parsed.load(Ordering::Relaxed)
    }

    /// `dropped / max(1, read) > threshold`.
    pub fn degraded(&self, threshold: f64) -> bool {
        let read = self.lines_read().max(1) as f64;
        (self.lines_dropped() as f64 / read) > threshold
    }
}

/// A bounded queue of whole lines with single-producer/single-consumer
/// semantics and drop-newest overflow.
///
/// Backed by a bounded `tokio::sync::mpsc` channel of capacity `C` used in
/// `try_send` mode only on the producer side, so the producer never awaits
/// and therefore never blocks the worker whose stdout/stderr it is draining.
pub struct BoundedLineQueue {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Option<mpsc::Receiver<Vec<u8>>>,
    counters: Arc<PipelineCounters>,
}

impl BoundedLineQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Some(rx),
            counters: Arc::new(PipelineCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        self.counters.clone()
    }

    /// Producer-side handle: push one line, dropping it (and counting the
    /// drop) if the queue is full. Never blocks.
    pub fn producer(&self) -> LineProducer {
        LineProducer {
            tx: self.tx.clone(),
            counters: self.counters.clone(),
        }
    }

    /// Take the consumer half. May only be called once.
    pub fn take_receiver(&mut self) -> mpsc::Receiver<Vec<u8>> {
        self.rx.take().expect("receiver already taken")
    }
}

#[derive(Clone)]
pub struct LineProducer {
    tx: mpsc::Sender<Vec<u8>>,
    counters: Arc<PipelineCounters>,
}

impl LineProducer {
    /// Enqueue one line. Drops and counts on overflow or if the consumer
    /// has gone away.
    pub fn push(&self, line: Vec<u8>) {
        self.counters.lines_read.fetch_add(1, Ordering::Relaxed);
        if self.tx.try_send(line).is_err() {
            self.counters.lines_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Consumer side: drains a `BoundedLineQueue` and feeds each line to a
/// `Parser`, tracking how many were actually parsed.
pub struct ParserPipeline<P> {
    rx: mpsc::Receiver<Vec<u8>>,
    parser: P,
    counters: Arc<PipelineCounters>,
}

impl<P: Parser> ParserPipeline<P> {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>, parser: P, counters: Arc<PipelineCounters>) -> Self {
        Self { rx, parser, counters }
    }

    /// Drain until the queue is closed (producer dropped / EOF observed).
    pub async fn run(mut self) -> P {
        while let Some(line) = self.rx.recv().await {
            let text = String::from_utf8_lossy(&line);
            self.parser.parse_line(&text);
            self.counters.lines_parsed.fetch_add(1, Ordering::Relaxed);
        }
        self.parser
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::Parser;
    use std::sync::Mutex;

    struct CollectingParser(Arc<Mutex<Vec<String>>>);
    impl Parser for CollectingParser {
        fn parse_line(&mut self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    #[tokio::test]
    async fn drops_newest_on_overflow_without_blocking() {
        let mut queue = BoundedLineQueue::new(2);
        let producer = queue.producer();
        let rx = queue.take_receiver();

        // Fill beyond capacity before any consumer runs; push must never block.
        for i in 0..10 {
            producer.push(format!("line{i}").into_bytes());
        }

        let counters = queue.counters();
        assert_eq!(counters.lines_read(), 10);
        assert!(counters.lines_dropped() > 0);

        drop(rx);
    }

    #[tokio::test]
    async fn all_enqueued_lines_are_parsed_when_under_capacity() {
        let mut queue = BoundedLineQueue::new(16);
        let producer = queue.producer();
        let rx = queue.take_receiver();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let counters = queue.counters();

        for i in 0..5 {
            producer.push(format!("line{i}").into_bytes());
        }
        drop(producer);

        let pipeline = ParserPipeline::new(rx, CollectingParser(sink.clone()), counters.clone());
        pipeline.run().await;

        assert_eq!(sink.lock().unwrap().len(), 5);
        assert_eq!(counters.lines_parsed(), 5);
        assert_eq!(counters.lines_dropped(), 0);
    }

    #[test]
    fn degraded_flag_respects_threshold() {
        let counters = PipelineCounters::default();
        counters.lines_read.store(1000, Ordering::Relaxed);
        counters.lines_dropped.store(5, Ordering::Relaxed);
        assert!(!counters.degraded(0.01));
        counters.lines_dropped.store(20, Ordering::Relaxed);
        assert!(counters.degraded(0.01));
    }

    #[test]
    fn degraded_guards_against_div_by_zero() {
        let counters = PipelineCounters::default();
        assert!(!counters.degraded(0.01));
    }
}
