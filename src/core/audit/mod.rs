//! Audit pipeline for authorization decisions
//!
//! Decisions are recorded without waiting on storage:
//! - records enter a bounded queue; senders block while it is full
//! - a fixed pool of worker threads drains the queue into per-worker buffers
//! - a buffer is flushed to the [`AuditSink`] when it reaches the batch size
//!   or when the flush interval has passed since its last flush
//! - [`AuditPipeline::stop`] closes the queue, lets every worker drain and
//!   flush what it holds, then joins them
//!
//! Records sent after stop are dropped and counted. Records queued before
//! [`AuditPipeline::start`] wait for the workers; if the pipeline is stopped
//! without ever starting, `stop` flushes them on the calling thread.

mod record;

pub use record::{AuditRecord, Conclusion};

use crate::config::AuditOptions;
use crate::error::{AuthzError, Result};
use crate::store::AuditSink;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// How long a blocked sender holds the queue before rechecking for stop
const SEND_RETRY: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Counters {
    accepted: CachePadded<AtomicU64>,
    filtered: AtomicU64,
    dropped: AtomicU64,
    flushed: AtomicU64,
    failed: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditStats {
    /// Records queued for flushing
    pub accepted: u64,
    /// Records skipped by the username filters
    pub filtered: u64,
    /// Records sent after stop
    pub dropped: u64,
    /// Records the sink accepted
    pub flushed: u64,
    /// Records in batches the sink rejected
    pub failed: u64,
    /// Calls made to the sink
    pub flushes: u64,
}

/// Bounded, batching, multi-worker audit writer
pub struct AuditPipeline {
    options: AuditOptions,
    sink: Arc<dyn AuditSink>,
    sender: RwLock<Option<Sender<AuditRecord>>>,
    receiver: Receiver<AuditRecord>,
    started: AtomicBool,
    stopped: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl AuditPipeline {
    pub fn new(options: AuditOptions, sink: Arc<dyn AuditSink>) -> Self {
        let (sender, receiver) = bounded(options.records_buffer_size.max(1));
        AuditPipeline {
            options,
            sink,
            sender: RwLock::new(Some(sender)),
            receiver,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn options(&self) -> &AuditOptions {
        &self.options
    }

    /// Spawn `worker_count` workers. Fails if already started or stopped.
    pub fn start(&self, worker_count: usize) -> Result<()> {
        if worker_count == 0 {
            return Err(AuthzError::Config("audit worker count must be positive".into()));
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(AuthzError::Pipeline("pipeline already stopped".into()));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(AuthzError::Pipeline("pipeline already started".into()));
        }

        let batch_size = self.options.batch_size();
        let interval = self.options.flush_interval();
        let mut workers = self.workers.lock();

        for id in 0..worker_count {
            let worker = self.worker(id);
            let handle = thread::Builder::new()
                .name(format!("audit-worker-{id}"))
                .spawn(move || worker.run())?;
            workers.push(handle);
        }

        info!(
            workers = worker_count,
            batch_size,
            interval_ms = interval.as_millis() as u64,
            "Audit pipeline started"
        );
        Ok(())
    }

    /// Queue a record, blocking while the queue is full
    ///
    /// Never fails the caller: filtered records and records arriving after
    /// stop are counted and discarded.
    pub fn send_record(&self, record: AuditRecord) {
        if self.stopped.load(Ordering::Acquire) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(username = %record.username, "Audit pipeline stopped, dropping record");
            return;
        }

        if !self.options.filters.should_record(&record.username) {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut record = record;
        loop {
            // The read guard is released between attempts so `stop` can close the queue
            let sender = self.sender.read();
            let Some(tx) = sender.as_ref() else {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            };
            match tx.send_timeout(record, SEND_RETRY) {
                Ok(()) => {
                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(SendTimeoutError::Timeout(pending)) => {
                    drop(sender);
                    if self.stopped.load(Ordering::Acquire) {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    record = pending;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    /// Close the queue, drain and flush every worker, then join them. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        // Receivers see disconnection once the last sender is gone
        drop(self.sender.write().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() && !self.receiver.is_empty() {
            debug!(queued = self.receiver.len(), "Draining audit records queued before start");
            self.worker(0).run();
        }
        for handle in workers {
            if handle.join().is_err() {
                error!("Audit worker panicked during drain");
            }
        }

        let stats = self.stats();
        info!(
            accepted = stats.accepted,
            flushed = stats.flushed,
            failed = stats.failed,
            dropped = stats.dropped,
            "Audit pipeline stopped"
        );
    }

    fn worker(&self, id: usize) -> Worker {
        Worker {
            id,
            receiver: self.receiver.clone(),
            sink: Arc::clone(&self.sink),
            key: self.options.key.clone(),
            batch_size: self.options.batch_size(),
            interval: self.options.flush_interval(),
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Records currently queued
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    pub fn stats(&self) -> AuditStats {
        let c = &self.counters;
        AuditStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            filtered: c.filtered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AuditPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    id: usize,
    receiver: Receiver<AuditRecord>,
    sink: Arc<dyn AuditSink>,
    key: String,
    batch_size: usize,
    interval: Duration,
    counters: Arc<Counters>,
}

impl Worker {
    fn run(self) {
        let mut buffer: Vec<Vec<u8>> = Vec::with_capacity(self.batch_size);
        let mut last_flush = Instant::now();

        loop {
            let wait = self.interval.saturating_sub(last_flush.elapsed());
            let due = match self.receiver.recv_timeout(wait) {
                Ok(record) => {
                    match serde_json::to_vec(&record) {
                        Ok(bytes) => buffer.push(bytes),
                        Err(e) => {
                            warn!(worker = self.id, error = %e, "Failed to encode audit record");
                        }
                    }
                    buffer.len() >= self.batch_size || last_flush.elapsed() >= self.interval
                }
                Err(RecvTimeoutError::Timeout) => true,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            if due {
                self.flush(&mut buffer);
                last_flush = Instant::now();
            }
        }

        self.flush(&mut buffer);
        debug!(worker = self.id, "Audit worker drained");
    }

    fn flush(&self, buffer: &mut Vec<Vec<u8>>) {
        if buffer.is_empty() {
            return;
        }

        let count = buffer.len() as u64;
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        match self.sink.append_batch(&self.key, buffer) {
            Ok(()) => {
                self.counters.flushed.fetch_add(count, Ordering::Relaxed);
                debug!(worker = self.id, records = count, "Flushed audit batch");
            }
            Err(e) => {
                self.counters.failed.fetch_add(count, Ordering::Relaxed);
                error!(worker = self.id, records = count, error = %e, "Failed to flush audit batch");
            }
        }
        buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditFilters;
    use crate::iam::{DecisionRequest, DecisionResponse};

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<usize>>,
        failing: AtomicBool,
    }

    impl AuditSink for RecordingSink {
        fn append_batch(&self, _key: &str, records: &[Vec<u8>]) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(AuthzError::StoreDown);
            }
            self.batches.lock().push(records.len());
            Ok(())
        }
    }

    fn options(buffer: usize, threshold: usize, interval_ms: u64) -> AuditOptions {
        AuditOptions {
            pool_size: 1,
            records_buffer_size: buffer,
            flush_threshold: threshold,
            max_sync_time_ms: interval_ms,
            ..AuditOptions::default()
        }
    }

    fn record(username: &str) -> AuditRecord {
        let request = DecisionRequest::new(format!("users:{username}"), "read", "doc:1");
        AuditRecord::new(
            username,
            &request,
            &DecisionResponse::allow(),
            &[],
            &[],
            &AuditOptions::default(),
        )
    }

    #[test]
    fn test_flush_on_threshold() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = AuditPipeline::new(options(10, 2, 1000), sink.clone());
        pipeline.start(1).unwrap();

        pipeline.send_record(record("alice"));
        pipeline.send_record(record("bob"));
        thread::sleep(Duration::from_millis(100));

        assert_eq!(*sink.batches.lock(), vec![2]);
        pipeline.stop();
    }

    #[test]
    fn test_stop_drains_partial_buffer() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = AuditPipeline::new(options(10, 5, 1000), sink.clone());
        pipeline.start(2).unwrap();

        for _ in 0..3 {
            pipeline.send_record(record("alice"));
        }
        pipeline.stop();

        assert_eq!(sink.batches.lock().iter().sum::<usize>(), 3);
        assert_eq!(pipeline.stats().flushed, 3);
    }

    #[test]
    fn test_records_after_stop_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = AuditPipeline::new(options(10, 5, 100), sink.clone());
        pipeline.start(1).unwrap();
        pipeline.stop();

        pipeline.send_record(record("alice"));
        let stats = pipeline.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.accepted, 0);
        assert!(sink.batches.lock().is_empty());
    }

    #[test]
    fn test_filters_applied() {
        let sink = Arc::new(RecordingSink::default());
        let mut opts = options(10, 1, 100);
        opts.filters = AuditFilters {
            usernames: Vec::new(),
            skipped_usernames: vec!["healthcheck".to_string()],
        };
        let pipeline = AuditPipeline::new(opts, sink.clone());
        pipeline.start(1).unwrap();

        pipeline.send_record(record("healthcheck"));
        pipeline.send_record(record("alice"));
        pipeline.stop();

        let stats = pipeline.stats();
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.flushed, 1);
    }

    #[test]
    fn test_sink_failure_counted() {
        let sink = Arc::new(RecordingSink::default());
        sink.failing.store(true, Ordering::SeqCst);
        let pipeline = AuditPipeline::new(options(10, 1, 100), sink);
        pipeline.start(1).unwrap();

        pipeline.send_record(record("alice"));
        pipeline.stop();

        let stats = pipeline.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.flushed, 0);
    }

    #[test]
    fn test_start_twice_rejected() {
        let pipeline =
            AuditPipeline::new(options(10, 1, 100), Arc::new(RecordingSink::default()));
        pipeline.start(1).unwrap();
        assert!(matches!(pipeline.start(1), Err(AuthzError::Pipeline(_))));
        assert!(matches!(pipeline.start(0), Err(AuthzError::Config(_))));
        pipeline.stop();
        pipeline.stop();
        assert!(pipeline.start(1).is_err());
    }
    #[test]
    fn test_records_queued_before_start_are_flushed() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = AuditPipeline::new(options(10, 5, 1000), sink.clone());

        pipeline.send_record(record("alice"));
        pipeline.send_record(record("bob"));
        assert_eq!(pipeline.queued(), 2);

        pipeline.start(1).unwrap();
        pipeline.stop();
        assert_eq!(pipeline.stats().flushed, 2);
    }

    #[test]
    fn test_stop_before_start_with_full_queue_returns() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Arc::new(AuditPipeline::new(options(2, 1, 1000), sink.clone()));

        let sender = {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                for name in ["alice", "bob", "carol"] {
                    pipeline.send_record(record(name));
                }
            })
        };
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pipeline.queued(), 2);

        pipeline.stop();
        sender.join().unwrap();

        let stats = pipeline.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.flushed, 2);
        assert_eq!(sink.batches.lock().iter().sum::<usize>(), 2);
    }
}
