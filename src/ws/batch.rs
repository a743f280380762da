//! Inbound buffering and the processors that turn batches into events.

#![expect(
    clippy::module_name_repetitions,
    reason = "Processor types are named after the batch they consume"
)]

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::config::{BatchConfig, ProcessorMode};
use super::events::EventRegistry;
use super::message::{Event, InboundMessage};

/// FIFO of parsed messages waiting to be dispatched.
///
/// Flushed once it holds `batch_size` entries or `flush_interval` after the first unflushed
/// entry was appended, whichever happens first.
#[derive(Debug)]
pub struct InboundBuffer {
    entries: Vec<InboundMessage>,
    first_at: Option<Instant>,
    batch_size: usize,
    flush_interval: Duration,
}

impl InboundBuffer {
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        let batch_size = config.batch_size.max(1);
        Self {
            entries: Vec::with_capacity(batch_size),
            first_at: None,
            batch_size,
            flush_interval: config.flush_interval,
        }
    }

    /// Append a message. Returns `true` when the buffer is full and must be flushed.
    pub fn push(&mut self, message: InboundMessage, now: Instant) -> bool {
        if self.entries.is_empty() {
            self.first_at = Some(now);
        }
        self.entries.push(message);
        self.entries.len() >= self.batch_size
    }

    /// When the pending entries must be flushed at the latest.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.first_at.map(|first| first + self.flush_interval)
    }

    pub fn take(&mut self) -> Vec<InboundMessage> {
        self.first_at = None;
        std::mem::replace(&mut self.entries, Vec::with_capacity(self.batch_size))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Work handed from the connection to its batch processor.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// Messages in the order they were received
    Batch(Vec<InboundMessage>),
    /// A lifecycle event produced by the manager itself
    Event(Event),
}

/// Turns dispatches into events delivered to the registry.
///
/// Every event of a connection goes through the same processor, so implementations only have to
/// preserve submission order for the delivered order to match the received order.
pub trait BatchProcessor: Send + Sync + 'static {
    fn submit(&self, dispatch: Dispatch);
}

fn deliver(registry: &EventRegistry, dispatch: Dispatch) {
    match dispatch {
        Dispatch::Batch(messages) => {
            #[cfg(feature = "tracing")]
            tracing::trace!(count = messages.len(), "dispatching inbound batch");
            for message in messages {
                registry.emit(&Event::from_inbound(message));
            }
        }
        Dispatch::Event(event) => {
            registry.emit(&event);
        }
    }
}

/// Dispatches synchronously on the submitting task.
#[derive(Debug)]
pub struct InlineProcessor {
    registry: Arc<EventRegistry>,
}

impl InlineProcessor {
    #[must_use]
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self { registry }
    }
}

impl BatchProcessor for InlineProcessor {
    fn submit(&self, dispatch: Dispatch) {
        deliver(&self.registry, dispatch);
    }
}

/// Dispatches on a dedicated task fed through an unbounded queue.
///
/// The worker stops once the processor is dropped and the queue has drained.
#[derive(Debug)]
pub struct WorkerProcessor {
    queue: mpsc::UnboundedSender<Dispatch>,
    registry: Arc<EventRegistry>,
}

impl WorkerProcessor {
    /// Spawn the worker on the current tokio runtime.
    #[must_use]
    pub fn spawn(registry: Arc<EventRegistry>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<Dispatch>();
        let worker_registry = Arc::clone(&registry);

        tokio::spawn(async move {
            while let Some(dispatch) = rx.recv().await {
                deliver(&worker_registry, dispatch);
            }
        });

        Self { queue, registry }
    }
}

impl BatchProcessor for WorkerProcessor {
    fn submit(&self, dispatch: Dispatch) {
        if let Err(unsent) = self.queue.send(dispatch) {
            // Worker is gone (runtime shutting down); keep events flowing inline
            deliver(&self.registry, unsent.0);
        }
    }
}

/// Build the processor requested by `mode`.
///
/// [`ProcessorMode::Auto`] uses a worker when running inside a multi-threaded runtime, where a
/// separate task can make progress in parallel with the connection.
#[must_use]
pub fn processor_for(mode: ProcessorMode, registry: Arc<EventRegistry>) -> Arc<dyn BatchProcessor> {
    let worker = match mode {
        ProcessorMode::Worker => Handle::try_current().is_ok(),
        ProcessorMode::Inline => false,
        ProcessorMode::Auto => Handle::try_current()
            .is_ok_and(|handle| matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread)),
    };

    if worker {
        Arc::new(WorkerProcessor::spawn(registry))
    } else {
        Arc::new(InlineProcessor::new(registry))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::ws::message::{ConnectionEvent, EventKind};

    fn message(kind: &str, n: i64) -> InboundMessage {
        InboundMessage::new(kind, Some(json!({ "n": n })))
    }

    #[test]
    fn buffer_reports_full_at_batch_size() {
        let mut buffer = InboundBuffer::new(BatchConfig::new(3, Duration::from_millis(100)));
        let now = Instant::now();

        assert!(!buffer.push(message("tick_data", 1), now));
        assert!(!buffer.push(message("tick_data", 2), now));
        assert!(buffer.push(message("tick_data", 3), now));

        let batch = buffer.take();
        assert_eq!(batch.len(), 3);
        assert!(buffer.is_empty(), "take must drain the buffer");
        assert_eq!(buffer.deadline(), None);
    }

    #[test]
    fn deadline_counts_from_first_unflushed_entry() {
        let mut buffer = InboundBuffer::new(BatchConfig::new(10, Duration::from_millis(100)));
        let first = Instant::now();

        buffer.push(message("tick_data", 1), first);
        buffer.push(message("tick_data", 2), first + Duration::from_millis(40));

        assert_eq!(buffer.deadline(), Some(first + Duration::from_millis(100)));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn zero_batch_size_flushes_every_message() {
        let mut buffer = InboundBuffer::new(BatchConfig::new(0, Duration::from_millis(100)));
        assert!(buffer.push(message("tick_data", 1), Instant::now()));
    }

    fn recording_registry() -> (Arc<EventRegistry>, Arc<Mutex<Vec<Event>>>) {
        let registry = Arc::new(EventRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let seen = Arc::clone(&seen);
            registry.on(kind, move |event| seen.lock().unwrap().push(event.clone()));
        }
        (registry, seen)
    }

    fn burst() -> Vec<Dispatch> {
        vec![
            Dispatch::Event(Event::Connection(ConnectionEvent::connected())),
            Dispatch::Batch((0..25).map(|n| message("tick_data", n)).collect()),
            Dispatch::Batch(vec![
                message("portfolio_update", 25),
                message("unknown", 26),
                message("tick_data", 27),
            ]),
            Dispatch::Event(Event::Connection(ConnectionEvent::disconnected(1006, "gone"))),
        ]
    }

    #[tokio::test]
    async fn worker_and_inline_deliver_identical_sequences() {
        let (inline_registry, inline_seen) = recording_registry();
        let inline = InlineProcessor::new(inline_registry);
        for dispatch in burst() {
            inline.submit(dispatch);
        }

        let (worker_registry, worker_seen) = recording_registry();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let done_tx = Mutex::new(Some(done_tx));
        worker_registry.on(EventKind::Connection, move |event| {
            if matches!(event, Event::Connection(c) if c.code == Some(1006))
                && let Some(tx) = done_tx.lock().unwrap().take()
            {
                _ = tx.send(());
            }
        });
        let worker = WorkerProcessor::spawn(worker_registry);
        for dispatch in burst() {
            worker.submit(dispatch);
        }
        done_rx.await.unwrap();

        let inline_seen = inline_seen.lock().unwrap().clone();
        let worker_seen = worker_seen.lock().unwrap().clone();
        assert_eq!(inline_seen.len(), 30);
        assert_eq!(inline_seen, worker_seen);
    }

    #[tokio::test]
    async fn auto_mode_is_inline_on_current_thread_runtime() {
        let registry = Arc::new(EventRegistry::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        registry.on(EventKind::TickData, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let processor = processor_for(ProcessorMode::Auto, registry);
        processor.submit(Dispatch::Batch(vec![message("tick_data", 1)]));

        // Inline delivery is visible without yielding to the runtime
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
