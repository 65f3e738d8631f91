//! Asynchronous event bus backed by a dedicated Tokio runtime.
//!
//! `publish` enqueues and returns immediately. A single dispatch task drains
//! the queue in FIFO order, so every handler still observes events in publish
//! order, but on the dispatch thread rather than the publisher's.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, oneshot};

use super::channel::{EventChannel, EventHandler, HandlerTable, SubscriptionToken};
use super::types::{CapabilityEvent, EventEnvelope, EventKind};

enum Message {
    Event(EventEnvelope),
    Flush(oneshot::Sender<()>),
}

pub struct AsyncEventBus {
    table: Arc<HandlerTable>,
    sender: mpsc::UnboundedSender<Message>,
    /// Sequence numbers are queued in the order they are assigned.
    enqueue: Mutex<()>,
    runtime: Mutex<Option<Runtime>>,
    shutting_down: AtomicBool,
}

impl AsyncEventBus {
    /// Start the dispatch runtime.
    pub fn new(worker_threads: usize, thread_name: &str) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(thread_name)
            .enable_all()
            .build()?;

        let table = Arc::new(HandlerTable::default());
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();

        let dispatch_table = table.clone();
        runtime.spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    Message::Event(envelope) => dispatch_table.dispatch(&envelope),
                    Message::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Ok(Self {
            table,
            sender,
            enqueue: Mutex::new(()),
            runtime: Mutex::new(Some(runtime)),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Block until every event published before this call has been delivered.
    ///
    /// Returns `false` if the bus is shut down. Must not be called from a
    /// handler or from inside an async context.
    pub fn flush(&self) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let (done, wait) = oneshot::channel();
        if self.sender.send(Message::Flush(done)).is_err() {
            return false;
        }
        wait.blocking_recv().is_ok()
    }

    /// Stop dispatching. Pending events are flushed first when `wait` is set.
    pub fn shutdown(&self, wait: bool) {
        if wait {
            self.flush();
        }
        self.shutting_down.store(true, Ordering::SeqCst);
        self.table.clear();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.table.handler_count(kind)
    }
}

impl EventChannel for AsyncEventBus {
    fn subscribe(&self, kind: EventKind, name: &str, handler: EventHandler) -> SubscriptionToken {
        self.table.subscribe(kind, name, handler)
    }

    fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        self.table.unsubscribe(token)
    }

    fn flush(&self) -> bool {
        AsyncEventBus::flush(self)
    }

    fn publish(&self, event: CapabilityEvent) {
        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::warn!(event_kind = ?event.kind(), "publish during shutdown ignored");
            return;
        }
        let _enqueue = self.enqueue.lock();
        let envelope = self.table.stamp(event);
        if self.sender.send(Message::Event(envelope)).is_err() {
            tracing::warn!("event dispatch task has stopped; event dropped");
        }
    }
}

impl Drop for AsyncEventBus {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for AsyncEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEventBus")
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
