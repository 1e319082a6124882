//! Coalescing background worker.
//!
//! One named thread drains a crossbeam channel of work items and runs the
//! handler for each item to completion before taking the next. Enqueue is
//! idempotent per [`WorkItem::key`]: an item whose key is already pending is
//! dropped, so a burst of identical requests collapses into one pass.
//!
//! The key is released just before the handler runs, so a handler may
//! enqueue its own kind again (the VF table rebuild re-enqueues the arbiter
//! run, and a rebuild requested while one is running is not lost).
//!
//! ```text
//! enqueue(item) --+-- key pending? --yes--> dropped
//!                 |
//!                 +-- no --> pending += key --> channel --> [worker thread]
//!                                                            |  pending -= key
//!                                                            |  handler(item)
//! ```

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{GpuControlError, Result};

/// Something a [`Worker`] can run.
pub trait WorkItem: Send + 'static {
    /// Identity used to coalesce duplicate enqueues.
    type Key: Eq + Hash + Clone + Send + 'static;

    fn key(&self) -> Self::Key;
}

enum Message<T> {
    Work(T),
    Flush(Sender<()>),
}

/// Single-threaded coalescing work queue.
pub struct Worker<T: WorkItem> {
    name: String,
    tx: Mutex<Option<Sender<Message<T>>>>,
    pending: Arc<Mutex<HashSet<T::Key>>>,
    processed: Arc<AtomicU64>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl<T: WorkItem> Worker<T> {
    /// Spawn the worker thread.
    pub fn spawn<F>(name: &str, mut handler: F) -> Result<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let (tx, rx): (Sender<Message<T>>, Receiver<Message<T>>) = crossbeam_channel::unbounded();
        let pending: Arc<Mutex<HashSet<T::Key>>> = Arc::new(Mutex::new(HashSet::new()));
        let processed = Arc::new(AtomicU64::new(0));

        let thread_pending = Arc::clone(&pending);
        let thread_processed = Arc::clone(&processed);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                log::debug!("{}: worker started", thread_name);
                for msg in rx.iter() {
                    match msg {
                        Message::Work(item) => {
                            thread_pending.lock().remove(&item.key());
                            handler(item);
                            thread_processed.fetch_add(1, Ordering::Release);
                        }
                        Message::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
                log::debug!("{}: worker exiting", thread_name);
            })
            .map_err(|e| GpuControlError::Backend(format!("failed to spawn {}: {}", name, e)))?;

        let thread_id = handle.thread().id();
        Ok(Self {
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            pending,
            processed,
            thread: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `item` unless an item with the same key is already pending.
    ///
    /// Returns `true` when the item was queued.
    pub fn enqueue(&self, item: T) -> bool {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            log::debug!("{}: enqueue after stop ignored", self.name);
            return false;
        };
        let key = item.key();
        if !self.pending.lock().insert(key.clone()) {
            return false;
        }
        if tx.send(Message::Work(item)).is_err() {
            self.pending.lock().remove(&key);
            return false;
        }
        true
    }

    /// Whether an item with `key` is queued and not yet started.
    pub fn is_pending(&self, key: &T::Key) -> bool {
        self.pending.lock().contains(key)
    }

    /// Number of items whose handler has completed.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Block until every item queued before this call has been handled,
    /// including items those handlers queued in the meantime.
    pub fn flush(&self) -> Result<()> {
        if thread::current().id() == self.thread_id {
            return Err(GpuControlError::InvalidArgument(format!(
                "{}: flush from the worker thread would deadlock",
                self.name
            )));
        }
        loop {
            self.flush_once()?;
            if self.pending.lock().is_empty() {
                return Ok(());
            }
        }
    }

    fn flush_once(&self) -> Result<()> {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        {
            let tx = self.tx.lock();
            let tx = tx
                .as_ref()
                .ok_or_else(|| GpuControlError::NoDevice(format!("{} stopped", self.name)))?;
            tx.send(Message::Flush(ack_tx))
                .map_err(|_| GpuControlError::NoDevice(format!("{} stopped", self.name)))?;
        }
        ack_rx
            .recv()
            .map_err(|_| GpuControlError::Backend(format!("{} thread died", self.name)))
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Close the queue and join the thread. Items already queued are still
    /// handled. Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.tx.lock().take();
        let handle = self.thread.lock().take();
        match handle {
            // The last owner may drop us from inside a handler; the thread
            // exits on its own once the queue drains.
            Some(h) if h.thread().id() == thread::current().id() => Ok(()),
            Some(h) => h
                .join()
                .map_err(|_| GpuControlError::Backend(format!("{} thread panicked", self.name))),
            None => Ok(()),
        }
    }
}

impl<T: WorkItem> Drop for Worker<T> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("{}", e);
        }
    }
}

impl<T: WorkItem> std::fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("pending", &self.pending.lock().len())
            .field("processed", &self.processed())
            .finish()
    }
}
