//! Live build-log fan-out.
//!
//! One stream per running build. Each stream keeps the full text seen so far
//! (for late subscribers) and a list of subscriber channels. Delivery is
//! best-effort: a subscriber whose channel is full misses that chunk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

#[derive(Default)]
pub struct LogStreamService {
    streams: Mutex<HashMap<String, Arc<LogStream>>>,
}

struct LogStream {
    inner: Mutex<StreamInner>,
}

#[derive(Default)]
struct StreamInner {
    buffer: String,
    subscribers: Vec<(u64, mpsc::Sender<String>)>,
    next_subscriber: u64,
    closed: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LogStream {
    fn new() -> Self {
        Self {
            inner: Mutex::new(StreamInner::default()),
        }
    }

    fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        // Dropping the senders ends every subscriber's stream.
        inner.subscribers.clear();
    }

    fn remove(&self, id: u64) {
        lock(&self.inner).subscribers.retain(|(sid, _)| *sid != id);
    }
}

/// Handle returned by [`LogStreamService::subscribe_build_log`]. Calling
/// [`Unsubscribe::unsubscribe`] more than once, or after the stream closed,
/// does nothing.
pub struct Unsubscribe {
    stream: Arc<LogStream>,
    id: u64,
    done: AtomicBool,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.stream.remove(self.id);
        }
    }
}

impl LogStreamService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh stream for `build_id`, closing any stale one first.
    pub fn start_build_log(&self, build_id: &str) {
        let stale = lock(&self.streams).insert(build_id.to_string(), Arc::new(LogStream::new()));
        if let Some(stale) = stale {
            tracing::debug!(build_id = %build_id, "Replacing stale log stream");
            stale.close();
        }
    }

    /// Buffer `chunk` and offer it to every subscriber without blocking.
    pub fn append_build_log(&self, build_id: &str, chunk: &str) {
        let Some(stream) = self.stream(build_id) else {
            tracing::trace!(build_id = %build_id, "Log chunk for unknown stream dropped");
            return;
        };
        let mut inner = lock(&stream.inner);
        if inner.closed {
            return;
        }
        inner.buffer.push_str(chunk);
        for (_, tx) in &inner.subscribers {
            let _ = tx.try_send(chunk.to_string());
        }
    }

    /// Attach `tx` to a live stream. Returns `None` when no stream is active.
    ///
    /// Everything buffered so far is offered first as one chunk; if `tx` has
    /// no room for it the replay is skipped and only new chunks arrive.
    pub fn subscribe_build_log(
        &self,
        build_id: &str,
        tx: mpsc::Sender<String>,
    ) -> Option<Unsubscribe> {
        let stream = self.stream(build_id)?;
        let id = {
            let mut inner = lock(&stream.inner);
            if inner.closed {
                return None;
            }
            if !inner.buffer.is_empty() {
                let _ = tx.try_send(inner.buffer.clone());
            }
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.push((id, tx));
            id
        };
        Some(Unsubscribe {
            stream,
            id,
            done: AtomicBool::new(false),
        })
    }

    /// End the stream and every subscription. Unknown ids are ignored.
    pub fn close_build_log(&self, build_id: &str) {
        let stream = lock(&self.streams).remove(build_id);
        if let Some(stream) = stream {
            stream.close();
        }
    }

    pub fn is_active(&self, build_id: &str) -> bool {
        lock(&self.streams).contains_key(build_id)
    }

    fn stream(&self, build_id: &str) -> Option<Arc<LogStream>> {
        lock(&self.streams).get(build_id).cloned()
    }
}
