use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kiln_common::CoordinatorMessage;
use tokio::sync::mpsc;

/// One live worker connection, as seen by broadcasters.
#[derive(Debug)]
pub struct WorkerConnection {
    pub id: u64,
    pub worker_id: String,
    tx: mpsc::Sender<CoordinatorMessage>,
}

/// Live worker connections.
///
/// Broadcasts iterate an immutable snapshot; register/unregister swap in a
/// new list so a broadcast never holds the lock while sending.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<Arc<Vec<Arc<WorkerConnection>>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<Vec<Arc<WorkerConnection>>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn register(
        &self,
        worker_id: &str,
        tx: mpsc::Sender<CoordinatorMessage>,
    ) -> Arc<WorkerConnection> {
        let conn = Arc::new(WorkerConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            worker_id: worker_id.to_string(),
            tx,
        });
        let mut guard = self
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.push(conn.clone());
        *guard = Arc::new(next);
        conn
    }

    pub fn unregister(&self, id: u64) {
        let mut guard = self
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next: Vec<_> = guard.iter().filter(|c| c.id != id).cloned().collect();
        *guard = Arc::new(next);
    }

    /// Offer `msg` to every connection without waiting. Returns how many
    /// queues accepted it.
    pub fn broadcast(&self, msg: &CoordinatorMessage) -> usize {
        let mut delivered = 0;
        for conn in self.snapshot().iter() {
            match conn.tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::warn!(worker_id = %conn.worker_id, "Worker queue full or closed, message dropped");
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
