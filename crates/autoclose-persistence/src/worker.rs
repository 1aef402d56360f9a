//! Single-writer SQLite worker.
//!
//! Each store owns exactly one `rusqlite::Connection`, parked on a dedicated
//! OS thread. Every read and write is shipped to that thread as a boxed job
//! and answered over a oneshot channel, so all statements against one
//! database file are serialised without any connection-level locking.
//!
//! # Actor vs Handle
//!
//! - `SqliteWorkerTask` owns the connection and drains the job queue.
//! - `SqliteHandle` is the cheap, cloneable front door used from async code.
//!
//! The worker stops when `shutdown()` is called or when every handle has been
//! dropped, closing the connection on its own thread.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{PersistenceError, PersistenceResult};

/// Default job queue depth per store.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

// ============================================================================
// WorkerMsg
// ============================================================================

enum WorkerMsg {
    /// Run a job against the connection.
    Job(Job),
    /// Stop the worker after the jobs queued ahead of this message.
    Shutdown,
}

// ============================================================================
// SqliteWorkerTask
// ============================================================================

/// Worker owning the connection. Runs on its own thread.
struct SqliteWorkerTask {
    name: Arc<str>,
    rx: mpsc::Receiver<WorkerMsg>,
    conn: Connection,
}

impl SqliteWorkerTask {
    fn run(mut self) {
        debug!(store = %self.name, "SQLite worker started");

        while let Some(msg) = self.rx.blocking_recv() {
            match msg {
                WorkerMsg::Job(job) => job(&mut self.conn),
                WorkerMsg::Shutdown => {
                    debug!(store = %self.name, "SQLite worker shutting down");
                    break;
                }
            }
        }

        if let Err((_, e)) = self.conn.close() {
            warn!(store = %self.name, error = %e, "Failed to close SQLite connection");
        }
        debug!(store = %self.name, "SQLite worker terminated");
    }
}

// ============================================================================
// SqliteHandle
// ============================================================================

/// Handle to a running SQLite worker.
#[derive(Clone)]
pub struct SqliteHandle {
    name: Arc<str>,
    tx: mpsc::Sender<WorkerMsg>,
}

impl SqliteHandle {
    /// Run `f` on the worker thread and await its result.
    ///
    /// Jobs run strictly in submission order.
    pub async fn call<F, T>(&self, f: F) -> PersistenceResult<T>
    where
        F: FnOnce(&mut Connection) -> PersistenceResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let _ = reply_tx.send(f(conn));
        });

        self.tx
            .send(WorkerMsg::Job(job))
            .await
            .map_err(|_| self.closed())?;

        // A dropped reply means the worker died mid-job.
        reply_rx.await.map_err(|_| self.closed())?
    }

    /// Request graceful shutdown. Jobs queued before this call still run.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WorkerMsg::Shutdown).await;
    }

    /// Whether the worker is still accepting jobs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn closed(&self) -> PersistenceError {
        PersistenceError::WorkerClosed(self.name.to_string())
    }
}

// ============================================================================
// Spawn
// ============================================================================

/// Open a file-backed connection with the pragmas the stores expect.
pub fn open_file(path: &Path) -> PersistenceResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

/// Move `conn` onto a new named worker thread.
///
/// Returns the handle and the thread's join handle.
pub fn spawn_sqlite_worker(
    name: &str,
    conn: Connection,
    capacity: usize,
) -> PersistenceResult<(SqliteHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let name: Arc<str> = Arc::from(name);

    let task = SqliteWorkerTask {
        name: name.clone(),
        rx,
        conn,
    };

    let join = thread::Builder::new()
        .name(format!("sqlite-{name}"))
        .spawn(move || task.run())?;

    Ok((SqliteHandle { name, tx }, join))
}

// ============================================================================
// Tests
// ============================================================================
