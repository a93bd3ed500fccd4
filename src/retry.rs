// Per-backend retry buffering
//
// Failed writes are queued, coalesced into batches keyed by their query
// string, and replayed serially by a single drainer task. Capacity is
// bounded in bytes; a full buffer rejects new writes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::debug;

use crate::http::{Poster, ResponseData};
use crate::pool;

const RETRY_INITIAL: Duration = Duration::from_millis(500);
const RETRY_MULTIPLIER: u32 = 2;

/// An `add` would push the queue past its configured capacity.
#[derive(Debug, Error)]
#[error("retry buffer full")]
pub struct BufferFull;

/// Buffers and replays writes for one backend. Writes are attempted
/// directly until one fails; from then on they are queued until the drainer
/// catches up. Only one batch is in flight at a time, so the backend sees
/// writes in the order `add` accepted them.
pub struct RetryBuffer {
    buffering: AtomicBool,
    max_interval: Duration,
    list: BufferList,
    poster: Arc<dyn Poster>,
}

impl RetryBuffer {
    /// Create the buffer and spawn its drainer task.
    pub fn start(
        max_buffered: usize,
        max_batch: usize,
        max_interval: Duration,
        poster: Arc<dyn Poster>,
    ) -> Arc<Self> {
        let buffer = Arc::new(Self {
            buffering: AtomicBool::new(false),
            max_interval,
            list: BufferList::new(max_buffered, max_batch),
            poster,
        });
        tokio::spawn(Arc::clone(&buffer).drain());
        buffer
    }

    /// Stop accepting new writes. Queued batches still drain. Idempotent.
    pub fn stop(&self) {
        self.list.close();
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::Acquire)
    }

    async fn drain(self: Arc<Self>) {
        while let Some(batch) = self.list.pop().await {
            let mut buf = pool::get();
            for body in &batch.bodies {
                buf.extend_from_slice(body);
            }
            let body = buf.freeze();

            let mut interval = RETRY_INITIAL;
            loop {
                match self.poster.post(body.clone(), &batch.query, None).await {
                    Ok(resp) if !resp.status.is_server_error() => {
                        counter!("relay.retry.drains").increment(1);
                        // Clearing under the queue lock keeps the flag set
                        // while anything is still queued.
                        self.list.with_queue(|queue| {
                            if queue.is_empty() {
                                self.buffering.store(false, Ordering::Release);
                            }
                        });
                        let _ = batch.done.send(Some(resp));
                        break;
                    }
                    Ok(resp) => {
                        debug!(status = %resp.status, "drain attempt rejected");
                    }
                    Err(err) => {
                        debug!(error = %err, "drain attempt failed");
                    }
                }

                tokio::time::sleep(interval).await;
                interval = (interval * RETRY_MULTIPLIER).min(self.max_interval);
            }
        }
    }
}

#[async_trait]
impl Poster for RetryBuffer {
    async fn post(
        &self,
        body: Bytes,
        query: &str,
        auth: Option<&str>,
    ) -> anyhow::Result<ResponseData> {
        if !self.buffering.load(Ordering::Acquire) {
            match self.poster.post(body.clone(), query, auth).await {
                Ok(resp) if !resp.status.is_server_error() => return Ok(resp),
                Ok(resp) => {
                    debug!(status = %resp.status, "write rejected, buffering");
                }
                Err(err) => {
                    debug!(error = %err, "write failed, buffering");
                }
            }
            self.buffering.store(true, Ordering::Release);
        }

        // Already buffering or the direct attempt just failed.
        let len = body.len();
        let mut done = self.list.add(body, query)?;
        counter!("relay.retry.enqueued_bytes").increment(len as u64);

        loop {
            if done.changed().await.is_err() {
                bail!("retry buffer stopped");
            }
            if let Some(resp) = done.borrow_and_update().clone() {
                return Ok(resp);
            }
        }
    }
}

/// One queued batch: bodies sharing a query string, plus the channel its
/// submitters wait on.
struct Batch {
    query: String,
    bodies: Vec<Bytes>,
    size: usize,
    done: watch::Sender<Option<ResponseData>>,
}

struct ListState {
    queue: VecDeque<Batch>,
    size: usize,
    closed: bool,
}

/// The queue proper: arrival-ordered batches behind one mutex, with a
/// notification for the drainer.
struct BufferList {
    state: Mutex<ListState>,
    available: Notify,
    max_size: usize,
    max_batch: usize,
}

impl BufferList {
    fn new(max_size: usize, max_batch: usize) -> Self {
        Self {
            state: Mutex::new(ListState {
                queue: VecDeque::new(),
                size: 0,
                closed: false,
            }),
            available: Notify::new(),
            max_size,
            max_batch,
        }
    }

    /// Append `body` to the first batch with the same query string that has
    /// room, or push a new tail batch. Fails without mutating the queue if
    /// the body would exceed total capacity.
    fn add(
        &self,
        body: Bytes,
        query: &str,
    ) -> Result<watch::Receiver<Option<ResponseData>>, BufferFull> {
        let len = body.len();
        let mut state = self.state.lock();

        if state.closed || state.size + len > self.max_size {
            return Err(BufferFull);
        }
        state.size += len;

        let max_batch = self.max_batch;
        let receiver = match state
            .queue
            .iter_mut()
            .find(|b| b.query == query && b.size + len <= max_batch)
        {
            Some(batch) => {
                batch.size += len;
                batch.bodies.push(body);
                batch.done.subscribe()
            }
            None => {
                let (done, receiver) = watch::channel(None);
                state.queue.push_back(Batch {
                    query: query.to_string(),
                    bodies: vec![body],
                    size: len,
                    done,
                });
                receiver
            }
        };

        drop(state);
        self.available.notify_one();
        Ok(receiver)
    }

    /// Remove and return the oldest batch, waiting while the queue is
    /// empty. Returns `None` once the list is closed and drained.
    async fn pop(&self) -> Option<Batch> {
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock();
                if let Some(batch) = state.queue.pop_front() {
                    state.size -= batch.size;
                    return Some(batch);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_one();
    }

    fn with_queue<R>(&self, f: impl FnOnce(&VecDeque<Batch>) -> R) -> R {
        f(&self.state.lock().queue)
    }

    #[cfg(test)]
    fn snapshot(&self) -> (usize, Vec<(String, usize, usize)>) {
        let state = self.state.lock();
        let batches = state
            .queue
            .iter()
            .map(|b| (b.query.clone(), b.size, b.bodies.len()))
            .collect();
        (state.size, batches)
    }
}
