use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::error::RunnerError;

/// Fixed-capacity circular byte buffer sitting between a child process and
/// the consumer of its output.
///
/// One writer and one reader may use it concurrently. Writers wait while the
/// ring is full, readers wait while it is empty. [`RingBuffer::close`] may be
/// called from anywhere, any number of times: afterwards writes fail with
/// [`RunnerError::BufferClosed`] and reads drain what is left before
/// reporting end-of-data as `Ok(0)`.
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Inner>,
    readable: Notify,
    writable: Notify,
}

#[derive(Debug)]
struct Inner {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    len: usize,
    closed: bool,
}

impl Inner {
    fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        let cap = self.buf.len();
        let first = n.min(cap - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);
        self.write_pos = (self.write_pos + n) % cap;
        self.len += n;
        n
    }

    fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        let cap = self.buf.len();
        let first = n.min(cap - self.read_pos);
        out[..first].copy_from_slice(&self.buf[self.read_pos..self.read_pos + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        self.read_pos = (self.read_pos + n) % cap;
        self.len -= n;
        n
    }
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0; capacity.max(1)].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
                len: 0,
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().buf.len()
    }

    /// Number of buffered bytes not yet read.
    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Write as much of `data` as fits, waiting until at least one byte of
    /// space is available.
    pub async fn write(&self, data: &[u8]) -> Result<usize, RunnerError> {
        if data.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(RunnerError::BufferClosed);
                }
                if inner.free() > 0 {
                    let n = inner.push(data);
                    drop(inner);
                    self.readable.notify_waiters();
                    return Ok(n);
                }
            }
            notified.await;
        }
    }

    pub async fn write_all(&self, mut data: &[u8]) -> Result<(), RunnerError> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Read up to `out.len()` bytes, waiting until data is available.
    /// Returns `Ok(0)` once the ring is closed and drained.
    pub async fn read(&self, out: &mut [u8]) -> Result<usize, RunnerError> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.len > 0 {
                    let n = inner.pop(out);
                    drop(inner);
                    self.writable.notify_waiters();
                    return Ok(n);
                }
                if inner.closed {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}
