use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::RunnerError;
use crate::rbuffer::RingBuffer;

/// Size of the chunks the splitter reads out of each ring.
pub const DEFAULT_CHUNK_SIZE: usize = 32 << 10;

/// One chunk read from the child, tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

impl Output {
    pub fn data(&self) -> &[u8] {
        match self {
            Output::Stdout(data) | Output::Stderr(data) => data,
        }
    }
}

/// Producer side of a rendezvous queue: [`Handoff::push`] completes only
/// after the consumer has taken the item, so a producer can never run more
/// than one item ahead of the consumer.
pub struct Handoff<T> {
    tx: mpsc::Sender<(T, oneshot::Sender<()>)>,
}

impl<T> Clone for Handoff<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct HandoffReceiver<T> {
    rx: mpsc::Receiver<(T, oneshot::Sender<()>)>,
}

pub fn handoff<T>() -> (Handoff<T>, HandoffReceiver<T>) {
    // The single slot only parks the item that the sender is blocked on.
    let (tx, rx) = mpsc::channel(1);
    (Handoff { tx }, HandoffReceiver { rx })
}

impl<T> Handoff<T> {
    pub async fn push(&self, item: T) -> Result<(), RunnerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send((item, ack_tx))
            .await
            .map_err(|_| RunnerError::HandoffClosed)?;
        ack_rx.await.map_err(|_| RunnerError::HandoffClosed)
    }
}

impl<T> HandoffReceiver<T> {
    /// Take the next item. Returns `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<T> {
        let (item, ack) = self.rx.recv().await?;
        let _ = ack.send(());
        Some(item)
    }
}

/// Drain `stdout` and `stderr` concurrently into `results`.
///
/// Each ring gets its own task. Every non-empty read becomes one event.
/// Returns once both rings report end-of-data; `results` is dropped only
/// after both tasks finished, which is what tells the consumer to stop.
pub async fn read_loop(
    stdout: Arc<RingBuffer>,
    stderr: Arc<RingBuffer>,
    results: Handoff<Output>,
    chunk_size: usize,
) -> Result<(), RunnerError> {
    let chunk_size = chunk_size.max(1);
    let out_task = tokio::spawn(drain(stdout, results.clone(), chunk_size, Output::Stdout));
    let err_task = tokio::spawn(drain(stderr, results, chunk_size, Output::Stderr));

    let (out_res, err_res) = tokio::join!(out_task, err_task);
    out_res.map_err(join_error)??;
    err_res.map_err(join_error)??;
    Ok(())
}

async fn drain(
    ring: Arc<RingBuffer>,
    results: Handoff<Output>,
    chunk_size: usize,
    wrap: fn(Vec<u8>) -> Output,
) -> Result<(), RunnerError> {
    loop {
        let mut buf = vec![0u8; chunk_size];
        let n = ring.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        buf.truncate(n);
        if let Err(err) = results.push(wrap(buf)).await {
            debug!("output consumer gone, dropping remaining data");
            return Err(err);
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> RunnerError {
    RunnerError::Io(std::io::Error::other(err))
}
