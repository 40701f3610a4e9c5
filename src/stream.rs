//! Bidirectional byte streams over simulated connections.
//!
//! Each direction of a stream has a writer queue, a delivery sequencer task
//! and a read buffer. A write is stamped with its arrival time
//! (`now + latency + rate-limit delay`) and queued; the sequencer releases
//! writes strictly in order, so a small write never overtakes a larger one
//! queued before it.
//!
//! `close` is a half-close: it flushes the writer queue, marks EOF for the
//! reader and waits for the flush. When both directions have been closed the
//! stream is torn down. `reset` aborts both directions immediately.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::trace;

use crate::context::OpContext;
use crate::error::NetError;
use crate::identity::PeerId;
use crate::mocknet::{Connection, StreamId};

enum Outgoing {
    Data { bytes: Vec<u8>, arrival: Instant },
    Close { flushed: oneshot::Sender<()> },
}

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    eof: bool,
    reset: bool,
}

/// Bytes readable by one side of the stream.
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Notify,
}

impl Pipe {
    fn push(&self, bytes: &[u8]) {
        {
            let mut state = self.state.lock();
            if state.reset {
                return;
            }
            state.buf.extend(bytes.iter().copied());
        }
        self.readable.notify_waiters();
    }

    fn set_eof(&self) {
        self.state.lock().eof = true;
        self.readable.notify_waiters();
    }

    fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.reset = true;
            state.buf.clear();
        }
        self.readable.notify_waiters();
    }
}

pub(crate) struct StreamShared {
    id: StreamId,
    /// Connection side that opened the stream.
    opener: usize,
    /// `pipes[s]` holds bytes readable by stream side `s`.
    pipes: [Pipe; 2],
    /// Writer queue of stream side `s`; taken on close.
    outbound: [Mutex<Option<mpsc::UnboundedSender<Outgoing>>>; 2],
    eof_delivered: [AtomicBool; 2],
    reset: watch::Sender<bool>,
    finished: AtomicBool,
}

impl StreamShared {
    fn is_reset(&self) -> bool {
        *self.reset.borrow()
    }

    /// Abort both directions. Idempotent and non-blocking.
    pub(crate) fn reset(&self, conn: &Connection) {
        if self.reset.send_replace(true) {
            return;
        }
        for pipe in &self.pipes {
            pipe.reset();
        }
        for outbound in &self.outbound {
            outbound.lock().take();
        }
        trace!(stream = ?self.id, "stream reset");
        self.finish(conn);
    }

    fn finish(&self, conn: &Connection) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        conn.stream_finished(self.id, self.opener);
    }
}

/// Create the two ends of a new stream. `opener` is the connection side
/// that opened it; `local` and `remote` are the connection halves each end
/// is attached to.
pub(crate) fn pair(id: StreamId, opener: usize, local: Connection, remote: Connection) -> (Stream, Stream) {
    let (tx0, rx0) = mpsc::unbounded_channel();
    let (tx1, rx1) = mpsc::unbounded_channel();
    let (reset, _) = watch::channel(false);
    let shared = Arc::new(StreamShared {
        id,
        opener,
        pipes: [Pipe::default(), Pipe::default()],
        outbound: [Mutex::new(Some(tx0)), Mutex::new(Some(tx1))],
        eof_delivered: [AtomicBool::new(false), AtomicBool::new(false)],
        reset,
        finished: AtomicBool::new(false),
    });

    tokio::spawn(deliver(shared.clone(), 0, rx0, local.clone()));
    tokio::spawn(deliver(shared.clone(), 1, rx1, remote.clone()));

    (
        Stream {
            shared: shared.clone(),
            side: 0,
            conn: local,
        },
        Stream {
            shared,
            side: 1,
            conn: remote,
        },
    )
}

async fn wait_reset(reset: &mut watch::Receiver<bool>) {
    let _ = reset.wait_for(|r| *r).await;
}

/// Delivery sequencer for the writes of stream side `from`.
async fn deliver(
    shared: Arc<StreamShared>,
    from: usize,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    conn: Connection,
) {
    let to = 1 - from;
    let mut reset = shared.reset.subscribe();
    loop {
        let item = tokio::select! {
            biased;
            _ = wait_reset(&mut reset) => return,
            item = queue.recv() => item,
        };
        match item {
            Some(Outgoing::Data { bytes, arrival }) => {
                tokio::select! {
                    biased;
                    _ = wait_reset(&mut reset) => return,
                    _ = tokio::time::sleep_until(arrival) => {}
                }
                shared.pipes[to].push(&bytes);
            }
            Some(Outgoing::Close { flushed }) => {
                shared.pipes[to].set_eof();
                shared.eof_delivered[to].store(true, Ordering::SeqCst);
                let _ = flushed.send(());
                if shared.eof_delivered[from].load(Ordering::SeqCst) {
                    shared.finish(&conn);
                }
                return;
            }
            None => return,
        }
    }
}

/// One end of a stream. Dropping an open stream half-closes it.
pub struct Stream {
    shared: Arc<StreamShared>,
    side: usize,
    conn: Connection,
}

impl Stream {
    pub(crate) fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn local_peer(&self) -> PeerId {
        self.conn.local_peer()
    }

    pub fn remote_peer(&self) -> PeerId {
        self.conn.remote_peer()
    }

    /// Queue `data` for delivery. Never waits for the data to arrive.
    pub async fn write(&self, data: &[u8]) -> Result<usize, NetError> {
        if self.shared.is_reset() {
            return Err(NetError::StreamReset);
        }
        let outbound = self.shared.outbound[self.side].lock();
        let Some(queue) = outbound.as_ref() else {
            return Err(NetError::StreamClosed);
        };
        let arrival = Instant::now() + self.conn.link().transmit_delay(data.len());
        queue
            .send(Outgoing::Data {
                bytes: data.to_vec(),
                arrival,
            })
            .map_err(|_| NetError::StreamReset)?;
        Ok(data.len())
    }

    pub async fn write_all(&self, data: &[u8]) -> Result<(), NetError> {
        self.write(data).await.map(|_| ())
    }

    /// Read delivered bytes into `buf`, bounded by `ctx`.
    pub async fn read_with_context(&self, ctx: &OpContext, buf: &mut [u8]) -> Result<usize, NetError> {
        ctx.run(self.read(buf)).await?
    }

    /// Read delivered bytes into `buf`. Returns `Ok(0)` at EOF.
    ///
    /// Waits until data, EOF or a reset arrives; use
    /// [`read_with_context`](Self::read_with_context) to give up earlier.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        let pipe = &self.shared.pipes[self.side];
        loop {
            let readable = pipe.readable.notified();
            {
                let mut state = pipe.state.lock();
                if state.reset {
                    return Err(NetError::StreamReset);
                }
                if !state.buf.is_empty() {
                    let n = buf.len().min(state.buf.len());
                    for (dst, src) in buf.iter_mut().zip(state.buf.drain(..n)) {
                        *dst = src;
                    }
                    return Ok(n);
                }
                if state.eof {
                    return Ok(0);
                }
            }
            readable.await;
        }
    }

    /// Fill `buf` completely; EOF before that is `StreamClosed`.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<(), NetError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => return Err(NetError::StreamClosed),
                n => filled += n,
            }
        }
        Ok(())
    }

    pub async fn read_to_end(&self) -> Result<Vec<u8>, NetError> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match self.read(&mut chunk).await? {
                0 => return Ok(out),
                n => out.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Half-close: flush pending writes, signal EOF to the peer and wait for
    /// the flush. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), NetError> {
        let (flushed_tx, flushed_rx) = oneshot::channel();
        {
            let mut outbound = self.shared.outbound[self.side].lock();
            let Some(queue) = outbound.take() else {
                return if self.shared.is_reset() {
                    Err(NetError::StreamReset)
                } else {
                    Ok(())
                };
            };
            if queue.send(Outgoing::Close { flushed: flushed_tx }).is_err() {
                return Err(NetError::StreamReset);
            }
        }
        flushed_rx.await.map_err(|_| NetError::StreamReset)
    }

    /// Abort the stream in both directions.
    pub fn reset(&self) {
        self.shared.reset(&self.conn);
    }

    pub fn is_reset(&self) -> bool {
        self.shared.is_reset()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let queue = self.shared.outbound[self.side].lock().take();
        if let Some(queue) = queue {
            let (flushed, _) = oneshot::channel();
            let _ = queue.send(Outgoing::Close { flushed });
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("local", &self.local_peer())
            .field("remote", &self.remote_peer())
            .finish_non_exhaustive()
    }
}
