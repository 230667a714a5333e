//! Per-session state and the transmit-draining thread.
//!
//! A session owns its two fifos, its buffer mapping and its transmit pool;
//! membership, lifecycle state and filter flags live in the multiplexer
//! under the one mux lock (see `mux.rs`). The drain thread is the only
//! consumer of the transmit fifo; receive delivery is called by the
//! multiplexer with the mux lock held.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use ethmux_core::{DescFlags, FrameDesc, SessionId, TxFrame, TxTag, RING_CAPACITY};
use ethmux_shm::{fifo, Doorbell, FifoClient, FifoError, FifoHost, WaitOutcome};

use crate::buffer::{MappedBuffer, TxSpan};
use crate::mux::Mux;
use crate::pool::{PoolError, TxMeta, TxPool};
use crate::Error;

/// Descriptors read from a fifo per batch.
pub(crate) const BATCH: usize = 32;

/// Every how many dropped/backpressured frames a warning is logged (the
/// first occurrence always logs).
const WARN_EVERY: u64 = 256;

bitflags! {
    /// Filter and listen flags held by a session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u32 {
        /// Deliver all frames regardless of destination address.
        const PROMISCUOUS = 1 << 0;
        /// Deliver all multicast frames regardless of group membership.
        const MCAST_PROMISCUOUS = 1 << 1;
        /// Receive loopback echoes of other sessions' transmits.
        const TX_LISTEN = 1 << 2;
        /// Fan this session's transmits out to listeners.
        const TX_LOOPBACK = 1 << 3;
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Dead,
}

/// The client's endpoints of a session's fifos, named from the client's
/// perspective: write `tx` to send frames, post buffers on `rx` to receive.
pub struct SessionFifos {
    pub tx: FifoClient,
    pub rx: FifoClient,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub tx_frames: AtomicU64,
    pub tx_invalid: AtomicU64,
    pub rx_frames: AtomicU64,
    pub rx_drops: AtomicU64,
}

/// Raised by the data path when the session can no longer make progress
/// (ring peer closed); the multiplexer turns it into an internal stop.
pub(crate) struct SessionFatal;

struct RxState {
    /// Receive descriptors read from the ring but not yet consumed,
    /// amortizing the ring-read cost across deliveries.
    cache: VecDeque<FrameDesc>,
    drop_hits: u64,
    full_hits: u64,
}

pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    pub(crate) name: Mutex<String>,
    pub(crate) tx_fifo: FifoHost,
    pub(crate) rx_fifo: FifoHost,
    pub(crate) client_fifos: Mutex<Option<SessionFifos>>,
    pub(crate) buffer: Mutex<Option<Arc<MappedBuffer>>>,
    pub(crate) pool: TxPool,
    rx: Mutex<RxState>,
    /// Signaled by stop/teardown to interrupt the drain thread's wait.
    pub(crate) shutdown_signal: Doorbell,
    shutdown_wait: Doorbell,
    pub(crate) counters: Counters,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId, name: &str) -> Result<Arc<Self>, Error> {
        let (tx_host, tx_client) = fifo::pair()?;
        let (rx_host, rx_client) = fifo::pair()?;
        let (shutdown_signal, shutdown_wait) = Doorbell::pair()?;
        Ok(Arc::new(Self {
            id,
            name: Mutex::new(name.to_owned()),
            tx_fifo: tx_host,
            rx_fifo: rx_host,
            client_fifos: Mutex::new(Some(SessionFifos {
                tx: tx_client,
                rx: rx_client,
            })),
            buffer: Mutex::new(None),
            pool: TxPool::new(RING_CAPACITY),
            rx: Mutex::new(RxState {
                cache: VecDeque::with_capacity(BATCH),
                drop_hits: 0,
                full_hits: 0,
            }),
            shutdown_signal,
            shutdown_wait,
            counters: Counters::default(),
        }))
    }

    /// Clear shutdown signals left over from a previous stop, before the
    /// drain thread is (re)spawned.
    pub(crate) fn drain_stale_shutdown(&self) {
        self.shutdown_wait.drain();
    }

    /// Deliver one received frame into the client's posted buffers.
    ///
    /// Called by the multiplexer with the mux lock held. `extra` is OR'd
    /// into the completion flags (used to mark loopback echoes).
    pub(crate) fn recv_locked(
        &self,
        frame: &[u8],
        extra: DescFlags,
    ) -> Result<(), SessionFatal> {
        let mut rx = self.rx.lock();
        if rx.cache.is_empty() {
            let mut batch = [FrameDesc::zeroed(); BATCH];
            let n = self.rx_fifo.read(&mut batch);
            if n == 0 {
                if self.rx_fifo.is_closed() {
                    return Err(SessionFatal);
                }
                // No receive buffer posted; the frame is dropped.
                self.counters.rx_drops.fetch_add(1, Ordering::Relaxed);
                if rx.drop_hits % WARN_EVERY == 0 {
                    tracing::warn!(
                        session = self.id.0,
                        drops = rx.drop_hits + 1,
                        "receive ring empty, dropping frame"
                    );
                }
                rx.drop_hits += 1;
                return Ok(());
            }
            rx.cache.extend(batch[..n].iter().copied());
        }
        let mut desc = match rx.cache.pop_front() {
            Some(desc) => desc,
            None => return Ok(()),
        };

        let buffer = self.buffer.lock().clone();
        let fits = buffer.as_ref().is_some_and(|buf| {
            frame.len() <= desc.length as usize && buf.span(desc.offset, desc.length).is_ok()
        });
        if let (true, Some(buf)) = (fits, buffer) {
            // The bounds were checked through the same accessor used here.
            if let Ok(span) = buf.span(desc.offset, frame.len() as u32) {
                span.copy_from(frame);
                desc.length = frame.len() as u32;
                desc.set_flags(DescFlags::RX_OK | extra);
            } else {
                desc.length = 0;
                desc.set_flags(DescFlags::INVALID);
            }
        } else {
            desc.length = 0;
            desc.set_flags(DescFlags::INVALID);
        }

        match self.rx_fifo.write(&[desc]) {
            Ok(1) => {
                self.counters.rx_frames.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(_) => {
                // Ring full: backpressure, keep the descriptor for the next
                // delivery attempt.
                if rx.full_hits % WARN_EVERY == 0 {
                    tracing::warn!(session = self.id.0, "receive ring full, backpressure");
                }
                rx.full_hits += 1;
                rx.cache.push_front(desc);
                Ok(())
            }
            Err(FifoError::Full) => Ok(()),
            Err(FifoError::Closed) => Err(SessionFatal),
        }
    }

    /// Diagnostics snapshot of the fifo depths.
    pub(crate) fn fifo_depths(&self) -> (usize, usize) {
        (self.tx_fifo.pending_in(), self.rx_fifo.pending_in())
    }
}

/// Body of the per-session transmit-draining thread.
///
/// Blocks on the transmit fifo until descriptors arrive or the shutdown
/// doorbell fires. Runs until stop, fifo closure, or a fatal error.
pub(crate) fn drain_loop(mux: Arc<Mux>, shared: Arc<SessionShared>) {
    let id = shared.id;
    tracing::debug!(session = id.0, "drain thread started");
    let mut batch = [FrameDesc::zeroed(); BATCH];
    loop {
        match shared.tx_fifo.wait_readable(&shared.shutdown_wait) {
            WaitOutcome::Shutdown => break,
            WaitOutcome::Closed => {
                tracing::debug!(session = id.0, "transmit ring closed by peer");
                mux.fatal_session(id);
                break;
            }
            WaitOutcome::Readable => {}
        }
        let n = shared.tx_fifo.read(&mut batch);
        if n == 0 {
            continue;
        }
        if !process_batch(&mux, &shared, &batch[..n]) {
            mux.fatal_session(id);
            break;
        }
    }
    tracing::debug!(session = id.0, "drain thread exiting");
    mux.note_thread_exit(id);
}

/// Handle one batch of transmit descriptors. Returns false on a fatal
/// condition (the thread then terminates).
fn process_batch(mux: &Arc<Mux>, shared: &Arc<SessionShared>, batch: &[FrameDesc]) -> bool {
    let buffer = match shared.buffer.lock().clone() {
        Some(buffer) => buffer,
        // Running implies bound; a missing buffer means mid-teardown.
        None => return false,
    };

    let mut invalid: Vec<FrameDesc> = Vec::new();
    let mut ready: Vec<(TxTag, TxSpan)> = Vec::new();

    for desc in batch {
        let span = match TxSpan::new(Arc::clone(&buffer), desc.offset, desc.length) {
            Ok(span) => span,
            Err(_) => {
                // Out of bounds: never reaches the device. Flag and return
                // to the client with the cookie untouched.
                let mut bad = *desc;
                bad.set_flags(DescFlags::INVALID);
                invalid.push(bad);
                shared.counters.tx_invalid.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let meta = TxMeta {
            offset: desc.offset,
            length: desc.length,
        };
        let slot = match shared.pool.try_borrow(meta) {
            Ok(slot) => slot,
            Err(PoolError::Exhausted) => {
                // Pool size equals ring capacity; exhaustion means flow
                // control is broken beyond recovery.
                tracing::error!(
                    session = shared.id.0,
                    "transmit pool exhausted, terminating session"
                );
                for (tag, _) in ready.drain(..) {
                    let _ = shared.pool.release(tag.slot);
                }
                return false;
            }
            Err(err) => {
                tracing::error!(session = shared.id.0, ?err, "transmit pool corrupt");
                return false;
            }
        };
        let tag = TxTag {
            session: shared.id,
            slot,
            cookie: desc.cookie,
        };
        ready.push((tag, span));
    }

    if !ready.is_empty() {
        match mux.begin_tx(shared.id, ready.len()) {
            Some(loopback) => {
                // Loopback echoes are captured before submission so the
                // bytes are the ones that went to the wire.
                let echoes: Vec<Vec<u8>> = if loopback {
                    ready
                        .iter()
                        .map(|(_, span)| ethmux_core::TxPayload::bytes(span).to_vec())
                        .collect()
                } else {
                    Vec::new()
                };

                let count = ready.len();
                let device = mux.device();
                for (i, (tag, span)) in ready.into_iter().enumerate() {
                    let frame = TxFrame {
                        payload: Arc::new(span),
                        tag,
                    };
                    device.queue_transmit(frame, i + 1 < count);
                }
                shared
                    .counters
                    .tx_frames
                    .fetch_add(count as u64, Ordering::Relaxed);

                for echo in &echoes {
                    mux.fanout_echo(echo);
                }
            }
            None => {
                // Session left the active set while this batch was read;
                // drop the submissions and give the slots back.
                for (tag, _) in ready {
                    let _ = shared.pool.release(tag.slot);
                }
            }
        }
    }

    if !invalid.is_empty() {
        match shared.tx_fifo.write(&invalid) {
            Ok(n) if n < invalid.len() => {
                tracing::warn!(session = shared.id.0, "transmit ring full on write-back");
            }
            Ok(_) => {}
            Err(FifoError::Full) => {}
            Err(FifoError::Closed) => return false,
        }
    }

    true
}
