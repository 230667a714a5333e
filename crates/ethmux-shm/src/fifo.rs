//! Bidirectional descriptor fifo between the multiplexer (host) and a
//! client.
//!
//! One fifo owns a three-page shared region (header page, client→host ring,
//! host→client ring) and a doorbell pair. Ring closure is terminal; the
//! `closed` flag lives in the header page so either side observes it. The
//! receive fifo additionally carries the out-of-band status signal: a single
//! edge-triggered bit set by the host whenever hardware status changes and
//! cleared only by the client reading status.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethmux_core::FrameDesc;

use crate::doorbell::{wait_any, Doorbell};
use crate::region::SharedRegion;
use crate::ring::DescRing;
use crate::ShmError;

const PAGE: usize = 4096;

/// Size of the shared region backing one fifo.
pub const FIFO_REGION_SIZE: usize = 3 * PAGE;

const C2H_RING_OFFSET: usize = PAGE;
const H2C_RING_OFFSET: usize = 2 * PAGE;

#[repr(C)]
struct FifoHeader {
    /// Non-zero once either side closed the fifo. Terminal.
    closed: AtomicU32,
    /// Out-of-band status signal bit (receive fifo only).
    status: AtomicU32,
}

/// Errors from fifo writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoError {
    /// The destination ring is full. Writes never block.
    Full,
    /// The peer closed the fifo.
    Closed,
}

impl std::fmt::Display for FifoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FifoError::Full => write!(f, "descriptor ring full"),
            FifoError::Closed => write!(f, "fifo closed by peer"),
        }
    }
}

impl std::error::Error for FifoError {}

/// What woke a blocking host-side wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Descriptors are available to read.
    Readable,
    /// The shutdown doorbell fired.
    Shutdown,
    /// The fifo was closed.
    Closed,
}

struct FifoShared {
    _region: Arc<SharedRegion>,
    hdr: *const FifoHeader,
    c2h: DescRing,
    h2c: DescRing,
}

// SAFETY: hdr points into the mapping kept alive by `_region`; all shared
// state behind it is atomic.
unsafe impl Send for FifoShared {}
unsafe impl Sync for FifoShared {}

impl FifoShared {
    fn hdr(&self) -> &FifoHeader {
        // SAFETY: valid while `_region` is held.
        unsafe { &*self.hdr }
    }

    fn is_closed(&self) -> bool {
        self.hdr().closed.load(Ordering::Acquire) != 0
    }

    fn close(&self) {
        self.hdr().closed.store(1, Ordering::Release);
    }
}

/// Create a connected fifo, returning the host and client endpoints.
pub fn pair() -> Result<(FifoHost, FifoClient), ShmError> {
    let region = Arc::new(SharedRegion::create(FIFO_REGION_SIZE)?);
    // memfd pages start zeroed, so the header (closed = 0, status = 0) needs
    // no explicit initialization.
    let c2h = DescRing::init_at(&region, C2H_RING_OFFSET)?;
    let h2c = DescRing::init_at(&region, H2C_RING_OFFSET)?;
    let shared = Arc::new(FifoShared {
        hdr: region.base().cast(),
        _region: region,
        c2h,
        h2c,
    });
    let (host_db, client_db) = Doorbell::pair()?;
    Ok((
        FifoHost {
            shared: Arc::clone(&shared),
            db: host_db,
        },
        FifoClient {
            shared,
            db: client_db,
        },
    ))
}

/// Multiplexer-side endpoint: consumes client descriptors, produces
/// completions/deliveries.
pub struct FifoHost {
    shared: Arc<FifoShared>,
    db: Doorbell,
}

impl FifoHost {
    /// Non-blocking batch read of client-posted descriptors.
    pub fn read(&self, out: &mut [FrameDesc]) -> usize {
        self.shared.c2h.pop_batch(out)
    }

    /// Write descriptors back to the client. Never blocks: returns how many
    /// were written before the ring filled.
    pub fn write(&self, descs: &[FrameDesc]) -> Result<usize, FifoError> {
        if self.shared.is_closed() {
            return Err(FifoError::Closed);
        }
        let mut written = 0;
        for desc in descs {
            if self.shared.h2c.try_push(desc).is_err() {
                break;
            }
            written += 1;
        }
        if written > 0 {
            self.db.signal();
        }
        Ok(written)
    }

    /// Block until client descriptors are readable, the fifo closes, or the
    /// shutdown doorbell fires.
    pub fn wait_readable(&self, shutdown: &Doorbell) -> WaitOutcome {
        loop {
            if !self.shared.c2h.is_empty() {
                return WaitOutcome::Readable;
            }
            if self.shared.is_closed() {
                return WaitOutcome::Closed;
            }
            match wait_any(&[&self.db, shutdown], None) {
                Ok(Some(0)) | Ok(None) => continue,
                Ok(Some(_)) => return WaitOutcome::Shutdown,
                Err(err) => {
                    tracing::warn!("fifo wait failed: {err}");
                    return WaitOutcome::Closed;
                }
            }
        }
    }

    /// Raise the out-of-band status signal and wake the client.
    pub fn signal_status(&self) {
        self.shared.hdr().status.store(1, Ordering::Release);
        self.db.signal();
    }

    /// Clear the status signal (the control-surface status read).
    pub fn clear_status_signal(&self) {
        self.shared.hdr().status.store(0, Ordering::Release);
    }

    pub fn close(&self) {
        self.shared.close();
        self.db.signal();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Client-posted descriptors not yet read (diagnostics).
    pub fn pending_in(&self) -> usize {
        self.shared.c2h.len()
    }

    /// Completions not yet collected by the client (diagnostics).
    pub fn pending_out(&self) -> usize {
        self.shared.h2c.len()
    }
}

/// Client-side endpoint: posts descriptors, collects completions.
pub struct FifoClient {
    shared: Arc<FifoShared>,
    db: Doorbell,
}

impl FifoClient {
    /// Post descriptors to the host. Never blocks: returns how many were
    /// written before the ring filled.
    pub fn write(&self, descs: &[FrameDesc]) -> Result<usize, FifoError> {
        if self.shared.is_closed() {
            return Err(FifoError::Closed);
        }
        let mut written = 0;
        for desc in descs {
            if self.shared.c2h.try_push(desc).is_err() {
                break;
            }
            written += 1;
        }
        if written > 0 {
            self.db.signal();
        }
        Ok(written)
    }

    /// Non-blocking batch read of host-returned descriptors.
    pub fn read(&self, out: &mut [FrameDesc]) -> usize {
        self.shared.h2c.pop_batch(out)
    }

    /// Read host-returned descriptors, blocking up to `timeout`. `Ok(0)`
    /// means the timeout elapsed.
    pub fn read_blocking(
        &self,
        out: &mut [FrameDesc],
        timeout: Duration,
    ) -> Result<usize, FifoError> {
        let deadline = Instant::now() + timeout;
        loop {
            let n = self.read(out);
            if n > 0 {
                return Ok(n);
            }
            if self.shared.is_closed() {
                return Err(FifoError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            match self.db.wait(Some(deadline - now)) {
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!("fifo wait failed: {err}");
                    return Err(FifoError::Closed);
                }
            }
        }
    }

    /// Consume the out-of-band status signal. Returns whether it was set.
    pub fn take_status_signal(&self) -> bool {
        self.shared.hdr().status.swap(0, Ordering::AcqRel) != 0
    }

    pub fn close(&self) {
        self.shared.close();
        self.db.signal();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn capacity(&self) -> u32 {
        self.shared.c2h.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethmux_core::RING_CAPACITY;

    #[test]
    fn round_trip_both_directions() {
        let (host, client) = pair().unwrap();

        client.write(&[FrameDesc::new(0, 64, 1)]).unwrap();
        let mut batch = [FrameDesc::zeroed(); 4];
        assert_eq!(host.read(&mut batch), 1);
        assert_eq!(batch[0].cookie, 1);

        host.write(&[FrameDesc::new(0, 64, 2)]).unwrap();
        assert_eq!(client.read(&mut batch), 1);
        assert_eq!(batch[0].cookie, 2);
    }

    #[test]
    fn write_reports_full() {
        let (_host, client) = pair().unwrap();
        let descs: Vec<FrameDesc> = (0..RING_CAPACITY as u64 + 8)
            .map(|i| FrameDesc::new(0, 0, i))
            .collect();
        let written = client.write(&descs).unwrap();
        assert_eq!(written, RING_CAPACITY as usize);
    }

    #[test]
    fn closed_is_terminal() {
        let (host, client) = pair().unwrap();
        client.close();
        assert!(host.is_closed());
        assert_eq!(host.write(&[FrameDesc::zeroed()]), Err(FifoError::Closed));
        assert_eq!(client.write(&[FrameDesc::zeroed()]), Err(FifoError::Closed));
    }

    #[test]
    fn status_signal_is_edge_triggered() {
        let (host, client) = pair().unwrap();
        assert!(!client.take_status_signal());
        host.signal_status();
        host.signal_status();
        assert!(client.take_status_signal());
        assert!(!client.take_status_signal());
    }

    #[test]
    fn blocking_read_wakes_on_write() {
        let (host, client) = pair().unwrap();
        let t = std::thread::spawn(move || {
            let mut out = [FrameDesc::zeroed(); 4];
            let n = client.read_blocking(&mut out, Duration::from_secs(5)).unwrap();
            (n, out[0].cookie)
        });
        std::thread::sleep(Duration::from_millis(20));
        host.write(&[FrameDesc::new(0, 0, 42)]).unwrap();
        assert_eq!(t.join().unwrap(), (1, 42));
    }

    #[test]
    fn wait_readable_sees_shutdown() {
        let (host, _client) = pair().unwrap();
        let (signal, wait) = Doorbell::pair().unwrap();
        let t = std::thread::spawn(move || host.wait_readable(&wait));
        std::thread::sleep(Duration::from_millis(20));
        signal.signal();
        assert_eq!(t.join().unwrap(), WaitOutcome::Shutdown);
    }

    #[test]
    fn wait_readable_prefers_data() {
        let (host, client) = pair().unwrap();
        let (_signal, wait) = Doorbell::pair().unwrap();
        client.write(&[FrameDesc::new(0, 0, 9)]).unwrap();
        assert_eq!(host.wait_readable(&wait), WaitOutcome::Readable);
    }
}
