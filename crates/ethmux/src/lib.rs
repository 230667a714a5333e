//! ethmux: a network-interface multiplexer.
//!
//! One hardware (or virtual) network device is shared among N independent
//! client sessions; each session exchanges raw frames with the device
//! through a private, zero-copy, shared-memory descriptor-ring protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐   tx/rx fifos   ┌─────────────────────┐
//! │ client A  │◄───────────────►│                     │
//! └───────────┘                 │                     │   ┌────────────┐
//! ┌───────────┐                 │   Mux (one lock:    │◄──┤ NetDevice  │
//! │ client B  │◄───────────────►│   sessions, filter  │──►│ (hardware) │
//! └───────────┘                 │   aggregation)      │   └────────────┘
//! ┌───────────┐                 │                     │
//! │ client C  │◄───────────────►│                     │
//! └───────────┘                 └─────────────────────┘
//! ```
//!
//! Each active session runs one transmit-draining thread over its own fifo;
//! receive and status events from the device fan out to every active
//! session. Promiscuous and multicast filter requests aggregate across
//! sessions into the single hardware-visible filter state.
//!
//! # Quick start
//!
//! ```ignore
//! let mux = Mux::new(device);
//! let session = mux.open_session("netstack")?;
//! let fifos = session.take_fifos().unwrap();
//! session.bind_buffer(BufferHandle::allocate(64 * 1024)?)?;
//! session.start()?;
//!
//! // Post a receive buffer, then collect the filled descriptor.
//! fifos.rx.write(&[FrameDesc::new(0, 2048, 1)])?;
//! let mut out = [FrameDesc::zeroed(); 8];
//! let n = fifos.rx.read_blocking(&mut out, Duration::from_secs(1))?;
//! ```

mod buffer;
mod filter;
mod mux;
mod pool;
mod session;

use thiserror::Error;

pub use mux::{Mux, MuxDiagnostics, Session, SessionDiagnostics};
pub use pool::{PoolError, TxMeta, TxPool};
pub use session::{SessionFifos, SessionFlags, SessionState};

// Re-export the core and shm types the public surface is built from.
pub use ethmux_core::{
    DescFlags, DeviceError, DeviceInfo, DmaHandle, EventSink, FrameDesc, LinkStatus, MacAddr,
    NetDevice, Param, SessionId, TxFrame, TxPayload, TxStatus, TxTag, FRAME_DESC_SIZE,
    MAX_MULTICAST_FILTERS, MULTICAST_MAX_PER_SESSION, RING_CAPACITY,
};
pub use ethmux_shm::{BufferHandle, FifoClient, FifoError, SharedRegion, ShmError};

/// Errors surfaced by the session control surface.
#[derive(Debug, Error)]
pub enum Error {
    /// A shared buffer region is already bound to the session.
    #[error("a shared buffer is already bound")]
    AlreadyBound,
    /// The caller passed something unusable; the session is untouched.
    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),
    /// The session is dead, the device is gone, or a precondition
    /// (e.g. bound buffer before start) is missing.
    #[error("session or device is not in a usable state")]
    BadState,
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
