//! ethmux-shm: shared-memory primitives for the descriptor-ring protocol.
//!
//! This crate defines the canonical memory layout a session shares with its
//! client and the wakeup machinery around it.
//!
//! # Characteristics
//!
//! - SPSC rings of fixed-size [`FrameDesc`](ethmux_core::FrameDesc) entries
//! - socketpair doorbells for blocking, cross-process wakeup
//! - bounds-checked access into the client's buffer region; the unsafe
//!   pointer arithmetic lives in exactly one place ([`SharedRegion::span`])
//!
//! # Fifo layout
//!
//! Each fifo owns one three-page region plus a doorbell pair:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  Fifo header (closed flag, status signal)   │  page 0
//! ├─────────────────────────────────────────────┤
//! │  client→host descriptor ring                │  page 1
//! ├─────────────────────────────────────────────┤
//! │  host→client descriptor ring                │  page 2
//! └─────────────────────────────────────────────┘
//! ```
//!
//! A session uses two fifos, named from the client's perspective: the
//! transmit fifo (client posts frames, host returns completions) and the
//! receive fifo (client posts empty buffers, host returns filled ones).

pub mod doorbell;
pub mod fifo;
pub mod region;
pub mod ring;

use std::io;

use thiserror::Error;

pub use doorbell::{wait_any, Doorbell};
pub use fifo::{FifoClient, FifoError, FifoHost, WaitOutcome, FIFO_REGION_SIZE};
pub use region::{BufferHandle, SharedRegion, Span};
pub use ring::{DescRing, RingError, RING_BYTES, RING_HEADER_SIZE};

/// Errors from creating or addressing shared memory.
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("range [{offset}, {offset}+{length}) exceeds region of {size} bytes")]
    OutOfBounds { offset: u32, length: u32, size: usize },
    #[error("region length {0} is not usable")]
    BadLength(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}
