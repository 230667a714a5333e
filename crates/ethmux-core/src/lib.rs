//! ethmux-core: wire format and device contract for the ethmux multiplexer.
//!
//! This crate holds the types shared by every layer of the multiplexer:
//!
//! - [`FrameDesc`]: the fixed-size descriptor exchanged over the session
//!   rings (the **canonical wire format**)
//! - [`MacAddr`]: IEEE 802 addresses and the multicast/broadcast tests the
//!   filter aggregation relies on
//! - [`NetDevice`] / [`EventSink`]: the contract presented by the underlying
//!   hardware or virtual device, and the callback sink the multiplexer
//!   registers with it
//!
//! Nothing in here touches shared memory or threads; those live in
//! `ethmux-shm` and `ethmux` respectively.

pub mod desc;
pub mod device;
pub mod mac;

pub use desc::{DescFlags, FrameDesc, FRAME_DESC_SIZE, RING_CAPACITY};
pub use device::{
    DeviceError, DeviceInfo, DmaHandle, EventSink, LinkStatus, NetDevice, Param, SessionId,
    SlotHandle, TxFrame, TxPayload, TxStatus, TxTag,
};
pub use mac::MacAddr;

/// Multicast addresses a single session may have tracked at one time.
pub const MULTICAST_MAX_PER_SESSION: usize = 32;

/// Device-wide multicast filter capacity. When the deduplicated union across
/// all active sessions exceeds this, the device is put into filter-overflow
/// mode instead of receiving a partial list.
pub const MAX_MULTICAST_FILTERS: usize = 64;
