//! Contract presented by the underlying hardware or virtual device.
//!
//! The multiplexer never talks to real hardware directly; it drives whatever
//! implements [`NetDevice`] and receives events back through the single
//! [`EventSink`] it registers at first start. Transmit completions are routed
//! with an explicit [`TxTag`] decoded by the completion handler, rather than
//! private state smuggled inside the buffer payload.

use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

use crate::mac::MacAddr;

/// Stable identifier of a session within its multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

/// Handle to a transmit pool slot. The generation detects stale releases
/// after the slot has been recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    pub index: u32,
    pub generation: u32,
}

bitflags! {
    /// Link state reported by the device. Empty means link down.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LinkStatus: u32 {
        const ONLINE = 1 << 0;
    }
}

/// Result of querying the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub mac: MacAddr,
    pub mtu: u32,
    /// Largest single frame the device will accept for transmit.
    pub max_tx_buffer_size: u32,
    /// Whether the device requires buffers pinned into its DMA address
    /// space (see [`NetDevice::dma_handle`]).
    pub dma_capable: bool,
}

/// Opaque handle to the DMA address space of a DMA-capable device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaHandle(pub u64);

/// A filtering parameter pushed down to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Promiscuous(bool),
    MulticastPromiscuous(bool),
    /// The full deduplicated multicast filter list.
    MulticastFilter(Vec<MacAddr>),
    /// The aggregate filter no longer fits the device; deliver all
    /// multicast frames until a full list is pushed again.
    MulticastFilterOverflow,
}

/// Outcome the device reports for one queued transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Ok,
    Failed,
}

/// Errors the device surfaces to the multiplexer.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device refused to start")]
    StartFailed,
    #[error("device rejected parameter")]
    ParamRejected,
    #[error("device reports no DMA address space")]
    NoDma,
    #[error("device I/O error: {0}")]
    Io(String),
}

/// Read access to the bytes of a queued transmit.
///
/// The payload stays valid until the matching completion is delivered; the
/// implementation keeps the backing mapping alive for at least that long.
pub trait TxPayload: Send + Sync {
    fn bytes(&self) -> &[u8];
}

/// Completion routing tag carried alongside a transmit.
///
/// Decoded explicitly in [`EventSink::on_tx_complete`]: `session` locates
/// the owning session, `slot` returns the pool entry, `cookie` is echoed to
/// the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxTag {
    pub session: SessionId,
    pub slot: SlotHandle,
    pub cookie: u64,
}

/// One transmit operation handed to the device.
pub struct TxFrame {
    pub payload: Arc<dyn TxPayload>,
    pub tag: TxTag,
}

impl std::fmt::Debug for TxFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxFrame")
            .field("len", &self.payload.bytes().len())
            .field("tag", &self.tag)
            .finish()
    }
}

/// Callback sink the multiplexer registers with the device.
///
/// A single sink is registered when the first session starts and is never
/// re-registered while any session remains active. Callbacks may arrive on
/// any thread the device layer supplies, including from inside
/// [`NetDevice::start`] before it returns.
pub trait EventSink: Send + Sync {
    /// Link status changed.
    fn on_status(&self, status: LinkStatus);
    /// A frame arrived from the wire.
    fn on_receive(&self, frame: &[u8]);
    /// A previously queued transmit finished.
    fn on_tx_complete(&self, tag: TxTag, status: TxStatus);
}

/// The device abstraction the multiplexer drives.
pub trait NetDevice: Send + Sync {
    /// Capabilities and addressing of the device.
    fn query(&self) -> DeviceInfo;

    /// Start the device and register the callback sink. The device may
    /// invoke the sink before this call returns.
    fn start(&self, sink: Arc<dyn EventSink>) -> Result<(), DeviceError>;

    /// Stop the device. Already-queued transmits still complete.
    fn stop(&self);

    /// Queue one frame for asynchronous transmit. `more` hints that further
    /// frames of the same batch follow immediately, letting the device delay
    /// its doorbell. Completion arrives on the sink.
    fn queue_transmit(&self, frame: TxFrame, more: bool);

    /// Push a filtering parameter.
    fn set_parameter(&self, param: Param) -> Result<(), DeviceError>;

    /// The DMA address-space handle. `None` unless `dma_capable`.
    fn dma_handle(&self) -> Option<DmaHandle>;
}
