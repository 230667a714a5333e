//! The session's bound shared buffer.
//!
//! Binding maps the client-supplied handle for the session's lifetime and,
//! when the device requires physical addressing, derives the DMA binding up
//! front; a pin failure propagates as a configuration error and the region
//! is not considered bound.

use std::sync::Arc;

use ethmux_core::{DeviceError, DeviceInfo, DmaHandle, NetDevice, TxPayload};
use ethmux_shm::{BufferHandle, SharedRegion, ShmError, Span};

use crate::Error;

pub(crate) struct MappedBuffer {
    region: SharedRegion,
    dma: Option<DmaHandle>,
}

impl MappedBuffer {
    pub(crate) fn bind(
        handle: BufferHandle,
        info: &DeviceInfo,
        device: &dyn NetDevice,
    ) -> Result<Self, Error> {
        let region = SharedRegion::map(handle)?;
        let dma = if info.dma_capable {
            Some(
                device
                    .dma_handle()
                    .ok_or(Error::Device(DeviceError::NoDma))?,
            )
        } else {
            None
        };
        Ok(Self { region, dma })
    }

    pub(crate) fn span(&self, offset: u32, length: u32) -> Result<Span<'_>, ShmError> {
        self.region.span(offset, length)
    }

    pub(crate) fn len(&self) -> usize {
        self.region.len()
    }

    #[allow(dead_code)]
    pub(crate) fn dma(&self) -> Option<DmaHandle> {
        self.dma
    }
}

/// A validated window of the bound buffer, handed to the device as the
/// payload of one transmit. Holding the buffer `Arc` keeps the mapping alive
/// until the completion fires, even if the session is torn down meanwhile.
pub(crate) struct TxSpan {
    _buffer: Arc<MappedBuffer>,
    ptr: *const u8,
    len: usize,
}

// SAFETY: ptr stays valid while `_buffer` keeps the mapping alive; the
// bytes are plain shared memory.
unsafe impl Send for TxSpan {}
unsafe impl Sync for TxSpan {}

impl TxSpan {
    pub(crate) fn new(
        buffer: Arc<MappedBuffer>,
        offset: u32,
        length: u32,
    ) -> Result<Self, ShmError> {
        let slice = buffer.span(offset, length)?.as_slice();
        let (ptr, len) = (slice.as_ptr(), slice.len());
        Ok(Self {
            _buffer: buffer,
            ptr,
            len,
        })
    }
}

impl TxPayload for TxSpan {
    fn bytes(&self) -> &[u8] {
        // SAFETY: range validated at construction, mapping held by `_buffer`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}
