//! Descriptor wire format shared between a client and the multiplexer.
//!
//! Both directions of both rings carry the same fixed-size entry. The client
//! is the producer on its transmit ring (frames to send) and on its receive
//! ring (empty buffers to fill); the multiplexer writes the same entries back
//! with completion flags set and the `cookie` untouched.

use bitflags::bitflags;

/// Number of entries in each descriptor ring (build-time constant).
///
/// One ring header plus `RING_CAPACITY` entries must fit a single 4 KiB
/// page; with 24-byte entries that caps the capacity at 128.
pub const RING_CAPACITY: u32 = 128;

/// Size of [`FrameDesc`] in bytes (must be 24).
pub const FRAME_DESC_SIZE: usize = 24;

bitflags! {
    /// Completion and validity flags carried in [`FrameDesc::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescFlags: u16 {
        /// Receive completed; `length` bytes were written to the buffer.
        const RX_OK = 1 << 0;
        /// Transmit completed successfully.
        const TX_OK = 1 << 1;
        /// The descriptor was rejected (bad bounds or undersized buffer)
        /// and was not processed.
        const INVALID = 1 << 2;
        /// The frame is a loopback echo of another session's transmit,
        /// not a real receive from the wire.
        const ECHO = 1 << 3;
    }
}

/// A single descriptor ring entry.
///
/// `offset` and `length` address the session's bound shared buffer; `cookie`
/// is opaque to the multiplexer and echoed back unchanged on completion.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameDesc {
    /// Byte offset of the frame within the bound buffer region.
    pub offset: u32,
    /// Frame length (transmit) or buffer capacity (posted receive).
    pub length: u32,
    /// Raw [`DescFlags`] bits.
    pub flags: u16,
    _pad: u16,
    /// Client-chosen value, never interpreted by the multiplexer.
    pub cookie: u64,
}

// The ring stores entries as raw shared memory; the size is part of the
// wire format and must not drift.
const _: () = assert!(core::mem::size_of::<FrameDesc>() == FRAME_DESC_SIZE);
const _: () = assert!(core::mem::align_of::<FrameDesc>() == 8);

impl FrameDesc {
    /// A descriptor addressing `[offset, offset + length)` of the buffer.
    pub fn new(offset: u32, length: u32, cookie: u64) -> Self {
        Self {
            offset,
            length,
            flags: 0,
            _pad: 0,
            cookie,
        }
    }

    /// An all-zero descriptor, useful as batch-read scratch space.
    pub fn zeroed() -> Self {
        Self::default()
    }

    /// The flags field, decoded. Unknown bits are dropped.
    pub fn desc_flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }

    /// Overwrite the flags field.
    pub fn set_flags(&mut self, flags: DescFlags) {
        self.flags = flags.bits();
    }

    /// The exclusive end offset, widened so it cannot wrap.
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_is_wire_sized() {
        assert_eq!(core::mem::size_of::<FrameDesc>(), FRAME_DESC_SIZE);
    }

    #[test]
    fn ring_fits_one_page() {
        // 64-byte ring header + entries, see ethmux-shm::ring.
        assert!(64 + RING_CAPACITY as usize * FRAME_DESC_SIZE <= 4096);
    }

    #[test]
    fn flags_round_trip() {
        let mut desc = FrameDesc::new(4096, 1500, 0xdead_beef);
        desc.set_flags(DescFlags::RX_OK | DescFlags::ECHO);
        assert_eq!(desc.desc_flags(), DescFlags::RX_OK | DescFlags::ECHO);
        assert_eq!(desc.cookie, 0xdead_beef);
    }

    #[test]
    fn end_does_not_wrap() {
        let desc = FrameDesc::new(u32::MAX, u32::MAX, 0);
        assert_eq!(desc.end(), u64::from(u32::MAX) * 2);
    }
}
