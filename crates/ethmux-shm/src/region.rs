//! Shared memory regions and bounds-checked access into them.
//!
//! A region is backed by a memfd so the same pages can be mapped by both the
//! multiplexer and its client. Every descriptor-driven access into a region
//! goes through [`SharedRegion::span`]; nothing else in the workspace does
//! offset arithmetic on raw pointers.

use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;

use crate::ShmError;

/// An ownable, transferable handle to region memory (a memfd plus length).
///
/// This is what a client hands to `bind_buffer`: the multiplexer maps it,
/// the client keeps (or maps) its own clone.
#[derive(Debug)]
pub struct BufferHandle {
    fd: OwnedFd,
    len: usize,
}

impl BufferHandle {
    /// Allocate fresh anonymous shared memory of `len` bytes.
    pub fn allocate(len: usize) -> Result<Self, ShmError> {
        if len == 0 {
            return Err(ShmError::BadLength(len));
        }
        // SAFETY: name is a valid NUL-terminated string; memfd_create does
        // not retain it.
        let raw = unsafe {
            libc::memfd_create(c"ethmux-region".as_ptr(), libc::MFD_CLOEXEC)
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: memfd_create succeeded and we are the sole owner of raw.
        let fd = unsafe { <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(raw) };
        let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { fd, len })
    }

    /// Duplicate the handle (both refer to the same pages).
    pub fn try_clone(&self) -> Result<Self, ShmError> {
        Ok(Self {
            fd: self.fd.try_clone().map_err(ShmError::Io)?,
            len: self.len,
        })
    }

    /// Length in bytes of the memory behind the handle.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A mapped shared memory region.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    fd: OwnedFd,
}

// SAFETY: the mapping is plain memory; all access is bounds-checked through
// `span`, and concurrent peer writes are inherent to the shared protocol.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocate and map a fresh region.
    pub fn create(len: usize) -> Result<Self, ShmError> {
        Self::map(BufferHandle::allocate(len)?)
    }

    /// Map the memory behind an existing handle.
    pub fn map(handle: BufferHandle) -> Result<Self, ShmError> {
        if handle.len == 0 {
            return Err(ShmError::BadLength(handle.len));
        }
        // SAFETY: fd is a valid memfd of at least `len` bytes; we request a
        // fresh mapping and check for MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                handle.len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                handle.fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let Some(ptr) = NonNull::new(ptr.cast()) else {
            return Err(io::Error::other("mmap returned NULL").into());
        };
        Ok(Self {
            ptr,
            len: handle.len,
            fd: handle.fd,
        })
    }

    /// A new handle to the same pages, for the peer to map.
    pub fn handle(&self) -> Result<BufferHandle, ShmError> {
        Ok(BufferHandle {
            fd: self.fd.try_clone().map_err(ShmError::Io)?,
            len: self.len,
        })
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bounds-checked view of `[offset, offset + length)`.
    ///
    /// All descriptor processing funnels through here; a descriptor whose
    /// range does not fit the region is rejected before any pointer math.
    pub fn span(&self, offset: u32, length: u32) -> Result<Span<'_>, ShmError> {
        let end = u64::from(offset) + u64::from(length);
        if end > self.len as u64 {
            return Err(ShmError::OutOfBounds {
                offset,
                length,
                size: self.len,
            });
        }
        Ok(Span {
            // SAFETY: offset + length <= len was checked just above.
            ptr: unsafe { self.ptr.as_ptr().add(offset as usize) },
            len: length as usize,
            _region: PhantomData,
        })
    }

    /// Raw base pointer for structured overlays (ring headers). Callers
    /// must stay within `len`; only the ring module uses this.
    pub(crate) fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap of exactly this size.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// A validated window into a [`SharedRegion`].
///
/// The peer may write the same pages concurrently; reads observe whatever
/// bytes are there, which is inherent to the shared-buffer protocol. The
/// window itself can never escape the region bounds.
pub struct Span<'a> {
    ptr: *mut u8,
    len: usize,
    _region: PhantomData<&'a SharedRegion>,
}

impl<'a> Span<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` into the start of the window. `src` must fit.
    pub fn copy_from(&self, src: &[u8]) {
        assert!(src.len() <= self.len, "copy_from source exceeds span");
        // SAFETY: both ranges are valid for src.len() bytes and the region
        // mapping outlives `self`.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr, src.len());
        }
    }

    /// Copy the start of the window into `dst`. `dst` must fit.
    pub fn copy_to(&self, dst: &mut [u8]) {
        assert!(dst.len() <= self.len, "copy_to destination exceeds span");
        // SAFETY: as above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr, dst.as_mut_ptr(), dst.len());
        }
    }

    /// The window as a byte slice.
    pub fn as_slice(&self) -> &'a [u8] {
        // SAFETY: the range was bounds-checked at construction and the
        // lifetime is tied to the region mapping.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}
