//! Socketpair doorbell for cross-thread / cross-process wakeup.
//!
//! Each end of a SOCK_DGRAM socketpair is one doorbell: `signal()` sends a
//! one-byte datagram to the peer, `wait()` blocks in `poll(2)` until the
//! local end becomes readable and drains it. Signals coalesce — a full
//! socket buffer means the peer is already signaled, so the send result is
//! ignored on `EAGAIN`.
//!
//! The drain thread of a session waits on two doorbells at once (ring
//! readable, shutdown) via [`wait_any`].

use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// One end of a doorbell pair.
pub struct Doorbell {
    fd: OwnedFd,
}

impl Doorbell {
    /// Create a connected pair. Signaling either end wakes the other.
    pub fn pair() -> io::Result<(Doorbell, Doorbell)> {
        let mut fds = [0i32; 2];
        // SOCK_DGRAM keeps each signal a discrete message; non-blocking so
        // signal() and drain() never stall.
        // SAFETY: fds points at two writable ints; checked below.
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: socketpair succeeded, both fds are valid and unowned.
        let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        Ok((Doorbell { fd: a }, Doorbell { fd: b }))
    }

    /// Wake the peer. Never blocks; a full buffer means the peer is already
    /// signaled.
    pub fn signal(&self) {
        let buf = [1u8];
        // SAFETY: fd is valid, buf is a valid one-byte buffer.
        let rc = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::WouldBlock {
                tracing::warn!("doorbell signal failed: {err}");
            }
        }
    }

    /// Drain all pending signals without blocking. Returns true if at least
    /// one signal was consumed.
    pub fn drain(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut drained = false;
        loop {
            // SAFETY: fd is valid, buf is a valid buffer.
            let rc = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if rc > 0 {
                drained = true;
            } else if rc == 0 {
                break;
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != ErrorKind::WouldBlock {
                    tracing::warn!("doorbell drain failed: {err}");
                }
                break;
            }
        }
        drained
    }

    /// Block until signaled or `timeout` elapses. Returns true if a signal
    /// arrived (and was drained), false on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        match wait_any(&[self], timeout)? {
            Some(0) => Ok(true),
            _ => Ok(false),
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Block until one of `doorbells` is signaled or `timeout` elapses.
///
/// Returns the index of the first signaled doorbell (drained before
/// returning), or `None` on timeout. `EINTR` is retried.
pub fn wait_any(doorbells: &[&Doorbell], timeout: Option<Duration>) -> io::Result<Option<usize>> {
    let mut fds: Vec<libc::pollfd> = doorbells
        .iter()
        .map(|db| libc::pollfd {
            fd: db.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = match timeout {
        Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
        None => -1,
    };
    loop {
        // SAFETY: fds is a valid array of initialized pollfds.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(None);
        }
        for (i, pfd) in fds.iter().enumerate() {
            if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                doorbells[i].drain();
                return Ok(Some(i));
            }
        }
        // poll claimed readiness but nothing matched; retry.
    }
}
