//! Shared setup for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ethmux::{BufferHandle, Mux, Session, SessionFifos, SharedRegion};
use ethmux_testkit::MockDevice;

pub const BUFFER_SIZE: usize = 64 * 1024;
pub const WAIT: Duration = Duration::from_secs(2);

/// One connected client: the session handle, its fifo endpoints, and the
/// client's own mapping of the shared buffer.
pub struct Client {
    pub session: Session,
    pub fifos: SessionFifos,
    pub buffer: SharedRegion,
}

/// Open a session with a bound buffer, not yet started.
pub fn connect(mux: &Arc<Mux>, name: &str) -> Client {
    let session = mux.open_session(name).unwrap();
    let fifos = session.take_fifos().unwrap();
    let handle = BufferHandle::allocate(BUFFER_SIZE).unwrap();
    let buffer = SharedRegion::map(handle.try_clone().unwrap()).unwrap();
    session.bind_buffer(handle).unwrap();
    Client {
        session,
        fifos,
        buffer,
    }
}

pub fn mux_with(device: &Arc<MockDevice>) -> Arc<Mux> {
    Mux::new(Arc::clone(device) as Arc<dyn ethmux::NetDevice>)
}
