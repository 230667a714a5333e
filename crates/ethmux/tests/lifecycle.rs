//! Session lifecycle: open, bind, start, stop, teardown.

mod common;

use std::sync::Arc;

use common::{connect, mux_with, BUFFER_SIZE};
use ethmux::{BufferHandle, Error, SessionState};
use ethmux_testkit::MockDevice;

#[test]
fn open_session_is_idle() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let client = connect(&mux, "idle");
    let diag = client.session.diagnostics().unwrap();
    assert_eq!(diag.state, SessionState::Idle);
    assert_eq!(device.start_count(), 0);
}

#[test]
fn start_requires_bound_buffer() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let session = mux.open_session("unbound").unwrap();
    assert!(matches!(session.start(), Err(Error::BadState)));
    assert_eq!(device.start_count(), 0);
}

#[test]
fn start_is_idempotent() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let client = connect(&mux, "twice");
    client.session.start().unwrap();
    client.session.start().unwrap();
    assert_eq!(device.start_count(), 1);
    assert_eq!(
        client.session.diagnostics().unwrap().state,
        SessionState::Running
    );
}

#[test]
fn hardware_starts_once_for_many_sessions() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");
    let b = connect(&mux, "b");
    a.session.start().unwrap();
    b.session.start().unwrap();
    assert_eq!(device.start_count(), 1);
    assert_eq!(device.stop_count(), 0);

    // Hardware stops only when the last active session stops.
    a.session.stop().unwrap();
    assert_eq!(device.stop_count(), 0);
    b.session.stop().unwrap();
    assert_eq!(device.stop_count(), 1);
}

#[test]
fn stop_is_repeatable_and_restartable() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let client = connect(&mux, "bounce");
    client.session.stop().unwrap();
    client.session.start().unwrap();
    client.session.stop().unwrap();
    client.session.stop().unwrap();
    assert_eq!(device.stop_count(), 1);

    client.session.start().unwrap();
    assert_eq!(device.start_count(), 2);
    assert_eq!(
        client.session.diagnostics().unwrap().state,
        SessionState::Running
    );
}

#[test]
fn binding_twice_fails() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let client = connect(&mux, "bound");
    let second = BufferHandle::allocate(BUFFER_SIZE).unwrap();
    assert!(matches!(
        client.session.bind_buffer(second),
        Err(Error::AlreadyBound)
    ));
}

#[test]
fn dma_device_pins_at_bind() {
    let device = Arc::new(MockDevice::new().with_dma());
    let mux = mux_with(&device);
    let client = connect(&mux, "dma");
    client.session.start().unwrap();
}

#[test]
fn broken_dma_pin_fails_bind_and_leaves_unbound() {
    let device = Arc::new(MockDevice::new().with_broken_dma());
    let mux = mux_with(&device);
    let session = mux.open_session("nodma").unwrap();
    let handle = BufferHandle::allocate(BUFFER_SIZE).unwrap();
    assert!(session.bind_buffer(handle).is_err());
    // The region did not count as bound; a working bind may follow.
    assert!(matches!(session.start(), Err(Error::BadState)));
}

#[test]
fn failed_device_start_surfaces_and_recovers() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let client = connect(&mux, "flaky");
    device.set_fail_start(true);
    assert!(matches!(client.session.start(), Err(Error::Device(_))));
    assert_eq!(
        client.session.diagnostics().unwrap().state,
        SessionState::Idle
    );

    device.set_fail_start(false);
    client.session.start().unwrap();
    assert_eq!(
        client.session.diagnostics().unwrap().state,
        SessionState::Running
    );
}

#[test]
fn teardown_stops_everything() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");
    let b = connect(&mux, "b");
    a.session.start().unwrap();
    b.session.start().unwrap();

    mux.teardown();
    assert_eq!(device.stop_count(), 1);
    assert!(matches!(a.session.start(), Err(Error::BadState)));
    assert!(matches!(b.session.status(), Err(Error::BadState)));
    assert!(matches!(
        mux.open_session("late"),
        Err(Error::BadState)
    ));
}

#[test]
fn cloned_handles_keep_session_alive() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let client = connect(&mux, "cloned");
    let extra = client.session.clone();
    client.session.start().unwrap();
    drop(client.session);
    // The clone still holds the session open.
    assert_eq!(extra.diagnostics().unwrap().state, SessionState::Running);
    drop(extra);
    assert!(mux.diagnostics().sessions.is_empty());
    assert_eq!(device.stop_count(), 1);
}
