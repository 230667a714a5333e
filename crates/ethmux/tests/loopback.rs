//! Transmit loopback: echoes fan out to listening sessions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect, mux_with, WAIT};
use ethmux::{DescFlags, FrameDesc};
use ethmux_testkit::{wait_until, MockDevice};

#[test]
fn loopback_transmit_echoes_to_listeners() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "talker");
    let b = connect(&mux, "listener");
    a.session.start().unwrap();
    b.session.start().unwrap();

    a.session.listen_start(true).unwrap();
    b.session.listen_start(false).unwrap();

    // Both listeners post receive buffers for the echo.
    a.fifos.rx.write(&[FrameDesc::new(0, 2048, 10)]).unwrap();
    b.fifos.rx.write(&[FrameDesc::new(0, 2048, 20)]).unwrap();

    a.buffer.span(512, 16).unwrap().copy_from(b"ethmux loopback!");
    a.fifos.tx.write(&[FrameDesc::new(512, 16, 1)]).unwrap();

    // The frame reaches the device...
    assert!(wait_until(WAIT, || device.transmits().len() == 1));

    // ...and both listening sessions get the echo, flagged as such.
    let mut out = [FrameDesc::zeroed(); 8];
    let n = b.fifos.rx.read_blocking(&mut out, WAIT).unwrap();
    assert_eq!(n, 1);
    assert_eq!(out[0].cookie, 20);
    assert_eq!(out[0].length, 16);
    assert_eq!(out[0].desc_flags(), DescFlags::RX_OK | DescFlags::ECHO);
    let mut bytes = [0u8; 16];
    b.buffer.span(0, 16).unwrap().copy_to(&mut bytes);
    assert_eq!(&bytes, b"ethmux loopback!");

    let n = a.fifos.rx.read_blocking(&mut out, WAIT).unwrap();
    assert_eq!(n, 1);
    assert!(out[0].desc_flags().contains(DescFlags::ECHO));
}

#[test]
fn no_echo_without_loopback_flag() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "talker");
    let b = connect(&mux, "listener");
    a.session.start().unwrap();
    b.session.start().unwrap();
    b.session.listen_start(false).unwrap();
    b.fifos.rx.write(&[FrameDesc::new(0, 2048, 1)]).unwrap();

    a.fifos.tx.write(&[FrameDesc::new(0, 16, 1)]).unwrap();
    assert!(wait_until(WAIT, || device.transmits().len() == 1));

    let mut out = [FrameDesc::zeroed(); 8];
    assert_eq!(
        b.fifos
            .rx
            .read_blocking(&mut out, Duration::from_millis(100))
            .unwrap(),
        0
    );
}

#[test]
fn listen_stop_ends_echoes() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "talker");
    let b = connect(&mux, "listener");
    a.session.start().unwrap();
    b.session.start().unwrap();
    a.session.listen_start(true).unwrap();
    b.session.listen_start(false).unwrap();
    b.session.listen_stop().unwrap();
    b.fifos.rx.write(&[FrameDesc::new(0, 2048, 1)]).unwrap();

    a.fifos.tx.write(&[FrameDesc::new(0, 16, 1)]).unwrap();
    assert!(wait_until(WAIT, || device.transmits().len() == 1));

    let mut out = [FrameDesc::zeroed(); 8];
    assert_eq!(
        b.fifos
            .rx
            .read_blocking(&mut out, Duration::from_millis(100))
            .unwrap(),
        0
    );
}
