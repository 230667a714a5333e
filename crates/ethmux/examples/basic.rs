//! Basic example walking the whole multiplexer data path.
//!
//! This example shows:
//! - Binding a `Mux` to a device (the testkit's `MockDevice` stands in for
//!   real hardware)
//! - Opening a session, binding its shared buffer, starting it
//! - Posting receive buffers and collecting a delivered frame
//! - Transmitting a frame and collecting its completion
//!
//! Run with: `cargo run --example basic -p ethmux`

use std::sync::Arc;
use std::time::Duration;

use ethmux::{BufferHandle, DescFlags, FrameDesc, Mux, NetDevice, SharedRegion};
use ethmux_testkit::MockDevice;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    // Stand-in hardware; a real deployment implements `NetDevice` over the
    // actual driver surface.
    let device = Arc::new(MockDevice::new());
    let mux = Mux::new(Arc::clone(&device) as Arc<dyn NetDevice>);
    println!("device: {:?}", mux.info());

    // Open a session and wire up its shared memory.
    let session = mux.open_session("example")?;
    let fifos = session.take_fifos().expect("fifos taken once");
    let handle = BufferHandle::allocate(64 * 1024)?;
    let buffer = SharedRegion::map(handle.try_clone()?)?;
    session.bind_buffer(handle)?;
    session.start()?;
    println!("link status: {:?}", session.status()?);

    // Receive: post an empty buffer, let the "hardware" deliver a frame.
    fifos.rx.write(&[FrameDesc::new(0, 2048, 1)])?;
    device.deliver_receive(b"hello from the wire");

    let mut out = [FrameDesc::zeroed(); 8];
    let n = fifos.rx.read_blocking(&mut out, Duration::from_secs(1))?;
    assert_eq!(n, 1);
    let mut frame = vec![0u8; out[0].length as usize];
    buffer.span(out[0].offset, out[0].length)?.copy_to(&mut frame);
    println!(
        "received {} bytes (flags {:?}): {:?}",
        out[0].length,
        out[0].desc_flags(),
        String::from_utf8_lossy(&frame)
    );

    // Transmit: write a frame into the buffer, post its descriptor, wait
    // for the completion to come back with the cookie untouched.
    buffer.span(4096, 18)?.copy_from(b"hello to the wire!");
    fifos.tx.write(&[FrameDesc::new(4096, 18, 42)])?;
    let n = fifos.tx.read_blocking(&mut out, Duration::from_secs(1))?;
    assert_eq!(n, 1);
    assert!(out[0].desc_flags().contains(DescFlags::TX_OK));
    println!("transmit completed, cookie {}", out[0].cookie);
    println!(
        "device captured: {:?}",
        device
            .transmits()
            .iter()
            .map(|t| String::from_utf8_lossy(&t.bytes).into_owned())
            .collect::<Vec<_>>()
    );

    println!("\ndiagnostics: {:#?}", mux.diagnostics());

    session.stop()?;
    mux.teardown();
    println!("done");
    Ok(())
}
