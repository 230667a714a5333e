//! Filter aggregation: promiscuous refcounting and the multicast union.

mod common;

use std::sync::Arc;

use common::{connect, mux_with};
use ethmux::{Error, MacAddr, Param, MULTICAST_MAX_PER_SESSION};
use ethmux_testkit::{multicast_addr, unicast_addr, MockDevice};

fn promisc_calls(device: &MockDevice, enabled: bool) -> usize {
    device.count_params(|p| *p == Param::Promiscuous(enabled))
}

#[test]
fn promiscuous_aggregates_by_refcount() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");
    let b = connect(&mux, "b");

    a.session.set_promiscuous(true).unwrap();
    assert_eq!(promisc_calls(&device, true), 1);
    b.session.set_promiscuous(true).unwrap();
    // Second requester: no extra hardware call.
    assert_eq!(promisc_calls(&device, true), 1);

    a.session.set_promiscuous(false).unwrap();
    assert_eq!(promisc_calls(&device, false), 0);
    b.session.set_promiscuous(false).unwrap();
    // Last requester gone: exactly one disable call.
    assert_eq!(promisc_calls(&device, false), 1);
}

#[test]
fn promiscuous_enable_is_idempotent_per_session() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");
    a.session.set_promiscuous(true).unwrap();
    a.session.set_promiscuous(true).unwrap();
    assert_eq!(promisc_calls(&device, true), 1);
    assert_eq!(mux.diagnostics().promiscuous_requests, 1);
}

#[test]
fn promiscuous_failure_rolls_back() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");

    device.set_fail_params(true);
    assert!(matches!(
        a.session.set_promiscuous(true),
        Err(Error::Device(_))
    ));
    assert_eq!(mux.diagnostics().promiscuous_requests, 0);

    // Fully transactional: the request can be retried cleanly.
    device.set_fail_params(false);
    a.session.set_promiscuous(true).unwrap();
    assert_eq!(mux.diagnostics().promiscuous_requests, 1);
}

#[test]
fn multicast_promiscuous_aggregates_independently() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");
    let b = connect(&mux, "b");

    a.session.set_multicast_promiscuous(true).unwrap();
    b.session.set_multicast_promiscuous(true).unwrap();
    assert_eq!(
        device.count_params(|p| *p == Param::MulticastPromiscuous(true)),
        1
    );
    assert_eq!(promisc_calls(&device, true), 0);
}

#[test]
fn unicast_add_is_rejected_without_mutation() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");

    assert!(matches!(
        a.session.add_multicast(unicast_addr(1)),
        Err(Error::InvalidArgs(_))
    ));
    let diag = a.session.diagnostics().unwrap();
    assert_eq!(diag.multicast_addresses, 0);
}

#[test]
fn union_of_two_sessions_reaches_hardware() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");
    let b = connect(&mux, "b");
    a.session.start().unwrap();
    b.session.start().unwrap();

    let addr_a = MacAddr([0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);
    let addr_b = MacAddr([0x07, 0x00, 0x00, 0x00, 0x00, 0x02]);
    a.session.add_multicast(addr_a).unwrap();
    b.session.add_multicast(addr_b).unwrap();

    match device.last_param() {
        Some(Param::MulticastFilter(list)) => {
            assert_eq!(list.len(), 2);
            assert!(list.contains(&addr_a));
            assert!(list.contains(&addr_b));
        }
        other => panic!("expected multicast filter push, got {other:?}"),
    }
}

#[test]
fn duplicate_addresses_deduplicate_across_sessions() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");
    let b = connect(&mux, "b");
    a.session.start().unwrap();
    b.session.start().unwrap();

    a.session.add_multicast(multicast_addr(1)).unwrap();
    b.session.add_multicast(multicast_addr(1)).unwrap();
    match device.last_param() {
        Some(Param::MulticastFilter(list)) => assert_eq!(list, vec![multicast_addr(1)]),
        other => panic!("expected multicast filter push, got {other:?}"),
    }
}

#[test]
fn removal_triggers_full_rebuild() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");
    a.session.start().unwrap();

    a.session.add_multicast(multicast_addr(1)).unwrap();
    a.session.add_multicast(multicast_addr(2)).unwrap();
    a.session.remove_multicast(multicast_addr(1)).unwrap();

    match device.last_param() {
        Some(Param::MulticastFilter(list)) => assert_eq!(list, vec![multicast_addr(2)]),
        other => panic!("expected multicast filter push, got {other:?}"),
    }
}

#[test]
fn removing_untracked_address_succeeds() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");
    a.session.start().unwrap();

    a.session.add_multicast(multicast_addr(1)).unwrap();
    a.session.remove_multicast(multicast_addr(42)).unwrap();
    assert_eq!(a.session.diagnostics().unwrap().multicast_addresses, 1);
}

#[test]
fn session_overflow_pushes_overflow_param_until_it_clears() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");
    a.session.start().unwrap();

    for i in 0..MULTICAST_MAX_PER_SESSION {
        a.session.add_multicast(multicast_addr(i as u8)).unwrap();
    }
    assert!(matches!(
        device.last_param(),
        Some(Param::MulticastFilter(_))
    ));

    a.session.add_multicast(multicast_addr(200)).unwrap();
    assert_eq!(device.last_param(), Some(Param::MulticastFilterOverflow));

    // Overflow is sticky until the count drops back under capacity.
    a.session.remove_multicast(multicast_addr(201)).unwrap();
    match device.last_param() {
        Some(Param::MulticastFilter(list)) => {
            assert_eq!(list.len(), MULTICAST_MAX_PER_SESSION)
        }
        other => panic!("expected multicast filter push, got {other:?}"),
    }
}

#[test]
fn device_wide_capacity_overflows_across_sessions() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");
    let b = connect(&mux, "b");
    let c = connect(&mux, "c");
    a.session.start().unwrap();
    b.session.start().unwrap();
    c.session.start().unwrap();

    // 32 + 32 distinct addresses fill the device-wide capacity of 64.
    for i in 0..32 {
        a.session.add_multicast(multicast_addr(i)).unwrap();
        b.session.add_multicast(multicast_addr(100 + i)).unwrap();
    }
    assert!(matches!(
        device.last_param(),
        Some(Param::MulticastFilter(_))
    ));

    // The 65th unique address tips the union over.
    c.session.add_multicast(multicast_addr(200)).unwrap();
    assert_eq!(device.last_param(), Some(Param::MulticastFilterOverflow));

    c.session.remove_multicast(multicast_addr(200)).unwrap();
    assert!(matches!(
        device.last_param(),
        Some(Param::MulticastFilter(_))
    ));
}

#[test]
fn stop_unwinds_filter_contributions() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");
    let b = connect(&mux, "b");
    a.session.start().unwrap();
    b.session.start().unwrap();

    a.session.set_promiscuous(true).unwrap();
    a.session.add_multicast(multicast_addr(1)).unwrap();
    b.session.add_multicast(multicast_addr(2)).unwrap();

    a.session.stop().unwrap();
    // Promiscuous contribution released on the 1 -> 0 transition.
    assert_eq!(promisc_calls(&device, false), 1);
    // Union rebuilt without A's address.
    match device.last_param() {
        Some(Param::MulticastFilter(list)) => assert_eq!(list, vec![multicast_addr(2)]),
        other => panic!("expected multicast filter push, got {other:?}"),
    }
}

#[test]
fn idle_session_addresses_join_union_at_start() {
    let device = Arc::new(MockDevice::new());
    let mux = mux_with(&device);
    let a = connect(&mux, "a");

    a.session.add_multicast(multicast_addr(5)).unwrap();
    // Not active yet: no filter push happened.
    assert_eq!(device.count_params(|p| matches!(p, Param::MulticastFilter(_))), 0);

    a.session.start().unwrap();
    match device.last_param() {
        Some(Param::MulticastFilter(list)) => assert_eq!(list, vec![multicast_addr(5)]),
        other => panic!("expected multicast filter push, got {other:?}"),
    }
}
