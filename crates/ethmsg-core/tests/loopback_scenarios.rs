use std::sync::Arc;
use std::time::Duration;

use ethmsg_core::{
    ConnectionState, CoreError, EventKind, EventStatus, MemoryPinner, Protection, TrackedMemory,
    Transport, TransportConfig,
};
use ethmsg_link::{Link, LoopbackFabric, LoopbackLink, MacAddr, NetInterface};
use ethmsg_wire::ConnAttribute;

const MAC_A: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
const MAC_B: MacAddr = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);

struct Harness {
    transport: Arc<Transport>,
    memory: Arc<TrackedMemory>,
    links: Vec<Arc<LoopbackLink>>,
}

fn harness() -> Harness {
    let fabric = LoopbackFabric::new();
    let memory = Arc::new(TrackedMemory::new());
    let transport = Arc::new(Transport::with_pinner(
        TransportConfig::default(),
        Arc::clone(&memory) as Arc<dyn MemoryPinner>,
    ));
    let mut links = Vec::new();
    for (name, mac) in [("veth-a", MAC_A), ("veth-b", MAC_B)] {
        let link = Arc::new(fabric.attach(mac, 1500).expect("attach should succeed"));
        transport
            .add_interface(Arc::new(NetInterface::new(
                name,
                Arc::clone(&link) as Arc<dyn Link>,
            )))
            .expect("interface should register");
        links.push(link);
    }
    Harness {
        transport,
        memory,
        links,
    }
}

#[test]
fn connect_exchange_and_disconnect() {
    let h = harness();
    let a = h.transport.create_endpoint(MAC_A).unwrap();
    let b = h.transport.create_endpoint(MAC_B).unwrap();
    assert_ne!(a.id(), b.id());

    let locator = b.locator().to_string();
    let conn = h
        .transport
        .connect(a.id(), &locator, ConnAttribute::ReliableOrdered, b"hello", 42, None)
        .expect("connect should be sent");
    assert_eq!(conn.state(), ConnectionState::Requesting);

    h.transport.poll();
    let request = b.get_next_event().expect("request should arrive");
    assert_eq!(request.kind().payload(), b"hello");
    let accepted = b.accept_request(&request, 7).unwrap();
    b.acknowledge(request.id()).unwrap();

    h.transport.poll();
    let completed = a.get_next_event().expect("connect should complete");
    match completed.kind() {
        EventKind::ConnectCompleted {
            status, context, ..
        } => {
            assert_eq!(*status, EventStatus::Success);
            assert_eq!(*context, 42);
        }
        other => panic!("unexpected event {}", other.name()),
    }
    assert!(a.get_next_event().is_none(), "exactly one completion");

    for i in 0..3u8 {
        a.send(conn.id(), vec![i; 16], u64::from(i)).unwrap();
    }
    h.transport.poll();
    assert!(matches!(
        b.get_next_event().unwrap().kind(),
        EventKind::AcceptCompleted { .. }
    ));
    for i in 0..3u8 {
        let event = b.get_next_event().unwrap();
        assert_eq!(event.kind().payload(), &[i; 16][..]);
        assert!(Arc::ptr_eq(event.kind().connection().unwrap(), &accepted));
    }

    a.disconnect(conn.id()).unwrap();
    h.transport.poll();
    assert!(matches!(
        b.get_next_event().unwrap().kind(),
        EventKind::ConnectionClosed { .. }
    ));
    assert!(b.send(accepted.id(), &b"late"[..], 0).is_err());
}

#[test]
fn events_arrive_in_production_order() {
    let h = harness();
    let a = h.transport.create_endpoint(MAC_A).unwrap();
    let b = h.transport.create_endpoint(MAC_B).unwrap();
    let conn = a
        .connect(b.locator().into(), ConnAttribute::UnreliableUnordered, b"", 0, None)
        .unwrap();
    h.transport.poll();
    let request = b.get_next_event().unwrap();
    b.accept_request(&request, 0).unwrap();
    h.transport.poll();
    a.get_next_event().unwrap();

    for context in 1..=3 {
        a.send(conn.id(), &b"x"[..], context).unwrap();
    }
    let contexts: Vec<u64> = std::iter::from_fn(|| a.get_next_event())
        .map(|event| event.kind().context())
        .collect();
    assert_eq!(contexts, [1, 2, 3]);
}

#[test]
fn second_reject_fails_and_sends_nothing() {
    let h = harness();
    let a = h.transport.create_endpoint(MAC_A).unwrap();
    let b = h.transport.create_endpoint(MAC_B).unwrap();
    a.connect(b.locator().into(), ConnAttribute::ReliableOrdered, b"", 0, None)
        .unwrap();
    h.transport.poll();
    let request = b.get_next_event().unwrap();
    let connection = request.kind().connection().unwrap().id();

    let before = h.links[1].frames_sent();
    b.reject(connection).unwrap();
    assert!(matches!(
        b.reject(connection),
        Err(CoreError::ConnectionNotFound(_))
    ));
    assert!(b.reject_request(&request).is_err());
    assert_eq!(h.links[1].frames_sent(), before + 1);

    h.transport.poll();
    let failed = a.get_next_event().unwrap();
    assert_eq!(failed.kind().status(), EventStatus::Rejected);
    assert!(a.get_next_event().is_none());
}

#[test]
fn region_crossing_pages_registers_once() {
    let h = harness();
    let a = h.transport.create_endpoint(MAC_A).unwrap();
    let base = 0x7f00_0000_usize;
    h.memory.map(base, 0x10_000, true);

    let address = base + 0x0800;
    let id = a
        .register_region(address, 10_000, Protection::ReadWrite)
        .expect("register should succeed");
    let region = a.region(id).unwrap();
    assert_eq!(region.first_page_offset(), 0x0800);
    assert_eq!(region.page_count(), 3);
    assert_eq!(h.memory.pin_count(base), 1);
    drop(region);

    a.deregister_region(id).expect("first deregister should succeed");
    assert!(matches!(
        a.deregister_region(id),
        Err(CoreError::RegionNotFound(r)) if r == id
    ));
    assert_eq!(h.memory.total_pins(), 0);
    assert!(h.memory.is_dirty(base));
}

#[test]
fn locator_parse_gates_connect() {
    let h = harness();
    let a = h.transport.create_endpoint(MAC_A).unwrap();

    h.transport
        .connect(
            a.id(),
            "eth://aa:bb:cc:dd:ee:ff:00000003",
            ConnAttribute::ReliableOrdered,
            b"",
            0,
            None,
        )
        .expect("well-formed locator should be accepted");
    let sent = h.links[0].frames_sent();
    assert_eq!(sent, 1);

    let err = h
        .transport
        .connect(
            a.id(),
            "eth://zz:bb:cc:dd:ee:ff",
            ConnAttribute::ReliableOrdered,
            b"",
            0,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::Wire(_)));
    assert_eq!(h.links[0].frames_sent(), sent);
}

#[test]
fn unanswered_connect_times_out() {
    let h = harness();
    let a = h.transport.create_endpoint(MAC_A).unwrap();
    let ghost = ethmsg_core::PeerAddr::new(MAC_B, 77);
    let conn = a
        .connect(
            ghost,
            ConnAttribute::ReliableOrdered,
            b"",
            9,
            Some(Duration::from_millis(10)),
        )
        .unwrap();

    assert!(a.wait_event(Some(Duration::from_secs(5))));
    let event = a.get_next_event().unwrap();
    assert!(matches!(
        event.kind(),
        EventKind::ConnectCompleted {
            status: EventStatus::TimedOut,
            context: 9,
            connection: None
        }
    ));
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert!(a.connection(conn.id()).is_none());
}

#[test]
fn closing_endpoint_releases_everything() {
    let h = harness();
    let a = h.transport.create_endpoint(MAC_A).unwrap();
    let b = h.transport.create_endpoint(MAC_B).unwrap();
    h.memory.map(0x1000_0000, 0x4000, false);
    a.register_region(0x1000_0000, 0x4000, Protection::ReadOnly)
        .unwrap();
    let conn = a
        .connect(b.locator().into(), ConnAttribute::ReliableOrdered, b"", 0, None)
        .unwrap();
    h.transport.poll();
    let request = b.get_next_event().unwrap();
    b.accept_request(&request, 0).unwrap();
    h.transport.poll();

    h.transport.close_endpoint(a.id()).unwrap();
    assert_eq!(h.memory.total_pins(), 0);
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(a.get_next_event().is_none());
    assert!(matches!(
        h.transport.endpoint(a.id()),
        Err(CoreError::EndpointNotFound(_))
    ));

    h.transport.poll();
    let mut kinds = Vec::new();
    while let Some(event) = b.get_next_event() {
        kinds.push(event.kind().name());
    }
    assert_eq!(kinds, ["accept-completed", "connection-closed"]);
}

#[test]
fn registration_racing_endpoint_close_releases_pins() {
    let h = harness();
    h.memory.map(0x10_0000, 4 << 20, true);
    for _ in 0..200 {
        let endpoint = h.transport.create_endpoint(MAC_A).unwrap();
        let start = std::sync::Barrier::new(2);
        std::thread::scope(|s| {
            s.spawn(|| {
                start.wait();
                let _ = endpoint.register_region(0x10_0000, 4 << 20, Protection::ReadWrite);
            });
            start.wait();
            h.transport.close_endpoint(endpoint.id()).unwrap();
        });
        assert_eq!(endpoint.region_count(), 0);
        assert_eq!(h.memory.total_pins(), 0, "a registration outlived its endpoint");
    }
}
