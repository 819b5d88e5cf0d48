use std::sync::Arc;

use bytes::BytesMut;
use ethmsg_core::{
    ControlPlane, ControlRequest, ControlResponse, EventStatus, MemoryPinner, Opcode, StatusCode,
    TrackedMemory, Transport, TransportConfig,
};
use ethmsg_link::{Link, LoopbackFabric, MacAddr, NetInterface};
use ethmsg_wire::ConnAttribute;

const CLIENT: MacAddr = MacAddr::new([2, 0, 0, 0, 0, 0x11]);
const SERVER: MacAddr = MacAddr::new([2, 0, 0, 0, 0, 0x22]);

fn setup() -> ControlPlane {
    let fabric = LoopbackFabric::new();
    let transport = Transport::with_pinner(
        TransportConfig::default(),
        Arc::new(TrackedMemory::new()) as Arc<dyn MemoryPinner>,
    );
    for (name, mac) in [("c0", CLIENT), ("s0", SERVER)] {
        let link: Arc<dyn Link> = Arc::new(fabric.attach(mac, 1500).expect("attach"));
        transport
            .add_interface(Arc::new(NetInterface::new(name, link)))
            .expect("add interface");
    }
    ControlPlane::new(Arc::new(transport))
}

fn call(plane: &ControlPlane, request: ControlRequest) -> ControlResponse {
    let mut buf = BytesMut::new();
    request.encode(&mut buf);
    ControlResponse::decode(&plane.handle(&buf)).expect("response should decode")
}

fn ok(plane: &ControlPlane, request: ControlRequest) -> ControlResponse {
    let opcode = request.opcode;
    let response = call(plane, request);
    assert_eq!(response.status, StatusCode::Ok, "{opcode:?} failed");
    response
}

#[test]
fn full_exchange_over_control_requests() {
    let plane = setup();
    let client = ok(&plane, ControlRequest::new(Opcode::CreateEndpoint, 0).with_mac(CLIENT)).values[0] as u32;
    let server = ok(&plane, ControlRequest::new(Opcode::CreateEndpoint, 0).with_mac(SERVER)).values[0] as u32;

    let conn = ok(
        &plane,
        ControlRequest::new(Opcode::Connect, client)
            .with_mac(SERVER)
            .with_arg(0, u64::from(server))
            .with_flags(ConnAttribute::ReliableUnordered as u32)
            .with_context(0xfeed)
            .with_data(*b"hi there"),
    )
    .values[0];
    plane.transport().poll();

    let request = ok(&plane, ControlRequest::new(Opcode::GetEvent, server))
        .event
        .expect("connect request record");
    assert_eq!(request.event_type, 3);
    assert_eq!(request.payload, b"hi there");
    assert_eq!(request.peer_mac, CLIENT);
    assert_eq!(request.peer_endpoint, client);
    assert_eq!(request.attribute, ConnAttribute::ReliableUnordered as u32);

    // An unanswered request cannot be returned.
    let early = call(
        &plane,
        ControlRequest::new(Opcode::ReturnEvent, server).with_arg(0, request.event_id),
    );
    assert_eq!(early.status, StatusCode::InvalidState);

    ok(
        &plane,
        ControlRequest::new(Opcode::Accept, server)
            .with_arg(0, u64::from(request.connection))
            .with_context(5),
    );
    ok(
        &plane,
        ControlRequest::new(Opcode::ReturnEvent, server).with_arg(0, request.event_id),
    );
    let again = call(
        &plane,
        ControlRequest::new(Opcode::Accept, server).with_arg(0, u64::from(request.connection)),
    );
    assert_eq!(again.status, StatusCode::InvalidState);

    plane.transport().poll();
    let completed = ok(&plane, ControlRequest::new(Opcode::GetEvent, client))
        .event
        .expect("connect completion record");
    assert_eq!(completed.event_type, 4);
    assert_eq!(completed.status, EventStatus::Success.code());
    assert_eq!(completed.context, 0xfeed);
    assert_eq!(u64::from(completed.connection), conn);

    ok(
        &plane,
        ControlRequest::new(Opcode::Send, client)
            .with_arg(0, conn)
            .with_context(1)
            .with_data(vec![0xab; 100]),
    );
    plane.transport().poll();

    let accept_done = ok(&plane, ControlRequest::new(Opcode::GetEvent, server))
        .event
        .expect("accept completion");
    assert_eq!(accept_done.event_type, 5);
    assert_eq!(accept_done.context, 5);
    let message = ok(&plane, ControlRequest::new(Opcode::GetEvent, server))
        .event
        .expect("message");
    assert_eq!(message.event_type, 2);
    assert_eq!(message.payload, vec![0xab; 100]);

    ok(
        &plane,
        ControlRequest::new(Opcode::Disconnect, client).with_arg(0, conn),
    );
    plane.transport().poll();
    let closed = ok(&plane, ControlRequest::new(Opcode::GetEvent, server))
        .event
        .expect("closed");
    assert_eq!(closed.event_type, 6);

    ok(&plane, ControlRequest::new(Opcode::DestroyEndpoint, client));
    ok(&plane, ControlRequest::new(Opcode::DestroyEndpoint, server));
}

#[test]
fn reject_over_control_requests() {
    let plane = setup();
    let client = ok(&plane, ControlRequest::new(Opcode::CreateEndpoint, 0).with_mac(CLIENT)).values[0] as u32;
    let server = ok(&plane, ControlRequest::new(Opcode::CreateEndpoint, 0).with_mac(SERVER)).values[0] as u32;

    ok(
        &plane,
        ControlRequest::new(Opcode::Connect, client)
            .with_mac(SERVER)
            .with_arg(0, u64::from(server))
            .with_context(77),
    );
    plane.transport().poll();
    let request = ok(&plane, ControlRequest::new(Opcode::GetEvent, server))
        .event
        .expect("request");
    ok(
        &plane,
        ControlRequest::new(Opcode::Reject, server).with_arg(0, u64::from(request.connection)),
    );
    plane.transport().poll();

    let failed = ok(&plane, ControlRequest::new(Opcode::GetEvent, client))
        .event
        .expect("completion");
    assert_eq!(failed.status, EventStatus::Rejected.code());
    assert_eq!(failed.context, 77);
    assert_eq!(failed.connection, ethmsg_core::control::NO_CONNECTION);

    let empty = call(&plane, ControlRequest::new(Opcode::GetEvent, client));
    assert_eq!(empty.status, StatusCode::Again);
}

#[test]
fn bad_attribute_and_unknown_device() {
    let plane = setup();
    let client = ok(&plane, ControlRequest::new(Opcode::CreateEndpoint, 0).with_mac(CLIENT)).values[0] as u32;
    let resp = call(
        &plane,
        ControlRequest::new(Opcode::Connect, client)
            .with_mac(SERVER)
            .with_flags(9),
    );
    assert_eq!(resp.status, StatusCode::InvalidArgument);

    let resp = call(
        &plane,
        ControlRequest::new(Opcode::CreateEndpoint, 0).with_mac(MacAddr::new([2, 2, 2, 2, 2, 2])),
    );
    assert_eq!(resp.status, StatusCode::NoDevice);
}

#[test]
fn queued_record_never_names_a_later_connection() {
    let plane = setup();
    let client = ok(&plane, ControlRequest::new(Opcode::CreateEndpoint, 0).with_mac(CLIENT)).values[0] as u32;
    let server = ok(&plane, ControlRequest::new(Opcode::CreateEndpoint, 0).with_mac(SERVER)).values[0] as u32;
    let connect = || {
        ok(
            &plane,
            ControlRequest::new(Opcode::Connect, client)
                .with_mac(SERVER)
                .with_arg(0, u64::from(server)),
        )
        .values[0]
    };

    let conn = connect();
    plane.transport().poll();
    let request = ok(&plane, ControlRequest::new(Opcode::GetEvent, server))
        .event
        .expect("first request");
    let old = request.connection;
    ok(
        &plane,
        ControlRequest::new(Opcode::Accept, server).with_arg(0, u64::from(old)),
    );
    plane.transport().poll();
    ok(&plane, ControlRequest::new(Opcode::GetEvent, client));
    ok(
        &plane,
        ControlRequest::new(Opcode::Send, client)
            .with_arg(0, conn)
            .with_data(*b"for the old one"),
    );
    plane.transport().poll();
    let accepted = ok(&plane, ControlRequest::new(Opcode::GetEvent, server))
        .event
        .expect("accept completion");
    assert_eq!(accepted.event_type, 5);

    // Drop the server side while its message record is still queued, then
    // let a new request take the freed slot.
    ok(
        &plane,
        ControlRequest::new(Opcode::Disconnect, server).with_arg(0, u64::from(old)),
    );
    connect();
    plane.transport().poll();

    let message = ok(&plane, ControlRequest::new(Opcode::GetEvent, server))
        .event
        .expect("queued message");
    assert_eq!(message.event_type, 2);
    assert_eq!(message.connection, old);
    let newer = ok(&plane, ControlRequest::new(Opcode::GetEvent, server))
        .event
        .expect("second request");
    assert_eq!(newer.event_type, 3);
    assert_eq!(
        ethmsg_core::handle::slot_index(newer.connection),
        ethmsg_core::handle::slot_index(old)
    );
    assert_ne!(newer.connection, old);

    let stale_send = call(
        &plane,
        ControlRequest::new(Opcode::Send, server)
            .with_arg(0, u64::from(message.connection))
            .with_data(*b"reply"),
    );
    assert_eq!(stale_send.status, StatusCode::NotFound);
    let stale_close = call(
        &plane,
        ControlRequest::new(Opcode::Disconnect, server).with_arg(0, u64::from(message.connection)),
    );
    assert_eq!(stale_close.status, StatusCode::NotFound);

    ok(
        &plane,
        ControlRequest::new(Opcode::Accept, server).with_arg(0, u64::from(newer.connection)),
    );
}
