use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use ethmsg_core::{
    Endpoint, Event, EventKind, EventStatus, MemoryPinner, Protection, TrackedMemory, Transport,
    TransportConfig,
};
use ethmsg_link::{Link, LoopbackFabric, MacAddr, NetInterface};
use ethmsg_wire::ConnAttribute;

use crate::cmd::DemoArgs;
use crate::exit::{core_error, link_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{or_unknown, payload_preview, print_json, print_table, OutputFormat};

const CLIENT_MAC: MacAddr = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
const SERVER_MAC: MacAddr = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
const CONNECT_CONTEXT: u64 = 0xc0;
const ACCEPT_CONTEXT: u64 = 0xac;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct EventRow {
    step: usize,
    endpoint: &'static str,
    event: &'static str,
    status: &'static str,
    context: u64,
    connection: Option<u32>,
    payload_len: usize,
    payload: String,
}

#[derive(Debug, Serialize)]
struct RegionRow {
    id: u32,
    length: usize,
    pages: usize,
    pinned_while_registered: usize,
    pinned_after_deregister: usize,
}

#[derive(Debug, Serialize)]
struct DemoOutput {
    server_locator: String,
    max_send_size: usize,
    accepted: bool,
    events: Vec<EventRow>,
    region: RegionRow,
    frames_sent: u64,
}

struct EventLog {
    rows: Vec<EventRow>,
}

impl EventLog {
    fn record(&mut self, endpoint: &'static str, event: &Event) {
        let kind = event.kind();
        self.rows.push(EventRow {
            step: self.rows.len() + 1,
            endpoint,
            event: kind.name(),
            status: status_name(kind.status()),
            context: kind.context(),
            connection: kind.connection().map(|c| c.id()),
            payload_len: kind.payload().len(),
            payload: payload_preview(kind.payload()),
        });
    }

    /// Drain every pending event of `endpoint`, acknowledging each after `handle` sees it.
    fn drain(
        &mut self,
        role: &'static str,
        endpoint: &Endpoint,
        mut handle: impl FnMut(&Event) -> CliResult<()>,
    ) -> CliResult<()> {
        while let Some(event) = endpoint.get_next_event() {
            self.record(role, &event);
            handle(&event)?;
            endpoint
                .acknowledge(event.id())
                .map_err(|e| core_error("acknowledge", e))?;
        }
        Ok(())
    }
}

fn status_name(status: EventStatus) -> &'static str {
    match status {
        EventStatus::Success => "success",
        EventStatus::Rejected => "rejected",
        EventStatus::TimedOut => "timed-out",
        EventStatus::Failed => "failed",
    }
}

pub fn run(args: DemoArgs, format: OutputFormat) -> CliResult<i32> {
    let fabric = LoopbackFabric::new();
    let memory = Arc::new(TrackedMemory::new());
    let config = TransportConfig::default()
        .with_allow_loopback(true)
        .with_default_connect_timeout(Some(CONNECT_TIMEOUT));
    let transport = Transport::with_pinner(config, Arc::clone(&memory) as Arc<dyn MemoryPinner>);

    let mut links = Vec::new();
    for (name, mac) in [("demo0", CLIENT_MAC), ("demo1", SERVER_MAC)] {
        let link = Arc::new(
            fabric
                .attach(mac, args.mtu)
                .map_err(|e| link_error("attach demo link", e))?,
        );
        let iface = NetInterface::new(name, Arc::clone(&link) as Arc<dyn Link>).with_loopback(true);
        transport
            .add_interface(Arc::new(iface))
            .map_err(|e| core_error("add interface", e))?;
        links.push(link);
    }

    let client = transport
        .create_endpoint(CLIENT_MAC)
        .map_err(|e| core_error("create client endpoint", e))?;
    let server = transport
        .create_endpoint(SERVER_MAC)
        .map_err(|e| core_error("create server endpoint", e))?;

    if args.size > client.max_send_size() {
        return Err(CliError::new(
            USAGE,
            format!(
                "--size {} exceeds the {} byte limit at MTU {}",
                args.size,
                client.max_send_size(),
                args.mtu
            ),
        ));
    }

    let mut log = EventLog { rows: Vec::new() };
    let server_locator = server.locator().to_string();
    let conn = transport
        .connect(
            client.id(),
            &server_locator,
            ConnAttribute::ReliableOrdered,
            b"hello",
            CONNECT_CONTEXT,
            None,
        )
        .map_err(|e| core_error("connect", e))?;
    tracing::info!(locator = %server_locator, connection = conn.id(), "connect sent");

    transport.poll();
    log.drain("server", &server, |event| {
        if !event.is_unanswered_request() {
            return Ok(());
        }
        if args.reject {
            server
                .reject_request(event)
                .map_err(|e| core_error("reject", e))
        } else {
            server
                .accept_request(event, ACCEPT_CONTEXT)
                .map(|_| ())
                .map_err(|e| core_error("accept", e))
        }
    })?;

    transport.poll();
    let mut accepted = false;
    log.drain("client", &client, |event| {
        if let EventKind::ConnectCompleted { status, .. } = event.kind() {
            accepted = status.is_success();
        }
        Ok(())
    })?;

    if accepted {
        for i in 0..args.messages {
            let payload = vec![b'a' + (i % 26) as u8; args.size];
            client
                .send(conn.id(), payload, i as u64)
                .map_err(|e| core_error("send", e))?;
        }
        transport.poll();
        log.drain("client", &client, |_| Ok(()))?;
        log.drain("server", &server, |_| Ok(()))?;
    }

    let region = register_demo_region(&server, &memory)?;

    if accepted {
        client
            .disconnect(conn.id())
            .map_err(|e| core_error("disconnect", e))?;
        transport.poll();
        log.drain("server", &server, |_| Ok(()))?;
    }

    let frames_sent = links.iter().map(|link| link.frames_sent()).sum();
    let output = DemoOutput {
        server_locator,
        max_send_size: client.max_send_size(),
        accepted,
        events: log.rows,
        region,
        frames_sent,
    };
    let closed = transport.shutdown();
    tracing::debug!(closed, "demo transport shut down");

    print_demo(&output, format);
    Ok(SUCCESS)
}

fn register_demo_region(server: &Endpoint, memory: &TrackedMemory) -> CliResult<RegionRow> {
    let page_size = memory.page_size();
    let buffer = vec![0u8; page_size * 3];
    // Start mid-page so the region straddles a page boundary.
    let address = buffer.as_ptr() as usize + page_size / 2;
    let length = page_size * 2;
    let first_page = address & !(page_size - 1);
    memory.map(first_page, address + length - first_page, true);

    let id = server
        .register_region(address, length, Protection::ReadWrite)
        .map_err(|e| core_error("register region", e))?;
    let pages = server.region(id).map(|r| r.page_count()).unwrap_or(0);
    let pinned_while_registered = memory.total_pins();
    server
        .deregister_region(id)
        .map_err(|e| core_error("deregister region", e))?;

    Ok(RegionRow {
        id,
        length,
        pages,
        pinned_while_registered,
        pinned_after_deregister: memory.total_pins(),
    })
}

fn print_demo(output: &DemoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table => print_table(
            &["Step", "Endpoint", "Event", "Status", "Context", "Connection", "Payload"],
            output.events.iter().map(|row| {
                vec![
                    row.step.to_string(),
                    row.endpoint.to_string(),
                    row.event.to_string(),
                    row.status.to_string(),
                    format!("{:#x}", row.context),
                    or_unknown(row.connection),
                    row.payload_len.to_string(),
                ]
            }),
        ),
        OutputFormat::Pretty => {
            println!("ethmsg demo: server at {}\n", output.server_locator);
            for row in &output.events {
                println!(
                    "  {:>3}. {:<6} {:<18} {:<9} {}",
                    row.step, row.endpoint, row.event, row.status, row.payload
                );
            }
            let region = &output.region;
            println!(
                "\n  region {}: {} bytes over {} pages, {} pins held, {} after deregister",
                region.id,
                region.length,
                region.pages,
                region.pinned_while_registered,
                region.pinned_after_deregister
            );
            println!("  frames sent: {}", output.frames_sent);
        }
        OutputFormat::Raw => {
            for row in &output.events {
                println!("{} {} {}", row.endpoint, row.event, row.status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_pins_are_released_on_deregister() {
        let memory = Arc::new(TrackedMemory::with_page_size(4096));
        let fabric = LoopbackFabric::new();
        let transport = Transport::with_pinner(
            TransportConfig::default(),
            Arc::clone(&memory) as Arc<dyn MemoryPinner>,
        );
        let link = fabric.attach(SERVER_MAC, 1500).expect("attach should succeed");
        transport
            .add_interface(Arc::new(NetInterface::new("demo1", Arc::new(link))))
            .expect("interface should register");
        let endpoint = transport
            .create_endpoint(SERVER_MAC)
            .expect("endpoint should open");

        let region = register_demo_region(&endpoint, &memory).expect("region should register");
        assert_eq!(region.length, 8192);
        assert!(region.pages >= 2);
        assert_eq!(region.pinned_while_registered, region.pages);
        assert_eq!(region.pinned_after_deregister, 0);
        assert_eq!(endpoint.region_count(), 0);
    }

    #[test]
    fn status_names_are_kebab_case() {
        assert_eq!(status_name(EventStatus::TimedOut), "timed-out");
        assert_eq!(status_name(EventStatus::Success), "success");
    }
}
