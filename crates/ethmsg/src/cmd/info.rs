use serde::Serialize;

use crate::cmd::InfoArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{or_unknown, print_json, print_table, OutputFormat};

#[derive(Debug, Serialize)]
struct InterfaceOutput {
    name: String,
    mac: String,
    mtu: usize,
    /// `None` when the MTU is too small to carry any message.
    max_send_size: Option<usize>,
    rate_bps: Option<u64>,
    pci: Option<String>,
    loopback: bool,
    up: bool,
}

#[cfg(target_os = "linux")]
fn probe(name: &str) -> CliResult<InterfaceOutput> {
    use crate::exit::link_error;

    let probe = ethmsg_link::probe_interface(name)
        .map_err(|e| link_error(&format!("probe {name}"), e))?;
    Ok(InterfaceOutput {
        max_send_size: ethmsg_wire::max_send_size_for_mtu(probe.mtu),
        name: probe.name,
        mac: probe.mac.to_string(),
        mtu: probe.mtu,
        rate_bps: probe.rate_bps,
        pci: probe.pci.map(|pci| pci.to_string()),
        loopback: probe.loopback,
        up: probe.up,
    })
}

#[cfg(not(target_os = "linux"))]
fn probe(name: &str) -> CliResult<InterfaceOutput> {
    Err(crate::exit::CliError::new(
        crate::exit::LINK_ERROR,
        format!("probe {name}: interface probing requires Linux"),
    ))
}

pub fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let info = probe(&args.interface)?;
    tracing::debug!(interface = %info.name, mtu = info.mtu, "probed interface");

    match format {
        OutputFormat::Json => print_json(&info),
        OutputFormat::Table | OutputFormat::Pretty => print_table(
            &["Property", "Value"],
            [
                vec!["name".to_string(), info.name.clone()],
                vec!["mac".to_string(), info.mac.clone()],
                vec!["mtu".to_string(), info.mtu.to_string()],
                vec!["max_send_size".to_string(), or_unknown(info.max_send_size)],
                vec!["rate_bps".to_string(), or_unknown(info.rate_bps)],
                vec!["pci".to_string(), or_unknown(info.pci.clone())],
                vec!["loopback".to_string(), info.loopback.to_string()],
                vec!["up".to_string(), info.up.to_string()],
            ],
        ),
        OutputFormat::Raw => println!("{} {} {}", info.name, info.mac, info.mtu),
    }

    Ok(SUCCESS)
}
