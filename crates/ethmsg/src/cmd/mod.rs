use clap::{Args, Subcommand};
use ethmsg_link::MacAddr;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod demo;
pub mod doctor;
pub mod info;
pub mod locator;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show version information.
    Version(VersionArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
    /// Encode or decode endpoint locators.
    Locator(LocatorArgs),
    /// Probe a network interface and print its transport limits.
    Info(InfoArgs),
    /// Run two endpoints over an in-process fabric and print the event log.
    Demo(DemoArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Version(args) => version::run(args),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Locator(args) => locator::run(args, format),
        Command::Info(args) => info::run(args, format),
        Command::Demo(args) => demo::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {
    /// Interface to try opening a raw socket on.
    #[arg(long, default_value = "lo")]
    pub interface: String,
}

#[derive(Args, Debug)]
pub struct LocatorArgs {
    #[command(subcommand)]
    pub command: LocatorCommand,
}

#[derive(Subcommand, Debug)]
pub enum LocatorCommand {
    /// Build a locator from a hardware address and endpoint id.
    Encode {
        /// Hardware address, colon-hex.
        #[arg(long)]
        mac: MacAddr,
        /// Endpoint id.
        #[arg(long)]
        endpoint: u32,
    },
    /// Split a locator into hardware address and endpoint id.
    Decode {
        /// Locator, e.g. eth://aa:bb:cc:dd:ee:ff:00000003
        locator: String,
    },
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Interface name, e.g. eth0.
    pub interface: String,
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Messages to send once connected.
    #[arg(long, default_value = "3")]
    pub messages: usize,
    /// Message payload size in bytes.
    #[arg(long, default_value = "64")]
    pub size: usize,
    /// Reject the connection instead of accepting it.
    #[arg(long)]
    pub reject: bool,
    /// Link MTU of the demo interfaces.
    #[arg(long, default_value = "1500", env = "ETHMSG_DEMO_MTU")]
    pub mtu: usize,
}
