mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "ethmsg", version, about = "Raw Ethernet message transport CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level for ethmsg crates (stderr). ETHMSG_LOG overrides it.
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::LocatorCommand;

    #[test]
    fn parses_locator_encode() {
        let cli = Cli::try_parse_from([
            "ethmsg",
            "locator",
            "encode",
            "--mac",
            "aa:bb:cc:dd:ee:ff",
            "--endpoint",
            "3",
        ])
        .expect("locator encode args should parse");

        match cli.command {
            Command::Locator(args) => {
                assert!(matches!(args.command, LocatorCommand::Encode { endpoint: 3, .. }))
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_mac_at_parse_time() {
        let err = Cli::try_parse_from([
            "ethmsg",
            "locator",
            "encode",
            "--mac",
            "zz:bb:cc:dd:ee:ff",
            "--endpoint",
            "3",
        ])
        .expect_err("bad MAC should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn parses_demo_with_options() {
        let cli = Cli::try_parse_from([
            "ethmsg",
            "--format",
            "json",
            "demo",
            "--messages",
            "5",
            "--reject",
        ])
        .expect("demo args should parse");
        assert!(matches!(cli.command, Command::Demo(ref args) if args.messages == 5 && args.reject));
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
    }
}
