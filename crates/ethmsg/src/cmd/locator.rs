use serde::Serialize;

use ethmsg_wire::Locator;

use crate::cmd::{LocatorArgs, LocatorCommand};
use crate::exit::{wire_error, CliResult, SUCCESS};
use crate::output::{print_json, print_pairs, print_raw, OutputFormat};

#[derive(Debug, Serialize)]
struct LocatorOutput {
    locator: String,
    mac: String,
    endpoint: u32,
}

impl From<Locator> for LocatorOutput {
    fn from(locator: Locator) -> Self {
        Self {
            locator: locator.to_string(),
            mac: locator.mac.to_string(),
            endpoint: locator.endpoint_id,
        }
    }
}

pub fn run(args: LocatorArgs, format: OutputFormat) -> CliResult<i32> {
    let output = match args.command {
        LocatorCommand::Encode { mac, endpoint } => LocatorOutput::from(Locator::new(mac, endpoint)),
        LocatorCommand::Decode { locator } => {
            let parsed = Locator::parse(&locator).map_err(|e| wire_error("locator decode", e))?;
            LocatorOutput::from(parsed)
        }
    };

    match format {
        OutputFormat::Json => print_json(&output),
        OutputFormat::Table | OutputFormat::Pretty => print_pairs(
            "locator",
            &[
                ("locator", output.locator.clone()),
                ("mac", output.mac.clone()),
                ("endpoint", output.endpoint.to_string()),
            ],
        ),
        OutputFormat::Raw => {
            print_raw(output.locator.as_bytes());
            println!();
        }
    }

    Ok(SUCCESS)
}
