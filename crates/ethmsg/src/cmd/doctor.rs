use serde::Serialize;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::{print_json, OutputFormat};

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Info,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        platform_link_check(),
        page_size_check(),
        locked_memory_check(),
        raw_socket_check(&args.interface),
        compiled_features_check(),
    ];

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let overall = if has_fail { "fail" } else { "pass" };
    let output = DoctorOutput { checks, overall };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("ethmsg doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<20} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => println!("{}", output.overall),
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Warn => "WARN",
        CheckStatus::Info => "INFO",
        CheckStatus::Skip => "SKIP",
    }
}

fn platform_link_check() -> CheckResult {
    if cfg!(target_os = "linux") {
        CheckResult::new(
            "platform_link",
            CheckStatus::Pass,
            "AF_PACKET raw sockets available",
        )
    } else {
        CheckResult::new(
            "platform_link",
            CheckStatus::Fail,
            "raw Ethernet link requires Linux AF_PACKET",
        )
    }
}

fn page_size_check() -> CheckResult {
    let page_size = ethmsg_core::default_pinner().page_size();
    CheckResult::new(
        "page_size",
        CheckStatus::Info,
        format!("{page_size} bytes"),
    )
}

fn locked_memory_check() -> CheckResult {
    #[cfg(unix)]
    {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: getrlimit only writes into the provided struct.
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut limit) };
        if rc != 0 {
            return CheckResult::new(
                "locked_memory",
                CheckStatus::Warn,
                format!("getrlimit failed: {}", std::io::Error::last_os_error()),
            );
        }
        if limit.rlim_cur == libc::RLIM_INFINITY {
            CheckResult::new("locked_memory", CheckStatus::Pass, "unlimited")
        } else {
            CheckResult::new(
                "locked_memory",
                CheckStatus::Info,
                format!("{} bytes may be pinned", limit.rlim_cur),
            )
        }
    }

    #[cfg(not(unix))]
    {
        CheckResult::new(
            "locked_memory",
            CheckStatus::Skip,
            "page locking not implemented on this platform",
        )
    }
}

fn raw_socket_check(interface: &str) -> CheckResult {
    #[cfg(target_os = "linux")]
    {
        use ethmsg_link::{LinkError, PacketLink};

        match PacketLink::open(interface, ethmsg_wire::ETHERTYPE) {
            Ok(link) => CheckResult::new(
                "raw_socket",
                CheckStatus::Pass,
                format!("opened {} (ifindex {})", link.interface_name(), link.ifindex()),
            ),
            Err(LinkError::Open { source, .. })
                if source.kind() == std::io::ErrorKind::PermissionDenied =>
            {
                CheckResult::new(
                    "raw_socket",
                    CheckStatus::Warn,
                    "permission denied; CAP_NET_RAW is required to open links",
                )
            }
            Err(err) => CheckResult::new(
                "raw_socket",
                CheckStatus::Warn,
                format!("cannot open {interface}: {err}"),
            ),
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        CheckResult::new(
            "raw_socket",
            CheckStatus::Skip,
            format!("raw sockets unsupported; {interface} not probed"),
        )
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "async") {
        features.push("async");
    }
    if cfg!(feature = "cli") {
        features.push("cli");
    }

    CheckResult::new("compiled_features", CheckStatus::Info, features.join(", "))
}
