//! magiknet - CNI orchestration CLI
//!
//! A thin wrapper over the library for attaching, detaching, and inspecting
//! pod networks from the command line.
//!
//! ## Usage
//!
//! ```sh
//! magiknet [-networks name[,name...]] add    <pod_namespace> <pod_name> <pod_id> <netns>
//! magiknet [-networks name[,name...]] status <pod_namespace> <pod_name> <pod_id> <netns>
//! magiknet [-networks name[,name...]] del    <pod_namespace> <pod_name> <pod_id> <netns>
//! ```
//!
//! ## Environment
//!
//! - `CONF_PATH`: network configuration directory (default `/etc/cni/net.d`)
//! - `BIN_PATH`: plugin binary directory (default `/opt/cni/bin`)

use magiknet::{CniConfig, CniPlugin, CniResult, NetAttachment, NetResult, PodNetwork};
use std::path::PathBuf;
use std::process::ExitCode;

const ENV_CONF_DIR: &str = "CONF_PATH";
const ENV_BIN_DIR: &str = "BIN_PATH";

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
struct Invocation {
    command: String,
    networks: Vec<String>,
    namespace: String,
    name: String,
    id: String,
    netns: String,
}

fn parse_args() -> Result<Invocation, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut networks = Vec::new();
    let mut positional = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-networks" | "--networks" => {
                if i + 1 >= args.len() {
                    return Err("-networks requires a comma-separated list".to_string());
                }
                networks = args[i + 1]
                    .split(',')
                    .filter(|name| !name.is_empty())
                    .map(|name| name.to_string())
                    .collect();
                i += 2;
            }
            "help" | "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            other => {
                positional.push(other.to_string());
                i += 1;
            }
        }
    }

    if positional.len() != 5 {
        return Err("expected <command> <pod_namespace> <pod_name> <pod_id> <netns>".to_string());
    }

    let command = positional[0].clone();
    match command.as_str() {
        "add" | "del" | "status" => {}
        other => return Err(format!("unknown command: {other}")),
    }

    Ok(Invocation {
        command,
        networks,
        namespace: positional[1].clone(),
        name: positional[2].clone(),
        id: positional[3].clone(),
        netns: positional[4].clone(),
    })
}

fn usage() {
    eprintln!(
        r#"magiknet: Add or remove CNI networks from a pod network namespace

USAGE:
    magiknet [-networks name[,name...]] add    <pod_namespace> <pod_name> <pod_id> <netns>
    magiknet [-networks name[,name...]] status <pod_namespace> <pod_name> <pod_id> <netns>
    magiknet [-networks name[,name...]] del    <pod_namespace> <pod_name> <pod_id> <netns>

ENVIRONMENT:
    CONF_PATH    network configuration directory (default /etc/cni/net.d)
    BIN_PATH     plugin binary directory (default /opt/cni/bin)
"#
    );
}

// =============================================================================
// Output
// =============================================================================

/// Prints each sandbox-side IP of the attachment results.
fn print_results(results: &[NetResult]) {
    for net_result in results {
        let Some(view) = CniResult::from_value(&net_result.result) else {
            continue;
        };
        let interfaces = view.interfaces.unwrap_or_default();
        for ip in view.ips.unwrap_or_default() {
            let mut details = String::new();
            if let Some(index) = ip.interface
                && let Some(interface) = interfaces.get(index)
                && interface.sandbox.is_some()
            {
                details = format!(
                    " ({} {})",
                    interface.name,
                    interface.mac.as_deref().unwrap_or("")
                );
            }
            println!("IP: {}{}", ip.address, details);
        }
    }
}

// =============================================================================
// Main
// =============================================================================

async fn run(invocation: Invocation) -> magiknet::Result<()> {
    let conf_dir = std::env::var(ENV_CONF_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(magiknet::DEFAULT_CONF_DIR));
    let bin_dir = std::env::var(ENV_BIN_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(magiknet::DEFAULT_BIN_DIR));

    let plugin = CniPlugin::init(CniConfig {
        conf_dir,
        bin_dirs: vec![bin_dir],
        watch: false,
        ..Default::default()
    })
    .await?;

    let pod = PodNetwork {
        namespace: invocation.namespace,
        name: invocation.name,
        id: invocation.id,
        netns: invocation.netns,
        networks: invocation
            .networks
            .iter()
            .map(NetAttachment::new)
            .collect(),
        ..Default::default()
    };

    let outcome = match invocation.command.as_str() {
        "add" => plugin.set_up_pod(&pod).await.map(|results| {
            print_results(&results);
        }),
        "status" => plugin.pod_network_status(&pod).await.map(|results| {
            print_results(&results);
        }),
        "del" => plugin.tear_down_pod(&pod).await,
        _ => unreachable!("validated during parsing"),
    };

    plugin.shutdown().await?;
    outcome
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let invocation = match parse_args() {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("error: {e}");
            usage();
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to create runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(invocation)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
