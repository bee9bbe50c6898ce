//! Crealink - Entry Point
//!
//! Keeps a WebSocket session open to every configured printer and exposes
//! their live state over a small local HTTP API.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crealink::app::options::{AppOptions, ServerOptions};
use crealink::app::run::run;
use crealink::filesys::file::File;
use crealink::logs::{init_logging, LogOptions};
use crealink::scanner::scan_subnet;
use crealink::storage::layout::StorageLayout;
use crealink::storage::settings::Settings;
use crealink::utils::version_info;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    let layout = match cli_args.get("data-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(PathBuf::from(path)),
        None => layout.settings_file(),
    };
    let settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file {}: {}", settings_file.path().display(), e);
                return;
            }
        }
    } else {
        eprintln!("No settings file at {}, using defaults", settings_file.path().display());
        Settings::default()
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.json_logs,
        log_dir: settings.log_to_file.then(|| layout.logs_dir()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    // Scan a subnet and exit
    if let Some(cidr) = cli_args.get("scan") {
        let net = match cidr.parse::<ipnet::Ipv4Net>() {
            Ok(net) => net,
            Err(e) => {
                error!("Invalid subnet {}: {}", cidr, e);
                return;
            }
        };
        let found = scan_subnet(net, &settings.discovery.scan_options()).await;
        match serde_json::to_string_pretty(&found) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to encode scan results: {}", e),
        }
        return;
    }

    let subnets = match settings.discovery.parsed_subnets() {
        Ok(subnets) => subnets,
        Err(e) => {
            warn!("Ignoring discovery subnets: {}", e);
            Vec::new()
        }
    };

    let (printers, rejected) = settings.device_configs();
    for (label, e) in &rejected {
        error!("Skipping printer {}: {}", label, e);
    }
    if printers.is_empty() {
        warn!("No printers configured");
    }

    let options = AppOptions {
        layout,
        enable_server: settings.server.enabled,
        server: ServerOptions {
            host: settings.server.host.clone(),
            port: settings.server.port,
        },
        discovery: settings.discovery.scan_options(),
        subnets,
        printers,
        ..Default::default()
    };

    info!("Running Crealink {} with {} printers", version.version, options.printers.len());
    let result = run(options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the bridge: {e}");
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down...");
                    }
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Ctrl+C received, shutting down...");
}
