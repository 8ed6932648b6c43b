//! quay CLI - multi-tenant development/preview server.
//!
//! Parses the command line, builds a [`ServerConfig`] and runs the server
//! until Ctrl+C.

mod cli;
mod logger;
mod ui;

use clap::Parser;
use miette::Result;
use quay_server::config::{ClientMount, ProxyRule, ServerConfig, find_available_port};
use quay_server::server::DevServer;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    logger::init_logger(args.verbose, args.quiet, args.no_color);

    run(args).await.map_err(|err| miette::miette!("{}", err))
}

async fn run(args: cli::Cli) -> quay_server::error::Result<()> {
    let addr = find_available_port([127, 0, 0, 1], args.port)?;
    let mut config = ServerConfig::new(addr);

    for spec in &args.mounts {
        let mount = cli::parse_mount(spec).map_err(quay_server::ServerError::Config)?;
        let mut client = ClientMount::new(&mount.root);
        if !mount.base_path.is_empty() {
            client = client.base_path(&mount.base_path);
        }
        config = config.mount(client);
        ui::info(&format!(
            "Mount {} -> {}",
            if mount.base_path.is_empty() { "/" } else { mount.base_path.as_str() },
            mount.root.display()
        ));
    }

    for spec in &args.proxy {
        let (prefix, target) = cli::parse_proxy(spec).map_err(quay_server::ServerError::Config)?;
        config = config.proxy_rule(ProxyRule::new(prefix.clone(), &target)?.change_origin());
        ui::info(&format!("Proxy {} -> {}", prefix, target));
    }

    config.public_domain = args.public_domain.clone();
    config.watch_roots = args.watch.clone();

    let server = DevServer::new(config)?;
    let handle = server.serve().await?;
    ui::success(&format!("quay server running at {}", handle.url()));

    if args.open {
        open_browser(&handle.url());
    }

    ui::info("Press Ctrl+C to stop");
    match signal::ctrl_c().await {
        Ok(()) => ui::info("Shutting down..."),
        Err(err) => ui::warning(&format!("Failed to listen for Ctrl+C: {}", err)),
    }

    handle.shutdown().await;
    ui::success("Server stopped");
    Ok(())
}

/// Open the server URL in the default browser.
fn open_browser(url: &str) {
    use std::process::Command;

    let result = if cfg!(target_os = "macos") {
        Command::new("open").arg(url).spawn()
    } else if cfg!(target_os = "windows") {
        Command::new("cmd").args(["/C", "start", url]).spawn()
    } else {
        Command::new("xdg-open").arg(url).spawn()
    };

    match result {
        Ok(_) => ui::info(&format!("Opened browser at {}", url)),
        Err(err) => ui::warning(&format!("Failed to open browser: {}", err)),
    }
}
