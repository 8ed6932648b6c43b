//! Command-line interface definition.
//!
//! Mounts are positional: `PATH` serves a directory at the root, and
//! `BASE=PATH` mounts it under a URL prefix, so several clients can share
//! one server. Proxy rules use the same `PREFIX=TARGET` shape.

use clap::Parser;
use std::path::PathBuf;

/// quay - multi-tenant development/preview server
#[derive(Parser, Debug)]
#[command(
    name = "quay",
    version,
    about = "A multi-tenant development/preview server",
    long_about = "quay serves one or more client applications from the filesystem with \n\
                  hot reload over WebSocket, reverse-proxying for API backends, and \n\
                  on-demand server-side rendering."
)]
pub struct Cli {
    /// Directories to serve: PATH for the root mount, BASE=PATH to mount
    /// under a URL prefix (e.g. /admin=./admin-dist)
    #[arg(required = true)]
    pub mounts: Vec<String>,

    /// Port to listen on (falls back to the next free port)
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// Proxy rules as PREFIX=TARGET (e.g. /api=http://localhost:4000)
    #[arg(long = "proxy", value_name = "PREFIX=TARGET")]
    pub proxy: Vec<String>,

    /// Public domain to redirect to when the bind host is requested
    #[arg(long)]
    pub public_domain: Option<String>,

    /// Extra directories to watch for hot reload
    #[arg(long = "watch", value_name = "PATH")]
    pub watch: Vec<PathBuf>,

    /// Open the browser after the server starts
    #[arg(long)]
    pub open: bool,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// A parsed `BASE=PATH` mount argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountArg {
    pub base_path: String,
    pub root: PathBuf,
}

/// Split a mount argument into base path and directory.
pub fn parse_mount(spec: &str) -> Result<MountArg, String> {
    match spec.split_once('=') {
        Some((base, path)) => {
            if !base.starts_with('/') {
                return Err(format!(
                    "mount base must start with '/': {} (try /{}={})",
                    spec, base, path
                ));
            }
            Ok(MountArg {
                base_path: base.to_string(),
                root: PathBuf::from(path),
            })
        }
        None => Ok(MountArg {
            base_path: String::new(),
            root: PathBuf::from(spec),
        }),
    }
}

/// Split a `PREFIX=TARGET` proxy argument.
pub fn parse_proxy(spec: &str) -> Result<(String, String), String> {
    let (prefix, target) = spec
        .split_once('=')
        .ok_or_else(|| format!("proxy rule must be PREFIX=TARGET: {}", spec))?;
    if !prefix.starts_with('/') {
        return Err(format!("proxy prefix must start with '/': {}", spec));
    }
    Ok((prefix.to_string(), target.to_string()))
}
