//! labscan - lab device discovery and identity cache
//!
//! One-shot commands print JSON to stdout; `serve` runs the HTTP API.

mod api;
mod config;
mod listing;
mod server;
mod state;

use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};
use labscan_core::{DeviceKey, DeviceType, ExplicitCredentials, PowerState, SshStatus};
use labscan_probe::KeyInstall;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::listing::{ListMode, ListQuery, OnlineStatus, SortKey, SortOrder};
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "labscan")]
#[command(about = "Discover, identify and track networked lab hardware")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "labscan.toml")]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Network swept in full mode, overriding the config file
    #[arg(long, global = true, env = "LABSCAN_TARGET_NETWORK")]
    target_network: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List devices, probing stale entries first
    List(ListArgs),
    /// Re-verify devices now; without keys, run a full forced discovery
    Refresh {
        keys: Vec<String>,
        #[command(flatten)]
        credentials: CredentialArgs,
    },
    /// Identify the device answering at an address and record it there
    VerifyIp {
        ip: Ipv4Addr,
        #[command(flatten)]
        credentials: CredentialArgs,
    },
    /// Set a friendly name; omit the name to clear it
    Rename { key: String, name: Option<String> },
    /// Record which power switch controls a device; omit the switch to clear it
    Link { key: String, switch: Option<String> },
    /// Remember the remote shell login for a device
    CacheCredential {
        key: String,
        #[arg(short, long)]
        username: String,
        #[arg(short, long, env = "LABSCAN_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Install the local public key on a device
    InstallKey {
        key: String,
        #[command(flatten)]
        credentials: CredentialArgs,
    },
    /// Run the HTTP API
    Serve {
        /// Bind address, overriding the config file
        #[arg(short, long)]
        bind: Option<String>,
    },
}

#[derive(ClapArgs, Debug)]
struct ListArgs {
    #[arg(short, long, value_enum, default_value_t = ListMode::Quick)]
    mode: ListMode,
    /// Probe every device regardless of staleness
    #[arg(short, long)]
    force: bool,
    #[arg(long = "type", value_parser = parse_device_type)]
    device_type: Option<DeviceType>,
    #[arg(long, value_parser = parse_ssh_status)]
    ssh_status: Option<SshStatus>,
    #[arg(long, value_enum)]
    status: Option<OnlineStatus>,
    #[arg(long, value_parser = parse_power_state)]
    power_state: Option<PowerState>,
    #[arg(short, long)]
    search: Option<String>,
    #[arg(long, value_enum, default_value_t = SortKey::Ip)]
    sort_by: SortKey,
    #[arg(long, value_enum, default_value_t = SortOrder::Asc)]
    order: SortOrder,
    #[arg(long)]
    limit: Option<usize>,
}

impl From<ListArgs> for ListQuery {
    fn from(args: ListArgs) -> Self {
        ListQuery {
            mode: args.mode,
            force: args.force,
            device_type: args.device_type,
            ssh_status: args.ssh_status,
            status: args.status,
            power_state: args.power_state,
            search: args.search,
            sort_by: args.sort_by,
            order: args.order,
            limit: args.limit,
        }
    }
}

#[derive(ClapArgs, Debug)]
struct CredentialArgs {
    #[arg(short, long)]
    username: Option<String>,
    #[arg(short, long, env = "LABSCAN_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

impl CredentialArgs {
    fn explicit(self) -> Option<ExplicitCredentials> {
        if self.username.is_none() && self.password.is_none() {
            return None;
        }
        Some(ExplicitCredentials {
            username: self.username,
            password: self.password,
        })
    }
}

fn parse_device_type(value: &str) -> Result<DeviceType, String> {
    value.parse()
}

fn parse_ssh_status(value: &str) -> Result<SshStatus, String> {
    value.parse()
}

fn parse_power_state(value: &str) -> Result<PowerState, String> {
    PowerState::parse(value).ok_or_else(|| format!("unknown power state '{}'", value))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level; stdout is reserved for JSON
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("labscan v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(&args.config)?;
    let state = AppState::new(config, args.config.clone(), args.target_network.clone())?;

    match args.command {
        Command::List(list) => {
            let query = ListQuery::from(list);
            print_json(&state.list(&query).await?)?;
        }
        Command::Refresh { keys, credentials } => {
            let report = if keys.is_empty() {
                state.discover(true).await?
            } else {
                let keys = keys.into_iter().map(DeviceKey::new).collect();
                state.refresh(keys, credentials.explicit()).await?
            };
            print_json(&report)?;
        }
        Command::VerifyIp { ip, credentials } => {
            print_json(&state.verify_ip(ip, credentials.explicit()).await?)?;
        }
        Command::Rename { key, name } => {
            print_json(&state.rename(DeviceKey::new(key), name).await?)?;
        }
        Command::Link { key, switch } => {
            let switch = switch.map(DeviceKey::new);
            print_json(&state.link(DeviceKey::new(key), switch).await?)?;
        }
        Command::CacheCredential {
            key,
            username,
            password,
        } => {
            let device = DeviceKey::new(key);
            state
                .cache_credential(device.clone(), username, password)
                .await?;
            print_json(&serde_json::json!({ "device": device, "cached": true }))?;
        }
        Command::InstallKey { key, credentials } => {
            let device = DeviceKey::new(key);
            let explicit = credentials.explicit().unwrap_or_default();
            let outcome = state.install_key(device.clone(), explicit).await?;
            print_json(&serde_json::json!({
                "device": device,
                "installed": outcome == KeyInstall::Installed,
                "already_installed": outcome == KeyInstall::AlreadyInstalled,
            }))?;
        }
        Command::Serve { bind } => {
            let bind = match bind {
                Some(bind) => bind,
                None => state.config().await.server.bind,
            };
            server::run(state, &bind).await?;
        }
    }

    Ok(())
}
