use crate::pw::{config, daemon, descriptor::Descriptor, rpc};
use clap::ValueEnum;
use clap::{Parser, Subcommand};
use std::io::Read as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(name = "procwatchd", version, about = "procwatch process supervisor")]
pub struct Args {
    /// Path to master config YAML
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// List supervised processes
    List {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show one supervised process by key
    Get {
        key: String,
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Store a descriptor (JSON object, read from --file or stdin)
    Write {
        name: String,
        /// Descriptor JSON file; omit to read stdin
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,
    },
    /// Delete a descriptor; its child is stopped
    Delete { name: String },
    /// Print local build info
    Version,
    /// Print server build info (requires daemon socket)
    ServerVersion,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    if matches!(&args.cmd, Some(Cmd::Version)) {
        println!("{}", crate::pw::build_info::banner());
        return Ok(());
    }
    let cfg = config::load_master_config(&args.config)?;

    match args.cmd {
        None => daemon::run_daemon(&cfg),
        Some(cmd) => run_client_cmd(&cfg.sock, cmd),
    }
}

/// Shared by `procwatchd <cmd>` (socket from config) and `pwctl` (socket from
/// flag/env).
pub(crate) fn run_client_cmd(sock: &Path, cmd: Cmd) -> anyhow::Result<()> {
    match cmd {
        Cmd::List { format } => {
            let resp = rpc::client_call(sock, rpc::Request::List)?;
            match format {
                OutputFormat::Text => println!("{}", resp.render_text()),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
            }
            Ok(())
        }
        Cmd::Get { key, format } => {
            let resp = rpc::client_call(sock, rpc::Request::Get { key })?;
            match format {
                OutputFormat::Text => println!("{}", resp.render_text()),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
            }
            Ok(())
        }
        Cmd::Write { name, file } => {
            let raw = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let descriptor: Descriptor = serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("parse descriptor JSON: {e}"))?;
            let resp = rpc::client_call(sock, rpc::Request::Write { name, descriptor })?;
            if !resp.message.trim().is_empty() {
                println!("{}", resp.message.trim_end());
            }
            Ok(())
        }
        Cmd::Delete { name } => {
            let resp = rpc::client_call(sock, rpc::Request::Delete { name })?;
            if !resp.message.trim().is_empty() {
                println!("{}", resp.message.trim_end());
            }
            Ok(())
        }
        Cmd::ServerVersion => {
            let resp = rpc::client_call(sock, rpc::Request::ServerVersion)?;
            if !resp.message.trim().is_empty() {
                println!("{}", resp.message.trim_end());
            }
            Ok(())
        }
        Cmd::Version => unreachable!("handled before config load"),
    }
}
