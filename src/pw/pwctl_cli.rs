use crate::pw::cli;
use clap::Parser;
use std::path::PathBuf;
use std::{env, fmt};

#[derive(Debug, Parser)]
#[command(name = "pwctl", version, about = "procwatch control client")]
pub struct PwctlArgs {
    /// Unix socket path to the procwatch daemon
    #[arg(short = 's', long = "sock")]
    pub sock: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<cli::Cmd>,
}

fn resolve_sock(args: &PwctlArgs) -> anyhow::Result<PathBuf> {
    if let Some(sock) = args.sock.clone() {
        return Ok(sock);
    }
    if let Ok(v) = env::var("PWCTL_SOCK") {
        let t = v.trim();
        if !t.is_empty() {
            return Ok(PathBuf::from(t));
        }
    }

    anyhow::bail!("{}", MissingSockHelp);
}

struct MissingSockHelp;

impl fmt::Display for MissingSockHelp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "no procwatch socket specified")?;
        writeln!(f)?;
        writeln!(f, "pwctl does not read the procwatchd config file.")?;
        writeln!(f, "You must provide the daemon unix socket path via one of:")?;
        writeln!(f, "  - pwctl --sock /path/to/procwatch.sock <command>")?;
        writeln!(f, "  - pwctl -s /path/to/procwatch.sock <command>")?;
        writeln!(f, "  - export PWCTL_SOCK=/path/to/procwatch.sock")?;
        writeln!(f)?;
        writeln!(f, "Examples:")?;
        writeln!(f, "  pwctl --sock /tmp/procwatch.sock list")?;
        writeln!(f, "  PWCTL_SOCK=/tmp/procwatch.sock pwctl get web")?;
        Ok(())
    }
}

pub fn run() -> anyhow::Result<()> {
    let args = PwctlArgs::parse();

    if matches!(&args.cmd, Some(cli::Cmd::Version)) {
        println!("{}", crate::pw::build_info::banner());
        return Ok(());
    }

    let sock = resolve_sock(&args)?;
    let cmd = args.cmd.unwrap_or(cli::Cmd::List {
        format: cli::OutputFormat::Text,
    });
    cli::run_client_cmd(&sock, cmd)
}
