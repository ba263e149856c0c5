//! CLI definition for `jailbox-host`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "jailbox-host", author, version, about = "Runs a sandboxed interpreter session behind a syscall-trapping jail")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Spawn one Jail/Broker pair against a policy file and wait for it to exit
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// TOML policy file describing the virtual filesystem, resource limits,
    /// and the virtual interpreter path (see [`crate::policy::HostPolicy`])
    pub policy: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Enable debug-level logging regardless of RUST_LOG
    #[arg(long, global = true)]
    pub debug: bool,

    /// Overrides the policy file's `home` directory (logs, locks, the
    /// virtual descriptor store)
    #[arg(long, global = true, env = "JAILBOX_HOME")]
    pub home: Option<PathBuf>,
}
