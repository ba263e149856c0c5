//! `jailbox-host` entry point (spec.md §6's "CLI (Broker entry)", for
//! this workspace the Host is the process an operator actually invokes;
//! the Broker is a role the spawned worker process takes on after it
//! forks).

use clap::Parser;
use jailbox_host::cli::{Cli, Commands};
use jailbox_host::policy::HostPolicy;

fn main() {
    let cli = Cli::parse();

    let Commands::Run(run_args) = cli.command;

    let mut policy = match HostPolicy::from_file(&run_args.policy) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("jailbox-host: failed to load policy {}: {e}", run_args.policy.display());
            std::process::exit(-(libc::EINVAL));
        }
    };

    if let Some(home) = cli.global.home {
        policy.home = home;
    }

    if let Err(e) = jailbox_host::logging::init_logging(&policy.home, cli.global.debug) {
        eprintln!("jailbox-host: failed to initialize logging: {e}");
    }

    let code = match jailbox_host::spawn::run_one(policy) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "host failed to run worker session");
            e.exit_code()
        }
    };
    std::process::exit(code);
}
