//! Entry point the Host execs with descriptors 3 (IN) and 4 (OUT)
//! pre-opened for line-delimited JSON-RPC (spec.md §2 step 1). Logging is
//! initialized before anything else so startup failures are captured;
//! everything past that lives in [`jailbox_worker::startup`].

use std::path::PathBuf;

fn main() {
    let home = std::env::var_os("JAILBOX_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("jailbox"));
    if let Err(e) = jailbox_worker::logging::init_logging(&home) {
        eprintln!("jailbox-worker: failed to initialize logging: {e}");
    }

    let code = jailbox_worker::startup::run();
    std::process::exit(code);
}
