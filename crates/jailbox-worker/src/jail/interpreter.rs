//! The thing the Jail actually runs once setup is complete.
//!
//! spec.md treats the jailed interpreter as an opaque binary the Jail
//! execs after the filter and trap handler are installed; this trait
//! exists so alternate interpreters (a real CPython, a test double that
//! just issues a scripted sequence of syscalls) can sit behind the same
//! startup sequence in `jailbox-worker::main`.

use jailbox_shared::JailboxResult;
use std::ffi::CString;

pub trait Interpreter {
    /// Replace the current process image with the interpreter, having
    /// already applied the seccomp filter and trap handler. On success
    /// this never returns; on failure it returns the `exec` error.
    fn exec(&self, interpreter_path: &str, script_args: &[String]) -> JailboxResult<std::convert::Infallible>;
}

/// Execs a real binary found at the virtual interpreter path the broker
/// handed down during startup (spec.md §2's "getpythonpath" step).
pub struct ExecInterpreter;

impl Interpreter for ExecInterpreter {
    fn exec(&self, interpreter_path: &str, script_args: &[String]) -> JailboxResult<std::convert::Infallible> {
        let path = CString::new(interpreter_path)
            .map_err(|e| jailbox_shared::JailboxError::Config(e.to_string()))?;
        let mut argv: Vec<CString> = Vec::with_capacity(script_args.len() + 1);
        argv.push(path.clone());
        for arg in script_args {
            argv.push(CString::new(arg.as_str()).map_err(|e| jailbox_shared::JailboxError::Config(e.to_string()))?);
        }
        nix::unistd::execv(&path, &argv)
            .map_err(|e| jailbox_shared::JailboxError::Internal(format!("exec failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_interpreter_rejects_interior_nul_in_path() {
        let interp = ExecInterpreter;
        let result = interp.exec("/usr/bin/py\0thon", &[]);
        assert!(result.is_err());
    }
}
