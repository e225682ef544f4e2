use thiserror::Error;

use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

#[derive(Debug, Error)]
pub enum Error {
    #[error("command `{argv}` could not be spawned: {source}")]
    SpawnFailed { argv: String, source: std::io::Error },
    #[error("command `{argv}` exited with {code}")]
    Failed { argv: String, code: i32, output: String },
}

/// How much of a command invocation ends up in the log.
///
/// Existence probes run `Silent` and interpret the exit code; their
/// expected failures must not show up as errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    Silent,
    Debug,
    Info,
}

pub trait CommandOps: Send + Sync {
    /// Run an argv vector, capture combined stdout and stderr, and return
    /// the collected output on exit code zero.
    fn run(&self, argv: &[&str], verbosity: Verbosity) -> Result<String, Error>;

    /// Like [`CommandOps::run`], but the child starts with every inherited
    /// file descriptor above stderr closed. Required around OpenVPN service
    /// starts so the daemon does not end up holding our listening socket.
    fn run_close_fds(&self, argv: &[&str], verbosity: Verbosity) -> Result<String, Error>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemCommands;

impl CommandOps for SystemCommands {
    fn run(&self, argv: &[&str], verbosity: Verbosity) -> Result<String, Error> {
        execute(argv, verbosity, false)
    }

    fn run_close_fds(&self, argv: &[&str], verbosity: Verbosity) -> Result<String, Error> {
        execute(argv, verbosity, true)
    }
}

fn execute(argv: &[&str], verbosity: Verbosity, close_fds: bool) -> Result<String, Error> {
    let joined = argv.join(" ");
    match verbosity {
        Verbosity::Info => tracing::info!(cmd = %joined, "running command"),
        Verbosity::Debug => tracing::debug!(cmd = %joined, "running command"),
        Verbosity::Silent => {}
    }

    let (program, args) = argv.split_first().ok_or_else(|| Error::SpawnFailed {
        argv: joined.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
    })?;

    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    if close_fds {
        // fds 0-2 stay; everything else would leak into long-lived children
        unsafe {
            cmd.pre_exec(|| {
                if libc::close_range(3, libc::c_uint::MAX, 0) == 0 {
                    Ok(())
                } else {
                    Err(std::io::Error::last_os_error())
                }
            });
        }
    }

    let out = cmd.output().map_err(|source| Error::SpawnFailed {
        argv: joined.clone(),
        source,
    })?;

    let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(&out.stderr));

    if out.status.success() {
        match verbosity {
            Verbosity::Info => tracing::info!(cmd = %joined, %output, "command output"),
            Verbosity::Debug => tracing::debug!(cmd = %joined, %output, "command output"),
            Verbosity::Silent => {}
        }
        Ok(output)
    } else {
        let code = out.status.code().unwrap_or(-1);
        if verbosity != Verbosity::Silent {
            tracing::error!(cmd = %joined, %code, %output, "command failed");
        }
        Err(Error::Failed {
            argv: joined,
            code,
            output,
        })
    }
}
