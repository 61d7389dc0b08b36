//! The hosted daemon: whatever the worker thread runs.

use std::ffi::OsString;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Exit code reported when the program could not be started at all.
pub const SPAWN_FAILED_EXIT: i32 = 127;

/// Entry point of a console daemon run under the service host.
///
/// `run` is called once per service run on the worker thread, with stdout and
/// stderr already redirected into the capture channel. `argv[0]` is the
/// service name.
pub trait HostedDaemon: Send + Sync {
    fn run(&self, argv: &[String]) -> i32;

    /// Ask a running `run` to return. Returns whether a stop was delivered;
    /// daemons without a stop hook keep the default.
    fn request_stop(&self) -> bool {
        false
    }
}

impl<F> HostedDaemon for F
where
    F: Fn(&[String]) -> i32 + Send + Sync,
{
    fn run(&self, argv: &[String]) -> i32 {
        self(argv)
    }
}

/// Runs an external program as a child process that inherits the redirected
/// standard streams. Stopping it sends `SIGTERM`.
#[derive(Debug)]
pub struct CommandDaemon {
    program: OsString,
    child: Mutex<Option<u32>>,
    stop_requested: AtomicBool,
}

impl CommandDaemon {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            child: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    fn set_child(&self, pid: Option<u32>) {
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = pid;
    }

    fn terminate(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => true,
            Err(errno) => {
                tracing::warn!(pid, error = %errno, "failed to signal hosted program");
                false
            }
        }
    }
}

impl HostedDaemon for CommandDaemon {
    fn run(&self, argv: &[String]) -> i32 {
        let mut command = Command::new(&self.program);
        if let Some((arg0, args)) = argv.split_first() {
            command.arg0(arg0).args(args);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(
                    program = %self.program.to_string_lossy(),
                    error = %err,
                    "failed to start hosted program",
                );
                return SPAWN_FAILED_EXIT;
            }
        };
        let pid = child.id();
        self.set_child(Some(pid));
        tracing::info!(pid, program = %self.program.to_string_lossy(), "hosted program started");

        if self.stop_requested.load(Ordering::SeqCst) {
            self.terminate(pid);
        }

        let status = child.wait();
        self.set_child(None);
        match status {
            Ok(status) => status
                .code()
                .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
            Err(err) => {
                tracing::error!(pid, error = %err, "failed to wait for hosted program");
                1
            }
        }
    }

    fn request_stop(&self) -> bool {
        self.stop_requested.store(true, Ordering::SeqCst);
        let pid = *self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match pid {
            Some(pid) => self.terminate(pid),
            None => false,
        }
    }
}
