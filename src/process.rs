//! Process supervisor: fork/exec of the mux binary, SIGCHLD reaping,
//! bounded waits, and the one-shot command path (spec §4.2).

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use signal_hook::low_level::pipe as sigpipe;

use crate::error::{Error, Result};
use crate::rdavail::{self, Destination, Format};

/// Which of a child's standard streams the caller wants a parent-side pipe
/// for (spec §4.2, "three optional want-pipe flags").
#[derive(Debug, Clone, Copy, Default)]
pub struct WantPipes {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// Parent-side descriptors returned by [`Supervisor::fork`] for whichever
/// pipes were requested.
pub struct ForkResult {
    pub pid: i32,
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Owns the one process-wide SIGCHLD self-pipe and the set of pids it is
/// responsible for reaping. There must be at most one of these alive per
/// process (spec §9: "forbid two cores in the same process").
pub struct Supervisor {
    sigchld_read: UnixStream,
    registered: Option<signal_hook::SigId>,
    timeout: Duration,
}

impl Supervisor {
    /// Installs the SIGCHLD handler. Called once from `Core::connect`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let (read, write) = UnixStream::pair()?;
        read.set_nonblocking(true)?;
        let registered = sigpipe::register(libc::SIGCHLD, write)?;
        Ok(Self {
            sigchld_read: read,
            registered: Some(registered),
            timeout,
        })
    }

    /// Raw fd to register with the event loop for `Interest::READ`.
    pub fn sigchld_fd(&self) -> RawFd {
        self.sigchld_read.as_raw_fd()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Drains the self-pipe and reaps every child currently waitable,
    /// returning `(pid, status)` for each. Called from the fd event source
    /// the core registers on [`Self::sigchld_fd`].
    pub fn drain_sigchld(&self) -> Result<Vec<(i32, WaitStatus)>> {
        let _ = rdavail::read_available(self.sigchld_fd(), Destination::Discard);
        let mut reaped = Vec::new();
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        reaped.push((pid.as_raw(), status));
                    }
                }
                Err(nix::errno::Errno::ECHILD) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(reaped)
    }

    /// Forks and execs `prefix` followed by `args`, wiring up whichever
    /// pipes `want` requests. Parent-side stdout/stderr descriptors are
    /// left in non-blocking mode; stdin is left blocking (writes are small
    /// and the supervisor retries on partial writes, spec §4.3).
    pub fn fork(&self, prefix: &[String], args: &[String], want: WantPipes) -> Result<ForkResult> {
        let mut cmd = Command::new(&prefix[0]);
        cmd.args(&prefix[1..]);
        cmd.args(args);

        cmd.stdin(if want.stdin { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(if want.stdout { Stdio::piped() } else { Stdio::null() });
        cmd.stderr(if want.stderr { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd.spawn()?;
        let pid = child.id() as i32;

        use std::os::fd::IntoRawFd;

        let stdin = child
            .stdin
            .take()
            .map(|s| unsafe { OwnedFd::from_raw_fd(s.into_raw_fd()) });
        let stdout = match child.stdout.take() {
            Some(s) => {
                let fd = unsafe { OwnedFd::from_raw_fd(s.into_raw_fd()) };
                rdavail::set_nonblocking(fd.as_raw_fd())?;
                Some(fd)
            }
            None => None,
        };
        let stderr = match child.stderr.take() {
            Some(s) => {
                let fd = unsafe { OwnedFd::from_raw_fd(s.into_raw_fd()) };
                rdavail::set_nonblocking(fd.as_raw_fd())?;
                Some(fd)
            }
            None => None,
        };

        // Waits go through `waitpid` on the raw pid (see `wait_pid`), not
        // through `Child::wait`, so dropping the handle here is safe.
        drop(child);

        Ok(ForkResult {
            pid,
            stdin,
            stdout,
            stderr,
        })
    }

    /// Bounded wait on `pid` (spec §4.2). Polls the self-pipe until either
    /// the child is reaped or `self.timeout` elapses; on timeout sends
    /// `SIGTERM` and falls back to a final blocking `waitpid`.
    pub fn wait_pid(&self, pid: i32) -> Result<ExitStatus> {
        let deadline = Instant::now() + self.timeout;
        let target = Pid::from_raw(pid);

        loop {
            match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(status) => return Ok(status_to_exit_status(status)),
                Err(nix::errno::Errno::ECHILD) => {
                    return Err(Error::OsError(nix::errno::Errno::ECHILD))
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(pid, "child did not exit within timeout, sending SIGTERM");
        let _ = signal::kill(target, Signal::SIGTERM);
        let _ = waitpid(target, None);
        Err(Error::Timeout("wait_pid"))
    }

    /// Runs the mux binary to completion for a one-shot command, capturing
    /// stdout/stderr via the read-available helper (spec §4.2's `exec`).
    pub fn run_one_shot(&self, prefix: &[String], args: &[String]) -> Result<(ExitStatus, Vec<u8>)> {
        let fork = self.fork(prefix, args, WantPipes { stdin: false, stdout: true, stderr: true })?;
        let stdout_fd = fork.stdout.as_ref().map(|f| f.as_raw_fd());
        let stderr_fd = fork.stderr.as_ref().map(|f| f.as_raw_fd());

        let mut out = Vec::new();
        let mut err = Vec::new();
        let deadline = Instant::now() + self.timeout;

        let status = loop {
            if let Some(fd) = stdout_fd {
                let _ = rdavail::read_available(fd, Destination::Buffer(&mut out, Format::Raw));
            }
            if let Some(fd) = stderr_fd {
                let _ = rdavail::read_available(fd, Destination::Buffer(&mut err, Format::Raw));
            }
            match waitpid(Pid::from_raw(fork.pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if Instant::now() >= deadline {
                        let _ = signal::kill(Pid::from_raw(fork.pid), Signal::SIGTERM);
                        let status = waitpid(Pid::from_raw(fork.pid), None)?;
                        break status_to_exit_status(status);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(status) => break status_to_exit_status(status),
                Err(nix::errno::Errno::ECHILD) => return Err(Error::OsError(nix::errno::Errno::ECHILD)),
                Err(e) => return Err(e.into()),
            }
        };

        // Final drain: the child may have written its last bytes between
        // the last poll and exit.
        if let Some(fd) = stdout_fd {
            let _ = rdavail::read_available(fd, Destination::Buffer(&mut out, Format::Raw));
        }
        if let Some(fd) = stderr_fd {
            let _ = rdavail::read_available(fd, Destination::Buffer(&mut err, Format::Raw));
        }

        if !status.success() {
            return Err(Error::ChildFailed {
                status,
                stderr: String::from_utf8_lossy(&err).into_owned(),
            });
        }

        Ok((status, out))
    }

    /// Target scope for [`Self::get_option`] (spec §4.2: "flags {LOCAL/GLOBAL
    /// × SERVER/SESSION/WINDOW}").
    ///
    /// `Server` has no target and is implicitly global. `Session`/`Window`
    /// carry the id to pass as `-t`; `global` selects `-g` (the option's
    /// global default for that scope) over the scope's local override.
    pub fn get_option(&self, prefix: &[String], name: &str, target: OptionTarget) -> Result<String> {
        let mut args = vec!["show-options".to_string(), "-v".to_string()];
        match target {
            OptionTarget::Server => {}
            OptionTarget::Session { id, global } => {
                if global {
                    args.push("-g".to_string());
                }
                args.push("-t".to_string());
                args.push(id.to_string());
            }
            OptionTarget::Window { id, global } => {
                args.push("-w".to_string());
                if global {
                    args.push("-g".to_string());
                }
                args.push("-t".to_string());
                args.push(id.to_string());
            }
        }
        args.push(name.to_string());

        match self.run_one_shot(prefix, &args) {
            Ok((_, out)) => Ok(String::from_utf8_lossy(&out).trim_end_matches('\n').to_string()),
            Err(Error::ChildFailed { .. }) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum OptionTarget {
    Server,
    Session { id: crate::ids::SessionId, global: bool },
    Window { id: crate::ids::WindowId, global: bool },
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(id) = self.registered.take() {
            signal_hook::low_level::unregister(id);
        }
    }
}

fn status_to_exit_status(status: WaitStatus) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    match status {
        WaitStatus::Exited(_, code) => ExitStatus::from_raw(code << 8),
        WaitStatus::Signaled(_, sig, _) => ExitStatus::from_raw(sig as i32),
        _ => ExitStatus::from_raw(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_true_and_captures_nothing() {
        let sup = Supervisor::new(Duration::from_secs(2)).unwrap();
        let prefix = vec!["/bin/echo".to_string()];
        let (status, out) = sup.run_one_shot(&prefix, &["hello".to_string()]).unwrap();
        assert!(status.success());
        assert_eq!(out, b"hello\n");
    }

    #[test]
    fn nonzero_exit_is_child_failed() {
        let sup = Supervisor::new(Duration::from_secs(2)).unwrap();
        let prefix = vec!["/bin/sh".to_string()];
        let err = sup
            .run_one_shot(&prefix, &["-c".to_string(), "exit 3".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::ChildFailed { .. }));
    }
}
