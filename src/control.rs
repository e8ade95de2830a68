//! Control-mode client: one long-lived mux subprocess per session, plus
//! optionally one "temporary" client with no session (spec §4.3).

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::ids::SessionId;
use crate::process::{Supervisor, WantPipes};
use crate::protocol::{Parsed, Parser};
use crate::rdavail::{self, Destination, Format};
use crate::ring::RingBuffer;
use crate::scheduler::RefreshScheduler;

/// Outcome of a completed `%begin/%end|%error` block routed to whichever
/// `cc_exec` call was pending on a client.
pub struct CommandReply {
    pub payload: Vec<u8>,
    pub is_error: bool,
}

/// A single control-mode subprocess (spec §4.3's state list).
pub struct ControlClient {
    /// `None` for the temporary client.
    pub session: Option<SessionId>,
    pub pid: i32,
    stdin: OwnedFd,
    stdout: OwnedFd,
    ring: RingBuffer,
    /// Swallows the first framed block, which answers the implicit
    /// `refresh-client` sent at launch rather than a caller's command.
    expect_preamble: bool,
    /// Set while a `cc_exec` call is in flight; cleared once its block
    /// arrives. Spec §9: only one `cc_exec` may be in flight per client.
    pending: bool,
    /// The event-loop registration for [`Self::stdout_fd`], set by the core
    /// once it registers this client's stdout with the loop. Used only for
    /// teardown; the client itself never touches the loop.
    pub fd_token: Option<calloop::RegistrationToken>,
}

impl ControlClient {
    /// Forks `tmux -C attach-session -t $id` (or `-C new-session -s name`
    /// for the temporary client) and performs the initial size handshake.
    pub fn launch(
        supervisor: &Supervisor,
        prefix: &[String],
        session: Option<(SessionId, String)>,
        temp_session_name: &str,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let mut args = vec!["-C".to_string()];
        let session_id = session.as_ref().map(|(id, _)| *id);
        match &session {
            Some((id, _)) => {
                args.push("attach-session".to_string());
                args.push("-t".to_string());
                args.push(id.to_string());
            }
            None => {
                args.push("new-session".to_string());
                args.push("-s".to_string());
                args.push(temp_session_name.to_string());
            }
        }

        let fork = supervisor.fork(
            prefix,
            &args,
            WantPipes {
                stdin: true,
                stdout: true,
                stderr: false,
            },
        )?;

        let stdin = fork.stdin.ok_or_else(|| Error::invalid("no stdin pipe for control client"))?;
        let stdout = fork.stdout.ok_or_else(|| Error::invalid("no stdout pipe for control client"))?;

        let mut client = Self {
            session: session_id,
            pid: fork.pid,
            stdin,
            stdout,
            ring: RingBuffer::new(),
            expect_preamble: true,
            pending: false,
            fd_token: None,
        };

        client.update_size(width, height)?;
        Ok(client)
    }

    pub fn stdout_fd(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }

    /// Builds and sends `refresh-client -C w,h` (spec §4.3's resize
    /// propagation). Fire-and-forget: no reply is captured.
    pub fn update_size(&mut self, width: u32, height: u32) -> Result<()> {
        self.send_line(&[
            "refresh-client".to_string(),
            "-C".to_string(),
            format!("{width},{height}"),
        ])
    }

    /// Serialises `cmd` per [`quote_argv`], writes it, and blocks (polling
    /// this client's stdout directly, not through the event loop) until its
    /// reply block arrives or `timeout` elapses (spec §4.3, `cc_exec`).
    ///
    /// Non-framed events observed while polling are not discarded: they are
    /// queued on `scheduler` exactly as they would be if seen from the
    /// ordinary event-loop callback, so a reconciliation pass still runs
    /// for them even though this call itself only returns the framed reply.
    pub fn cc_exec(
        &mut self,
        cmd: &[String],
        timeout: Duration,
        scheduler: &RefreshScheduler,
    ) -> Result<CommandReply> {
        if self.pending {
            return Err(Error::invalid("cc_exec already in flight on this client"));
        }
        self.send_line(cmd)?;
        self.pending = true;

        let deadline = Instant::now() + timeout;
        loop {
            let reply = self.drain(|_, bits| scheduler.queue_refresh(bits))?;
            if let Some(reply) = reply {
                self.pending = false;
                return Ok(reply);
            }
            if Instant::now() >= deadline {
                self.pending = false;
                return Err(Error::Timeout("cc_exec"));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Drains whatever is available on stdout into the ring and runs the
    /// parser to steady state, returning the first framed block seen (if
    /// any) and handling every non-framed event via `on_event` along the
    /// way. Used both by [`Self::cc_exec`]'s blocking poll and by the
    /// event-loop-driven readable callback.
    pub fn drain(&mut self, mut on_event: impl FnMut(crate::protocol::EventKind, crate::scheduler::DirtyFlags)) -> Result<Option<CommandReply>> {
        rdavail::read_available(
            self.stdout_fd(),
            Destination::Ring(&mut self.ring, Format::Raw),
        )?;

        let mut reply = None;
        loop {
            match Parser::step(&mut self.ring) {
                None => break,
                Some(Parsed::Invalid) => continue,
                Some(Parsed::Event(kind, bits)) => on_event(kind, bits),
                Some(Parsed::Framed { payload, is_error }) => {
                    if self.expect_preamble {
                        self.expect_preamble = false;
                        continue;
                    }
                    reply = Some(CommandReply { payload, is_error });
                    break;
                }
            }
        }
        Ok(reply)
    }

    /// Sends `argv` without waiting for or capturing a reply. Used for
    /// `kill-session` on the temporary client once a real session appears
    /// (spec §4.5.1 step 6) — the client's own process exit is reaped via
    /// SIGCHLD rather than observed here.
    pub fn send_command(&mut self, argv: &[String]) -> Result<()> {
        self.send_line(argv)
    }

    fn send_line(&mut self, argv: &[String]) -> Result<()> {
        let mut line = quote_argv(argv);
        line.push('\n');
        write_all_retrying(self.stdin.as_raw_fd(), line.as_bytes())
    }
}

fn write_all_retrying(fd: RawFd, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        // SAFETY: `fd` is a valid, open descriptor owned by the caller for
        // the duration of this call.
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n > 0 {
            bytes = &bytes[n as usize..];
            continue;
        }
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::Interrupted => continue,
            std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            _ => return Err(err.into()),
        }
    }
    Ok(())
}

/// Serialises `argv` into the single-line form the mux control protocol
/// expects: each argument double-quoted, with embedded `"` and newline
/// escaped (spec §4.3 step 1, §9's `quote_argv`).
pub fn quote_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            let mut out = String::with_capacity(arg.len() + 2);
            out.push('"');
            for c in arg.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\n' => out.push_str("\\n"),
                    '\\' => out.push_str("\\\\"),
                    other => out.push(other),
                }
            }
            out.push('"');
            out
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inverse of [`quote_argv`], used by P6's round-trip test and nowhere in
/// the production path (the mux server itself never sends quoted argv back
/// to us).
pub fn unquote_argv(line: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(' ')) {
            chars.next();
        }
        match chars.peek() {
            None => break,
            Some('"') => chars.next(),
            _ => return None,
        };

        let mut arg = String::new();
        loop {
            match chars.next()? {
                '"' => break,
                '\\' => match chars.next()? {
                    '"' => arg.push('"'),
                    'n' => arg.push('\n'),
                    '\\' => arg.push('\\'),
                    other => arg.push(other),
                },
                c => arg.push(c),
            }
        }
        args.push(arg);
    }

    Some(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_unquote_round_trip() {
        let argv = vec!["a".to_string(), "b\"c".to_string(), "d\ne".to_string()];
        let quoted = quote_argv(&argv);
        let parsed = unquote_argv(&quoted).unwrap();
        assert_eq!(parsed, argv);
    }

    #[test]
    fn quote_format_is_space_separated_and_double_quoted() {
        let argv = vec!["foo".to_string(), "bar baz".to_string()];
        assert_eq!(quote_argv(&argv), r#""foo" "bar baz""#);
    }
}
