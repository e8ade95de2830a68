//! Ambient test harness (spec §4.10): fakes and recorders for driving the
//! crate without forking a real tmux-compatible binary.
//!
//! Enabled for `cfg(test)` and for downstream crates that opt into the
//! `testing` feature, keeping these fixtures out of normal release builds.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::events::Observers;
use crate::ids::{ClientName, PaneId, SessionId, WindowId};
use crate::protocol::Parsed;
use crate::ring::RingBuffer;

/// One observer invocation, as seen by [`RecordingObservers`]. Mirrors
/// [`crate::events::Closure`] but by value, with no tie to any particular
/// `Core<D>`, so assertions don't need a live core to compare against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    ClientSessionChanged(ClientName),
    NewSession(SessionId),
    SessionClosed(SessionId),
    SessionWindowChanged(SessionId),
    NewWindow(WindowId),
    WindowClosed(WindowId),
    WindowPaneChanged(WindowId),
    NewPane(PaneId),
    PaneClosed(PaneId),
    PaneResized(PaneId),
    PaneModeChanged(PaneId),
}

/// Installs itself onto an [`Observers`] set and appends every dispatched
/// event to a shared log in order, for asserting P4/P5-style ordering
/// invariants (spec §8) without hand-writing eleven closures per test.
#[derive(Default, Clone)]
pub struct RecordingObservers {
    log: Rc<RefCell<Vec<RecordedEvent>>>,
}

impl RecordingObservers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wires every callback slot on `observers` to push into this
    /// recorder's log. `D` is left fully generic: the recorded event
    /// carries only the id/name the real observer would have received, not
    /// the `&mut Core<D>` itself, so tests don't need a concrete `D`.
    pub fn install<D>(&self, observers: &mut Observers<D>) {
        macro_rules! wire {
            ($slot:ident, $variant:ident) => {{
                let log = self.log.clone();
                observers.$slot = Some(Box::new(move |_core, arg| {
                    log.borrow_mut().push(RecordedEvent::$variant(arg));
                    Ok(())
                }));
            }};
            // The `*Closed` slots hand over the owned entity (see
            // `Closure`'s doc comment); the recorder only needs its id.
            ($slot:ident, $variant:ident, id: $id_expr:expr) => {{
                let log = self.log.clone();
                observers.$slot = Some(Box::new(move |_core, arg| {
                    log.borrow_mut().push(RecordedEvent::$variant($id_expr(&arg)));
                    Ok(())
                }));
            }};
        }

        wire!(client_session_changed, ClientSessionChanged);
        wire!(new_session, NewSession);
        wire!(session_closed, SessionClosed, id: |s: &crate::model::Session| s.id);
        wire!(session_window_changed, SessionWindowChanged);
        wire!(new_window, NewWindow);
        wire!(window_closed, WindowClosed, id: |w: &crate::model::Window| w.id);
        wire!(window_pane_changed, WindowPaneChanged);
        wire!(new_pane, NewPane);
        wire!(pane_closed, PaneClosed, id: |p: &crate::model::Pane| p.id);
        wire!(pane_resized, PaneResized);
        wire!(pane_mode_changed, PaneModeChanged);
    }

    /// The log in dispatch order, without draining it.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.log.borrow().clone()
    }

    /// The log in dispatch order, clearing it.
    pub fn take(&self) -> Vec<RecordedEvent> {
        self.log.borrow_mut().drain(..).collect()
    }
}

/// Pushes `bytes` into a fresh ring and runs [`crate::protocol::Parser`] to
/// steady state, for reproducing the framing edge cases in spec §8's
/// scenarios (in particular S6's mismatched-triple case) with no process
/// involved at all.
pub fn parse_all(bytes: &[u8]) -> Result<Vec<Parsed>> {
    let mut ring = RingBuffer::new();
    ring.push(bytes)?;
    let mut out = Vec::new();
    while let Some(parsed) = crate::protocol::Parser::step(&mut ring) {
        out.push(parsed);
    }
    Ok(out)
}

/// A tiny script-driven stand-in for the mux binary (spec §4.10). Backed by
/// a generated `/bin/sh` script implementing a `case "$*" in …` dispatch
/// over canned (argument-pattern, stdout) pairs, so reconciler passes
/// (§4.5) can be driven deterministically against real `Supervisor::fork`
/// plumbing without a real tmux-compatible binary on `$PATH`.
///
/// Patterns are plain `sh` `case` patterns matched against the whole
/// argument vector joined with spaces (so `*` and `?` work as usual); the
/// first match wins. Anything unmatched exits 1 with no output.
pub struct FakeMux {
    script_path: std::path::PathBuf,
}

impl FakeMux {
    pub fn new(responses: &[(&str, &str)]) -> std::io::Result<Self> {
        let mut script = String::from("#!/bin/sh\ncase \"$*\" in\n");
        for (pattern, output) in responses {
            let escaped = output.replace('\'', "'\\''");
            script.push_str(&format!("  {pattern})\n    printf '%s' '{escaped}'\n    ;;\n"));
        }
        script.push_str("  *)\n    exit 1\n    ;;\nesac\n");
        // Mirrors a real control-mode attach: once matched, keep reading
        // stdin until the caller closes it rather than exiting right away.
        // Harmless for one-shot commands, whose stdin is always /dev/null.
        script.push_str("cat >/dev/null\n");

        let path = std::env::temp_dir().join(format!(
            "muxsync-fakemux-{}-{}",
            std::process::id(),
            next_unique_id()
        ));
        std::fs::write(&path, script)?;
        let mut perms = std::fs::metadata(&path)?.permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&path, perms)?;

        Ok(Self { script_path: path })
    }

    pub fn binary_path(&self) -> &std::path::Path {
        &self.script_path
    }
}

impl Drop for FakeMux {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.script_path);
    }
}

fn next_unique_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_mux_replies_to_matching_args() {
        let mux = FakeMux::new(&[("-V", "tmux 3.3a\n")]).unwrap();
        let out = std::process::Command::new(mux.binary_path())
            .arg("-V")
            .stdin(std::process::Stdio::null())
            .output()
            .unwrap();
        assert_eq!(out.stdout, b"tmux 3.3a\n");
        assert!(out.status.success());
    }

    #[test]
    fn fake_mux_exits_nonzero_on_unmatched_args() {
        let mux = FakeMux::new(&[("-V", "tmux 3.3a\n")]).unwrap();
        let out = std::process::Command::new(mux.binary_path())
            .arg("list-sessions")
            .stdin(std::process::Stdio::null())
            .output()
            .unwrap();
        assert!(!out.status.success());
    }

    #[test]
    fn parse_all_recovers_s6_framing() {
        let bytes = b"%begin 1700000000 42 0\nok\n%end 1700000000 42 0\n\
%begin 1700000001 43 0\nfoo\n%end 1700000001 99 0\nstill payload\n%end 1700000001 43 0\n";
        let parsed = parse_all(bytes).unwrap();
        let framed: Vec<_> = parsed
            .into_iter()
            .filter_map(|p| match p {
                Parsed::Framed { payload, is_error } => Some((payload, is_error)),
                _ => None,
            })
            .collect();
        assert_eq!(framed.len(), 2);
        assert_eq!(framed[0].0, b"ok\n");
        assert!(!framed[0].1);
        assert_eq!(
            framed[1].0,
            b"foo\n%end 1700000001 99 0\nstill payload\n".to_vec()
        );
    }
}
