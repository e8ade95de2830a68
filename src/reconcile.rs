//! State reconciler (spec §4.5): rebuilds the four entity mappings from
//! authoritative `list-*` output and drives the closure queue.
//!
//! Every pass tolerates the mux server changing state mid-pass (spec §9's
//! "reconciler races" note): a failed pass simply re-arms its dirty bit so
//! the next wake retries, rather than trying to recover a torn read.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::events::{Closure, Observers};
use crate::eventloop::HasCore;
use crate::ids::{PaneId, SessionId, WindowId};
use crate::model::{Client, Pane, Session, StatusBarPosition, Window, TEMP_SESSION_NAME};
use crate::process::OptionTarget;
use crate::scheduler::DirtyFlags;
use crate::Core;

/// Fd-readiness callback for the process-wide SIGCHLD self-pipe (registered
/// once in `Core::connect`). Reaps every waitable child and, for each pid
/// that matches a control client, removes it and its fd source (spec §4.2,
/// property P7).
pub(crate) fn handle_sigchld<D: HasCore<D>>(core: &mut Core<D>) -> Result<()> {
    let reaped = match core.supervisor() {
        Some(s) => s.drain_sigchld()?,
        None => return Ok(()),
    };
    for (pid, _status) in reaped {
        if let Some(idx) = core.control_clients().iter().position(|c| c.pid == pid) {
            let mut client = core.control_clients_mut().remove(idx);
            if let Some(token) = client.fd_token.take() {
                crate::eventloop::remove(core.loop_handle(), token);
            }
            tracing::debug!(pid, "control client reaped");
        }
    }
    Ok(())
}

/// Fd-readiness callback for the refresh scheduler's self-pipe (spec §4.6).
pub(crate) fn drive_scheduler<D: HasCore<D>>(core: &mut Core<D>) -> Result<()> {
    let mask = core.scheduler().take_pending();
    dispatch(core, mask)
}

/// The cascade from spec §4.6: the highest-priority dirty bit set wins and
/// subsumes the bits its own pass recurses into; on failure the whole
/// snapshot of bits that were being serviced is re-queued so the next tick
/// retries.
pub(crate) fn dispatch<D: HasCore<D>>(core: &mut Core<D>, mask: DirtyFlags) -> Result<()> {
    if mask.is_empty() {
        return Ok(());
    }

    let result = if mask.contains(DirtyFlags::SESSIONS) {
        sessions_pass(core)
    } else if mask.contains(DirtyFlags::WINDOWS) {
        windows_pass(core)
    } else if mask.contains(DirtyFlags::PANES) {
        panes_pass(core)
    } else if mask.contains(DirtyFlags::CLIENTS) {
        clients_pass(core)
    } else {
        return Ok(());
    };

    match result {
        Ok(closures) => Observers::dispatch(core, closures),
        Err(e) => {
            tracing::warn!(error = %e, "reconciliation pass failed, re-arming");
            core.scheduler().queue_refresh(mask);
            Err(e)
        }
    }
}

/// Runs `args` through whichever non-temporary control client is attached,
/// if one exists, or forks a fresh one-shot process otherwise (spec §4.2's
/// `exec`). A non-zero exit or an error reply is swallowed as an empty
/// listing, matching §4.5's "treat the listing as empty" instruction for
/// listing commands specifically.
fn run_exec<D>(core: &mut Core<D>, args: &[String]) -> Result<Vec<u8>> {
    if let Some(idx) = core.control_clients().iter().position(|c| c.session.is_some()) {
        return core.exec_via_control_client(idx, args);
    }
    let prefix = core.config().command_prefix()?;
    match core.supervisor() {
        Some(supervisor) => match supervisor.run_one_shot(&prefix, args) {
            Ok((_, out)) => Ok(out),
            Err(Error::ChildFailed { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        },
        None => Err(Error::invalid("not connected")),
    }
}

/// The §4.5.5 side effect: a `new_session` closure launches that session's
/// control client before the user's own callback runs.
pub(crate) fn launch_control_client_for_session<D: HasCore<D>>(
    core: &mut Core<D>,
    id: SessionId,
) -> Result<()> {
    let name = core
        .model()
        .session(id)
        .map(|s| s.name.clone())
        .ok_or_else(|| Error::parse(format!("launch_control_client_for_session: unknown session {id}")))?;
    spawn_control_client(core, Some((id, name)))
}

fn launch_temp_control_client<D: HasCore<D>>(core: &mut Core<D>) -> Result<()> {
    spawn_control_client(core, None)
}

fn spawn_control_client<D: HasCore<D>>(
    core: &mut Core<D>,
    session: Option<(SessionId, String)>,
) -> Result<()> {
    let prefix = core.config().command_prefix()?;
    let (width, height) = (core.config().vt_width, core.config().vt_height);
    let mut client = {
        let supervisor = core
            .supervisor()
            .ok_or_else(|| Error::invalid("not connected"))?;
        crate::control::ControlClient::launch(supervisor, &prefix, session, TEMP_SESSION_NAME, width, height)?
    };
    let pid = client.pid;
    let fd = client.stdout_fd();
    let token = crate::eventloop::add_fd(core.loop_handle(), fd, move |core| {
        control_client_readable(core, pid)
    })?;
    client.fd_token = Some(token);
    core.control_clients_mut().push(client);
    Ok(())
}

fn control_client_readable<D: HasCore<D>>(core: &mut Core<D>, pid: i32) -> Result<()> {
    if let Some(idx) = core.control_clients().iter().position(|c| c.pid == pid) {
        core.drain_control_client_events(idx)?;
    }
    Ok(())
}

/// Resolves `status`/`status-position` at global and per-session scope
/// (spec §4.5.1 step 3). Collected with only immutable borrows of `core`
/// first, then applied, since `Supervisor::get_option` forks one-shot
/// processes per query and the model can't be mutated while that borrow is
/// live.
fn update_statusbars<D>(core: &mut Core<D>) -> Result<()> {
    let bars: Vec<(SessionId, StatusBarPosition)> = {
        let prefix = core.config().command_prefix()?;
        let supervisor = core
            .supervisor()
            .ok_or_else(|| Error::invalid("not connected"))?;
        let status_global = supervisor.get_option(&prefix, "status", OptionTarget::Server)?;
        let position_global = supervisor.get_option(&prefix, "status-position", OptionTarget::Server)?;
        let ids: Vec<SessionId> = core.model().sessions_map().keys().copied().collect();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let local_status =
                supervisor.get_option(&prefix, "status", OptionTarget::Session { id, global: false })?;
            let status_on = if local_status.is_empty() {
                status_global != "off"
            } else {
                local_status != "off"
            };
            let bar = if !status_on {
                StatusBarPosition::Off
            } else {
                let local_pos = supervisor.get_option(
                    &prefix,
                    "status-position",
                    OptionTarget::Session { id, global: false },
                )?;
                let pos = if local_pos.is_empty() { position_global.clone() } else { local_pos };
                if pos == "top" {
                    StatusBarPosition::Top
                } else {
                    StatusBarPosition::Bottom
                }
            };
            out.push((id, bar));
        }
        out
    };

    for (id, bar) in bars {
        if let Some(session) = core.model_mut().session_mut(id) {
            session.statusbar = bar;
        }
    }
    Ok(())
}

/// §4.5.1: sessions pass. Recurses into windows (which recurses into
/// panes) and clients, then manages the temporary session/control client.
fn sessions_pass<D: HasCore<D>>(core: &mut Core<D>) -> Result<Vec<Closure>> {
    let out = run_exec(
        core,
        &["list-sessions".to_string(), "-F".to_string(), "#{session_id} |#{session_name}".to_string()],
    )?;
    let text = String::from_utf8_lossy(&out);

    let mut new_rows = Vec::new();
    for line in text.lines() {
        if let Some((id_s, name)) = line.split_once(" |") {
            if let Some(id) = SessionId::parse(id_s) {
                new_rows.push((id, name.to_string()));
            }
        }
    }

    let mut closures = Vec::new();
    let existing_ids: Vec<SessionId> = core.model().sessions_map().keys().copied().collect();
    let new_ids: Vec<SessionId> = new_rows.iter().map(|(id, _)| *id).collect();

    for id in &existing_ids {
        if !new_ids.contains(id) {
            if let Some(session) = core.model_mut().remove_session(*id) {
                closures.push(Closure::SessionClosed(Box::new(session)));
            }
        }
    }

    let mut newly_added_non_temp = false;
    for (id, name) in &new_rows {
        if !existing_ids.contains(id) {
            core.model_mut().insert_session(Session::new(*id, name.clone()));
            if name != TEMP_SESSION_NAME {
                closures.push(Closure::NewSession(*id));
                newly_added_non_temp = true;
            }
        }
    }

    update_statusbars(core)?;

    closures.extend(windows_pass(core)?);
    closures.extend(clients_pass(core)?);

    let has_temp = core.control_clients().iter().any(|c| c.session.is_none());
    if core.model().non_temp_session_count() == 0 {
        if !has_temp {
            launch_temp_control_client(core)?;
        }
    } else if newly_added_non_temp && has_temp {
        if let Some(idx) = core.control_clients().iter().position(|c| c.session.is_none()) {
            core.control_clients_mut()[idx].send_command(&["kill-session".to_string()])?;
        }
    }

    Ok(closures)
}

/// §4.5.2: windows pass, recursing into panes.
fn windows_pass<D: HasCore<D>>(core: &mut Core<D>) -> Result<Vec<Closure>> {
    let out = run_exec(
        core,
        &[
            "list-windows".to_string(),
            "-aF".to_string(),
            "#{window_id} #{session_id} #{window_active}".to_string(),
        ],
    )?;
    let text = String::from_utf8_lossy(&out);

    let mut rows = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(wid_s), Some(sid_s), Some(active_s)) = (parts.next(), parts.next(), parts.next()) {
            if let (Some(wid), Some(sid)) = (WindowId::parse(wid_s), SessionId::parse(sid_s)) {
                rows.push((wid, sid, active_s == "1"));
            }
        }
    }

    let mut closures = Vec::new();
    let existing_ids: Vec<WindowId> = core.model().windows_map().keys().copied().collect();
    let new_ids: Vec<WindowId> = rows.iter().map(|(wid, _, _)| *wid).collect();

    for id in &existing_ids {
        if !new_ids.contains(id) {
            if let Some(window) = core.model_mut().remove_window(*id) {
                closures.push(Closure::WindowClosed(Box::new(window)));
            }
        }
    }
    for (wid, _, _) in &rows {
        if !existing_ids.contains(wid) {
            core.model_mut().insert_window(Window::new(*wid));
            closures.push(Closure::NewWindow(*wid));
        }
    }

    // The server lists a window once per session it belongs to; fold
    // duplicate rows for the same (session, window) pair here rather than
    // in the diff above (spec §4.5, "reconciler MUST tolerate duplicate
    // rows").
    let mut by_session: IndexMap<SessionId, Vec<WindowId>> = IndexMap::new();
    let mut active_by_session: HashMap<SessionId, WindowId> = HashMap::new();
    for (wid, sid, active) in &rows {
        let entry = by_session.entry(*sid).or_default();
        if !entry.contains(wid) {
            entry.push(*wid);
        }
        if *active {
            active_by_session.insert(*sid, *wid);
        }
    }

    for (sid, windows) in by_session {
        if let Some(session) = core.model_mut().session_mut(sid) {
            session.windows = windows;
            let new_active = active_by_session.get(&sid).copied();
            if new_active.is_some() && session.active_window != new_active {
                session.active_window = new_active;
                closures.push(Closure::SessionWindowChanged(sid));
            } else if new_active.is_none() {
                session.active_window = None;
            }
        }
    }

    closures.extend(panes_pass(core)?);
    Ok(closures)
}

/// §4.5.3: panes pass, including the pane-list rebuild and the layout
/// string geometry parse.
fn panes_pass<D>(core: &mut Core<D>) -> Result<Vec<Closure>> {
    let out = run_exec(
        core,
        &[
            "list-panes".to_string(),
            "-aF".to_string(),
            "#{pane_id} #{window_id} #{pane_active} #{pane_pid} #{pane_in_mode}".to_string(),
        ],
    )?;
    let text = String::from_utf8_lossy(&out);

    let mut rows = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(pid_s), Some(wid_s), Some(active_s), Some(proc_pid_s), Some(in_mode_s)) =
            (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
        {
            if let (Some(pane_id), Some(window_id)) = (PaneId::parse(pid_s), WindowId::parse(wid_s)) {
                let proc_pid: i32 = proc_pid_s.parse().unwrap_or(0);
                rows.push((pane_id, window_id, active_s == "1", proc_pid, in_mode_s == "1"));
            }
        }
    }

    let mut closures = Vec::new();
    let existing_ids: Vec<PaneId> = core.model().panes_map().keys().copied().collect();
    let new_ids: Vec<PaneId> = rows.iter().map(|(pid, _, _, _, _)| *pid).collect();

    for id in &existing_ids {
        if !new_ids.contains(id) {
            if let Some(pane) = core.model_mut().remove_pane(*id) {
                closures.push(Closure::PaneClosed(Box::new(pane)));
            }
        }
    }
    for (pid, _, _, proc_pid, _) in &rows {
        if !existing_ids.contains(pid) {
            core.model_mut().insert_pane(Pane::new(*pid, *proc_pid));
            closures.push(Closure::NewPane(*pid));
        }
    }

    for (pid, _, active, _, in_mode) in &rows {
        if let Some(pane) = core.model_mut().pane_mut(*pid) {
            pane.active = *active;
            if pane.in_mode != *in_mode {
                pane.in_mode = *in_mode;
                closures.push(Closure::PaneModeChanged(*pid));
            }
        }
    }

    let mut order: IndexMap<WindowId, Vec<PaneId>> = IndexMap::new();
    let mut active_by_window: HashMap<WindowId, PaneId> = HashMap::new();
    for (pane_id, window_id, active, _, _) in &rows {
        let entry = order.entry(*window_id).or_default();
        if !entry.contains(pane_id) {
            entry.push(*pane_id);
        }
        if *active {
            active_by_window.insert(*window_id, *pane_id);
        }
    }

    for (wid, pane_ids) in &order {
        let mut prev: Option<PaneId> = None;
        for (i, pid) in pane_ids.iter().enumerate() {
            if let Some(pane) = core.model_mut().pane_mut(*pid) {
                pane.parent = Some(*wid);
                pane.prev = prev;
                pane.next = pane_ids.get(i + 1).copied();
            }
            prev = Some(*pid);
        }
        if let Some(window) = core.model_mut().window_mut(*wid) {
            window.head = pane_ids.first().copied();
            window.pane_count = pane_ids.len();
            let new_active = active_by_window.get(wid).copied();
            if new_active.is_some() && window.active_pane != new_active {
                window.active_pane = new_active;
                closures.push(Closure::WindowPaneChanged(*wid));
            } else if new_active.is_none() {
                window.active_pane = None;
            }
        }
    }

    let layout_out = run_exec(
        core,
        &["list-windows".to_string(), "-aF".to_string(), "#{window_visible_layout}".to_string()],
    )?;
    let layout_text = String::from_utf8_lossy(&layout_out);

    let mut seen_panes: HashSet<PaneId> = HashSet::new();
    for line in layout_text.lines() {
        for (pid, x, y, w, h) in parse_layout_leaves(line) {
            let pane_id = PaneId(pid);
            seen_panes.insert(pane_id);
            if let Some(pane) = core.model_mut().pane_mut(pane_id) {
                if pane.geometry() != (x, y, w, h) {
                    pane.x = x;
                    pane.y = y;
                    pane.w = w;
                    pane.h = h;
                    closures.push(Closure::PaneResized(pane_id));
                }
            }
        }
    }

    // Panes listed in step 1 but absent from every layout line are the
    // server's way of reporting zero geometry (spec §4.5.3 step 5).
    let unresized: Vec<PaneId> = core
        .model()
        .panes_map()
        .keys()
        .copied()
        .filter(|pid| !seen_panes.contains(pid))
        .collect();
    for pid in unresized {
        if let Some(pane) = core.model_mut().pane_mut(pid) {
            if pane.geometry() != (0, 0, 0, 0) {
                pane.x = 0;
                pane.y = 0;
                pane.w = 0;
                pane.h = 0;
                closures.push(Closure::PaneResized(pid));
            }
        }
    }

    Ok(closures)
}

/// Flat left-to-right scan over `<checksum>,<w>x<h>,<x>,<y>[,pid|{…}|[…]]`
/// (spec §4.5.3 step 4). No explicit stack is needed: every leaf pane
/// carries its own complete geometry quad regardless of container nesting,
/// so container open/close brackets only ever gate whether the next quad
/// starts a sibling or a child — they never supply geometry a leaf would
/// have to inherit.
fn parse_layout_leaves(line: &str) -> Vec<(u32, u32, u32, u32, u32)> {
    let bytes = line.as_bytes();
    let mut i = 0;
    let mut leaves = Vec::new();

    while i < bytes.len() && bytes[i] != b',' {
        i += 1;
    }
    if i < bytes.len() {
        i += 1;
    }

    loop {
        while i < bytes.len() && matches!(bytes[i], b'}' | b']' | b',') {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        let (w, ni) = parse_u32(bytes, i);
        i = ni;
        if i >= bytes.len() || bytes[i] != b'x' {
            break;
        }
        i += 1;
        let (h, ni) = parse_u32(bytes, i);
        i = ni;
        if i >= bytes.len() || bytes[i] != b',' {
            break;
        }
        i += 1;
        let (x, ni) = parse_u32(bytes, i);
        i = ni;
        if i >= bytes.len() || bytes[i] != b',' {
            break;
        }
        i += 1;
        let (y, ni) = parse_u32(bytes, i);
        i = ni;
        if i >= bytes.len() {
            break;
        }

        match bytes[i] {
            b',' => {
                i += 1;
                let (pid, ni) = parse_u32(bytes, i);
                i = ni;
                leaves.push((pid, x, y, w, h));
            }
            b'{' | b'[' => {
                i += 1;
            }
            _ => break,
        }
    }

    leaves
}

fn parse_u32(bytes: &[u8], mut i: usize) -> (u32, usize) {
    let start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let value = std::str::from_utf8(&bytes[start..i]).ok().and_then(|s| s.parse().ok()).unwrap_or(0);
    (value, i)
}

/// §4.5.4: clients pass.
fn clients_pass<D>(core: &mut Core<D>) -> Result<Vec<Closure>> {
    let out = run_exec(
        core,
        &["list-clients".to_string(), "-F".to_string(), "#{session_id} #{client_pid} |#{client_name}".to_string()],
    )?;
    let text = String::from_utf8_lossy(&out);

    let mut rows = Vec::new();
    for line in text.lines() {
        if let Some((head, name)) = line.split_once(" |") {
            let mut parts = head.split_whitespace();
            if let (Some(sid_s), Some(pid_s)) = (parts.next(), parts.next()) {
                if let (Some(sid), Ok(pid)) = (SessionId::parse(sid_s), pid_s.parse::<i32>()) {
                    rows.push((sid, pid, name.to_string()));
                }
            }
        }
    }

    let mut closures = Vec::new();
    let existing_names: Vec<String> = core.model().clients_map().keys().cloned().collect();
    let new_names: Vec<String> = rows.iter().map(|(_, _, name)| name.clone()).collect();

    for name in &existing_names {
        if !new_names.contains(name) {
            core.model_mut().remove_client(name);
        }
    }

    for (sid, pid, name) in &rows {
        if core.model().client(name).is_none() {
            core.model_mut().insert_client(Client::new(name.clone(), *pid));
        }
        let prev_session = core.model().client(name).and_then(|c| c.session);
        if prev_session != Some(*sid) {
            if let Some(client) = core.model_mut().client_mut(name) {
                client.session = Some(*sid);
            }
            closures.push(Closure::ClientSessionChanged(name.clone()));
        }
    }

    let mut by_session: IndexMap<SessionId, Vec<String>> = IndexMap::new();
    for (sid, _, name) in &rows {
        by_session.entry(*sid).or_default().push(name.clone());
    }
    let session_ids: Vec<SessionId> = core.model().sessions_map().keys().copied().collect();
    for sid in session_ids {
        let names = by_session.shift_remove(&sid).unwrap_or_default();
        if let Some(session) = core.model_mut().session_mut(sid) {
            session.clients = names;
        }
    }

    Ok(closures)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_s2_layout() {
        let leaves = parse_layout_leaves("abcd,80x24,0,0{40x24,0,0,1,40x24,40,0,2}");
        assert_eq!(leaves, vec![(1, 0, 0, 40, 24), (2, 40, 0, 40, 24)]);
    }

    #[test]
    fn parses_s3_updated_layout() {
        let leaves = parse_layout_leaves("abcd,80x24,0,0{60x24,0,0,1,20x24,60,0,2}");
        assert_eq!(leaves, vec![(1, 0, 0, 60, 24), (2, 60, 0, 20, 24)]);
    }

    #[test]
    fn parses_single_leaf_layout() {
        let leaves = parse_layout_leaves("abcd,80x24,0,0,1");
        assert_eq!(leaves, vec![(1, 0, 0, 80, 24)]);
    }

    /// Scenario S2 end-to-end: drives a real `Core` through `connect`
    /// against a scripted mux and checks the headline closures it queues.
    /// This is the test that would have caught `windows_pass` silently
    /// dropping `Closure::NewWindow`.
    mod s2_end_to_end {
        use crate::eventloop::HasCore;
        use crate::ids::{PaneId, SessionId, WindowId};
        use crate::testing::{FakeMux, RecordedEvent, RecordingObservers};
        use crate::Core;

        struct Harness {
            core: Core<Harness>,
        }

        impl HasCore<Harness> for Harness {
            fn core_mut(&mut self) -> &mut Core<Harness> {
                &mut self.core
            }
        }

        #[test]
        fn connect_queues_s2_closures() {
            // Patterns are plain `sh` case patterns: every literal `#` that
            // starts a word must be backslash-escaped (it would otherwise
            // open a shell comment, truncating the pattern) and so must
            // every literal `$` (parameter expansion) and top-level `|`
            // (case alternation).
            let mux = FakeMux::new(&[
                ("-V", "tmux 3.3a\n"),
                (
                    r"list-sessions -F \#{session_id} \|#{session_name}",
                    "$0 |alpha\n",
                ),
                (
                    r"list-windows -aF \#{window_id} \#{session_id} \#{window_active}",
                    "@1 $0 1\n",
                ),
                (
                    r"list-panes -aF \#{pane_id} \#{window_id} \#{pane_active} \#{pane_pid} \#{pane_in_mode}",
                    "%1 @1 1 1234 0\n%2 @1 0 5678 0\n",
                ),
                (
                    r"list-windows -aF \#{window_visible_layout}",
                    "abcd,80x24,0,0{40x24,0,0,1,40x24,40,0,2}\n",
                ),
                (r"-C attach-session -t \$0", ""),
            ])
            .unwrap();

            let event_loop: calloop::EventLoop<Harness> = calloop::EventLoop::try_new().unwrap();
            let mut harness = Harness {
                core: Core::new(event_loop.handle()).unwrap(),
            };
            harness.core.set_binary(mux.binary_path()).unwrap();

            let recorder = RecordingObservers::new();
            recorder.install(harness.core.observers_mut());

            harness.core.connect().unwrap();

            let events = recorder.events();
            assert!(events.contains(&RecordedEvent::NewSession(SessionId(0))));
            assert!(events.contains(&RecordedEvent::NewWindow(WindowId(1))));
            assert!(events.contains(&RecordedEvent::NewPane(PaneId(1))));
            assert!(events.contains(&RecordedEvent::NewPane(PaneId(2))));
            assert!(events.contains(&RecordedEvent::PaneResized(PaneId(1))));
            assert!(events.contains(&RecordedEvent::PaneResized(PaneId(2))));

            let session = harness.core.model().root_session().unwrap();
            assert_eq!(session.windows, vec![WindowId(1)]);
            let window = harness.core.model().window(WindowId(1)).unwrap();
            assert_eq!(window.pane_count, 2);
        }
    }
}
