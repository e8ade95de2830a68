//! The four entity mappings plus the key-table mapping (spec §3, §4.1).
//!
//! Entities live only here; every cross-reference elsewhere in the crate
//! is a plain id, not a pointer, and is rebuilt from scratch on each
//! reconciliation pass (spec §9's "external storage + stable handles"
//! discipline).

pub mod client;
pub mod keytable;
pub mod pane;
pub mod session;
pub mod window;

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::ids::{ClientName, PaneId, SessionId, WindowId};

pub use client::Client;
pub use keytable::{KeyBinding, KeyTable};
pub use pane::Pane;
pub use session::{Session, StatusBarPosition};
pub use window::Window;

/// Name used for the internal session created so a control client can
/// exist even when the mux server has zero real sessions (spec §3 I6,
/// glossary "Temporary session"). Chosen to be exceedingly unlikely to
/// collide with a user's own session name.
pub const TEMP_SESSION_NAME: &str = "__muxsync_temporary__";

#[derive(Default)]
pub struct Model {
    sessions: IndexMap<SessionId, Session>,
    windows: HashMap<WindowId, Window>,
    panes: HashMap<PaneId, Pane>,
    clients: HashMap<ClientName, Client>,
    key_tables: HashMap<String, KeyTable>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    // --- lookup ---------------------------------------------------------

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn window(&self, id: WindowId) -> Option<&Window> {
        self.windows.get(&id)
    }

    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut Window> {
        self.windows.get_mut(&id)
    }

    pub fn pane(&self, id: PaneId) -> Option<&Pane> {
        self.panes.get(&id)
    }

    pub fn pane_mut(&mut self, id: PaneId) -> Option<&mut Pane> {
        self.panes.get_mut(&id)
    }

    pub fn client(&self, name: &str) -> Option<&Client> {
        self.clients.get(name)
    }

    pub fn client_mut(&mut self, name: &str) -> Option<&mut Client> {
        self.clients.get_mut(name)
    }

    pub fn key_table(&self, name: &str) -> Option<&KeyTable> {
        self.key_tables.get(name)
    }

    /// The first session in insertion order (spec §4.1, `root_session`).
    /// Insertion order tracks the order sessions were first observed by a
    /// reconciliation pass, which for a freshly connected core is the order
    /// `list-sessions` printed them in.
    pub fn root_session(&self) -> Option<&Session> {
        self.sessions.get_index(0).map(|(_, s)| s)
    }

    /// All non-temporary sessions, in insertion order.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions
            .values()
            .filter(|s| s.name != TEMP_SESSION_NAME)
    }

    pub fn windows(&self) -> impl Iterator<Item = &Window> {
        self.windows.values()
    }

    pub fn panes(&self) -> impl Iterator<Item = &Pane> {
        self.panes.values()
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn non_temp_session_count(&self) -> usize {
        self.sessions().count()
    }

    // --- mutation, used only by the reconciler (crate-visible) ----------

    pub(crate) fn sessions_map(&self) -> &IndexMap<SessionId, Session> {
        &self.sessions
    }

    pub(crate) fn insert_session(&mut self, s: Session) {
        self.sessions.insert(s.id, s);
    }

    pub(crate) fn remove_session(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.shift_remove(&id)
    }

    pub(crate) fn windows_map(&self) -> &HashMap<WindowId, Window> {
        &self.windows
    }

    pub(crate) fn insert_window(&mut self, w: Window) {
        self.windows.insert(w.id, w);
    }

    pub(crate) fn remove_window(&mut self, id: WindowId) -> Option<Window> {
        self.windows.remove(&id)
    }

    pub(crate) fn panes_map(&self) -> &HashMap<PaneId, Pane> {
        &self.panes
    }

    pub(crate) fn insert_pane(&mut self, p: Pane) {
        self.panes.insert(p.id, p);
    }

    pub(crate) fn remove_pane(&mut self, id: PaneId) -> Option<Pane> {
        self.panes.remove(&id)
    }

    pub(crate) fn clients_map(&self) -> &HashMap<ClientName, Client> {
        &self.clients
    }

    pub(crate) fn insert_client(&mut self, c: Client) {
        self.clients.insert(c.name.clone(), c);
    }

    pub(crate) fn remove_client(&mut self, name: &str) -> Option<Client> {
        self.clients.remove(name)
    }

    pub(crate) fn key_tables_mut(&mut self) -> &mut HashMap<String, KeyTable> {
        &mut self.key_tables
    }

    /// Checks the invariants from spec §3/§8 (P1-P3). Intended for tests
    /// and debug assertions, not the hot reconciliation path.
    #[cfg(any(test, feature = "testing"))]
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        for window in self.windows.values() {
            let mut seen = std::collections::HashSet::new();
            let mut cursor = window.head;
            while let Some(pid) = cursor {
                if !seen.insert(pid) {
                    return Err(format!("window {} pane list cycles at {pid}", window.id));
                }
                let pane = self
                    .panes
                    .get(&pid)
                    .ok_or_else(|| format!("window {} lists missing pane {pid}", window.id))?;
                if pane.parent != Some(window.id) {
                    return Err(format!(
                        "pane {pid} claims parent {:?}, window {} lists it",
                        pane.parent, window.id
                    ));
                }
                cursor = pane.next;
            }
            if seen.len() != window.pane_count {
                return Err(format!(
                    "window {} pane_count={} but list has {}",
                    window.id,
                    window.pane_count,
                    seen.len()
                ));
            }
            if let Some(active) = window.active_pane {
                if !seen.contains(&active) {
                    return Err(format!(
                        "window {} active_pane {active} not in its own list",
                        window.id
                    ));
                }
            }
        }

        for session in self.sessions.values() {
            let mut seen = std::collections::HashSet::new();
            for wid in &session.windows {
                if !seen.insert(*wid) {
                    return Err(format!("session {} lists window {wid} twice", session.id));
                }
            }
        }

        Ok(())
    }
}
