use crate::ids::{PaneId, WindowId};

/// A single pane within a window (spec §3).
///
/// `next`/`prev` give the intrusive doubly-linked order within the parent
/// window's pane list; both are rebuilt from scratch by every panes pass
/// (§4.5.3) rather than patched in place, per the "external storage, rebuilt
/// relations" discipline in §9.
#[derive(Debug, Clone)]
pub struct Pane {
    pub id: PaneId,
    pub root_pid: i32,
    pub active: bool,
    pub in_mode: bool,
    pub parent: Option<WindowId>,
    pub next: Option<PaneId>,
    pub prev: Option<PaneId>,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Pane {
    pub(crate) fn new(id: PaneId, root_pid: i32) -> Self {
        Self {
            id,
            root_pid,
            active: false,
            in_mode: false,
            parent: None,
            next: None,
            prev: None,
            x: 0,
            y: 0,
            w: 0,
            h: 0,
        }
    }

    pub fn geometry(&self) -> (u32, u32, u32, u32) {
        (self.x, self.y, self.w, self.h)
    }
}
