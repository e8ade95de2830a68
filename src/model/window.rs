use crate::ids::{PaneId, WindowId};

/// A window, owning a linked list of panes (spec §3).
#[derive(Debug, Clone)]
pub struct Window {
    pub id: WindowId,
    pub active_pane: Option<PaneId>,
    pub pane_count: usize,
    pub head: Option<PaneId>,
}

impl Window {
    pub(crate) fn new(id: WindowId) -> Self {
        Self {
            id,
            active_pane: None,
            pane_count: 0,
            head: None,
        }
    }
}
