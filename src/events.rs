//! Observer callback slots and the closure queue (spec §4.5.5 / §4.6, and
//! the "tagged closures" design note in §9).
//!
//! Every callback is an `Option<Box<dyn FnMut(...)>>` slot on
//! [`Observers`]; a nil slot means "the consumer doesn't care about this
//! event". [`Closure`] is the tagged union recorded while a reconciliation
//! pass runs; [`Observers::dispatch`] replays a whole queue in order once
//! the pass that produced it has fully succeeded.

use crate::error::Result;
use crate::ids::{ClientName, PaneId, SessionId, WindowId};
use crate::model::{Pane, Session, Window};

/// One queued observer invocation, recorded during a reconciliation pass
/// and replayed only after that pass succeeds in full (spec §5, "closures
/// are invoked only after the pass that generated them succeeds").
///
/// The three `*Closed` variants carry the entity itself rather than its id
/// (spec §9, "tagged closures ... carrying either an owned entity, delivered
/// once then freed, or a borrowed key into the mapping"): by the time the
/// closure is dispatched the id has already been removed from the model, so
/// an id alone would leave the observer nothing to inspect.
#[derive(Debug, Clone)]
pub enum Closure {
    ClientSessionChanged(ClientName),
    NewSession(SessionId),
    SessionClosed(Box<Session>),
    SessionWindowChanged(SessionId),
    NewWindow(WindowId),
    WindowClosed(Box<Window>),
    WindowPaneChanged(WindowId),
    NewPane(PaneId),
    PaneClosed(Box<Pane>),
    PaneResized(PaneId),
    PaneModeChanged(PaneId),
}

type Callback<D, T> = Box<dyn FnMut(&mut crate::Core<D>, T) -> Result<()>>;

/// The observer callback set from spec §4.6. Every slot is independently
/// nil-able; a `None` slot is simply skipped during dispatch.
///
/// Generic over `D`, the consumer's own `calloop` event-loop data type
/// (spec §5): callbacks receive `&mut Core<D>` so they can reach back into
/// the loop's shared state the same way the rest of the consumer's
/// `calloop` sources do.
pub struct Observers<D> {
    pub client_session_changed: Option<Callback<D, ClientName>>,
    pub new_session: Option<Callback<D, SessionId>>,
    pub session_closed: Option<Callback<D, Box<Session>>>,
    pub session_window_changed: Option<Callback<D, SessionId>>,
    pub new_window: Option<Callback<D, WindowId>>,
    pub window_closed: Option<Callback<D, Box<Window>>>,
    pub window_pane_changed: Option<Callback<D, WindowId>>,
    pub new_pane: Option<Callback<D, PaneId>>,
    pub pane_closed: Option<Callback<D, Box<Pane>>>,
    pub pane_resized: Option<Callback<D, PaneId>>,
    pub pane_mode_changed: Option<Callback<D, PaneId>>,
}

impl<D> Default for Observers<D> {
    fn default() -> Self {
        Self {
            client_session_changed: None,
            new_session: None,
            session_closed: None,
            session_window_changed: None,
            new_window: None,
            window_closed: None,
            window_pane_changed: None,
            new_pane: None,
            pane_closed: None,
            pane_resized: None,
            pane_mode_changed: None,
        }
    }
}

impl<D: crate::eventloop::HasCore<D>> Observers<D> {
    /// Replays `queue` in order. Per spec §5/§7, if a callback returns an
    /// error the remaining queue is dropped and the error propagates — the
    /// caller (the refresh scheduler) is responsible for re-arming whatever
    /// dirty bits correspond to the unplayed tail, but that tail itself is
    /// not retried verbatim since the entities it names may already be
    /// gone by the next pass.
    pub fn dispatch(core: &mut crate::Core<D>, queue: Vec<Closure>) -> Result<()> {
        for closure in queue {
            tracing::debug!(?closure, "dispatching observer closure");
            Self::dispatch_one(core, closure)?;
        }
        Ok(())
    }

    fn dispatch_one(core: &mut crate::Core<D>, closure: Closure) -> Result<()> {
        // The callback is taken out of its slot for the duration of the
        // call so that a callback which (incorrectly) tries to register a
        // new one of the same kind doesn't recurse into itself, and so the
        // borrow checker lets the callback take `&mut core.observers` too.
        macro_rules! fire {
            ($slot:ident, $arg:expr) => {{
                if let Some(mut cb) = core.observers.$slot.take() {
                    let res = cb(core, $arg);
                    core.observers.$slot = Some(cb);
                    res?;
                }
            }};
        }

        if let Closure::NewSession(id) = closure {
            crate::reconcile::launch_control_client_for_session(core, id)?;
        }

        match closure {
            Closure::ClientSessionChanged(name) => fire!(client_session_changed, name),
            Closure::NewSession(id) => fire!(new_session, id),
            Closure::SessionClosed(session) => fire!(session_closed, session),
            Closure::SessionWindowChanged(id) => fire!(session_window_changed, id),
            Closure::NewWindow(id) => fire!(new_window, id),
            Closure::WindowClosed(window) => fire!(window_closed, window),
            Closure::WindowPaneChanged(id) => fire!(window_pane_changed, id),
            Closure::NewPane(id) => fire!(new_pane, id),
            Closure::PaneClosed(pane) => fire!(pane_closed, pane),
            Closure::PaneResized(id) => fire!(pane_resized, id),
            Closure::PaneModeChanged(id) => fire!(pane_mode_changed, id),
        }
        Ok(())
    }
}
