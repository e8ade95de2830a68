//! Mirrors the live state of a tmux-compatible mux server's control-mode
//! stream into an in-process object model (spec §1/§2).
//!
//! [`Core`] is the single public handle. It owns no thread of its own: it is
//! generic over `D`, the consumer's own `calloop` event-loop data type
//! (§5), and is driven entirely from callbacks the consumer's loop invokes.
//! There is no manual refcounting API — `Core` is plain-owned and its
//! `Drop` impl performs the final disconnect.

pub mod config;
pub mod control;
pub mod error;
pub mod eventloop;
pub mod events;
pub mod ids;
#[macro_use]
pub mod logging;
pub mod model;
pub mod process;
pub mod protocol;
pub mod rdavail;
pub mod reconcile;
pub mod ring;
pub mod scheduler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod version;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use calloop::{LoopHandle, RegistrationToken};

use crate::config::Config;
use crate::control::ControlClient;
use crate::error::{Error, Result};
use crate::eventloop::HasCore;
use crate::events::{Closure, Observers};
use crate::ids::{ClientName, PaneId, SessionId, WindowId};
use crate::model::Model;
use crate::process::Supervisor;
use crate::scheduler::{DirtyFlags, RefreshScheduler};

/// Forbids two connected cores in the same process (spec §9: "forbid two
/// cores in the same process"), since `Supervisor::new` installs a single
/// process-wide SIGCHLD handler.
static ANY_CORE_CONNECTED: AtomicBool = AtomicBool::new(false);

/// Registration tokens for the sources a connected core owns, so
/// `disconnect` can tear them all down.
#[derive(Default)]
struct Sources {
    sigchld: Option<RegistrationToken>,
    scheduler: Option<RegistrationToken>,
}

/// The core's public handle (spec §4.1).
///
/// Generic over `D`, the consumer's `calloop` event-loop data type; `D`
/// must implement [`HasCore<D>`] so the fd sources this core registers can
/// find their way back to `self` from inside a `calloop` callback, which
/// only ever hands them `&mut D`.
pub struct Core<D> {
    loop_handle: LoopHandle<'static, D>,
    config: Config,
    model: Model,
    observers: Observers<D>,
    scheduler: RefreshScheduler,
    supervisor: Option<Supervisor>,
    control_clients: Vec<ControlClient>,
    version: Option<semver::Version>,
    sources: Sources,
}

impl<D> Core<D> {
    /// Empty core with the defaults from spec §4.1: 5000 ms timeout, 80×24
    /// virtual terminal, no binary/socket/config file, disconnected.
    pub fn new(loop_handle: LoopHandle<'static, D>) -> Result<Self> {
        Ok(Self {
            loop_handle,
            config: Config::default(),
            model: Model::new(),
            observers: Observers::default(),
            scheduler: RefreshScheduler::new()?,
            supervisor: None,
            control_clients: Vec::new(),
            version: None,
            sources: Sources::default(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor.is_some()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    fn require_idle(&self, what: &'static str) -> Result<()> {
        if self.is_connected() {
            Err(Error::Busy(what))
        } else {
            Ok(())
        }
    }

    // --- setters (spec §4.1: fail with Busy while connected, except size) --

    pub fn set_binary(&mut self, path: impl Into<std::path::PathBuf>) -> Result<()> {
        self.require_idle("binary")?;
        self.config.binary = Some(path.into());
        Ok(())
    }

    pub fn set_socket_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.require_idle("socket")?;
        self.config.set_socket_name(name);
        Ok(())
    }

    pub fn set_socket_path(&mut self, path: impl Into<std::path::PathBuf>) -> Result<()> {
        self.require_idle("socket")?;
        self.config.set_socket_path(path);
        Ok(())
    }

    pub fn set_config_file(&mut self, path: impl Into<std::path::PathBuf>) -> Result<()> {
        self.require_idle("config_file")?;
        self.config.config_file = Some(path.into());
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.require_idle("timeout")?;
        self.config.timeout_ms = timeout.as_millis() as u64;
        Ok(())
    }

    /// Unlike the other setters, this takes effect immediately and is
    /// replayed to every live control client (spec §4.1/§4.3).
    pub fn set_size(&mut self, width: u32, height: u32) -> Result<()> {
        self.config.set_size(width, height)?;
        for client in &mut self.control_clients {
            client.update_size(width, height)?;
        }
        Ok(())
    }

    pub fn root_session(&self) -> Option<&model::Session> {
        self.model.root_session()
    }

    // --- observer registration (spec §4.6) ----------------------------

    pub fn on_client_session_changed(
        &mut self,
        cb: impl FnMut(&mut Core<D>, ClientName) -> Result<()> + 'static,
    ) -> Result<()> {
        self.require_idle("client_session_changed observer")?;
        self.observers.client_session_changed = Some(Box::new(cb));
        Ok(())
    }

    pub fn on_new_session(
        &mut self,
        cb: impl FnMut(&mut Core<D>, SessionId) -> Result<()> + 'static,
    ) -> Result<()> {
        self.require_idle("new_session observer")?;
        self.observers.new_session = Some(Box::new(cb));
        Ok(())
    }

    pub fn on_session_closed(
        &mut self,
        cb: impl FnMut(&mut Core<D>, Box<model::Session>) -> Result<()> + 'static,
    ) -> Result<()> {
        self.require_idle("session_closed observer")?;
        self.observers.session_closed = Some(Box::new(cb));
        Ok(())
    }

    pub fn on_session_window_changed(
        &mut self,
        cb: impl FnMut(&mut Core<D>, SessionId) -> Result<()> + 'static,
    ) -> Result<()> {
        self.require_idle("session_window_changed observer")?;
        self.observers.session_window_changed = Some(Box::new(cb));
        Ok(())
    }

    pub fn on_new_window(
        &mut self,
        cb: impl FnMut(&mut Core<D>, WindowId) -> Result<()> + 'static,
    ) -> Result<()> {
        self.require_idle("new_window observer")?;
        self.observers.new_window = Some(Box::new(cb));
        Ok(())
    }

    pub fn on_window_closed(
        &mut self,
        cb: impl FnMut(&mut Core<D>, Box<model::Window>) -> Result<()> + 'static,
    ) -> Result<()> {
        self.require_idle("window_closed observer")?;
        self.observers.window_closed = Some(Box::new(cb));
        Ok(())
    }

    pub fn on_window_pane_changed(
        &mut self,
        cb: impl FnMut(&mut Core<D>, WindowId) -> Result<()> + 'static,
    ) -> Result<()> {
        self.require_idle("window_pane_changed observer")?;
        self.observers.window_pane_changed = Some(Box::new(cb));
        Ok(())
    }

    pub fn on_new_pane(
        &mut self,
        cb: impl FnMut(&mut Core<D>, PaneId) -> Result<()> + 'static,
    ) -> Result<()> {
        self.require_idle("new_pane observer")?;
        self.observers.new_pane = Some(Box::new(cb));
        Ok(())
    }

    pub fn on_pane_closed(
        &mut self,
        cb: impl FnMut(&mut Core<D>, Box<model::Pane>) -> Result<()> + 'static,
    ) -> Result<()> {
        self.require_idle("pane_closed observer")?;
        self.observers.pane_closed = Some(Box::new(cb));
        Ok(())
    }

    pub fn on_pane_resized(
        &mut self,
        cb: impl FnMut(&mut Core<D>, PaneId) -> Result<()> + 'static,
    ) -> Result<()> {
        self.require_idle("pane_resized observer")?;
        self.observers.pane_resized = Some(Box::new(cb));
        Ok(())
    }

    pub fn on_pane_mode_changed(
        &mut self,
        cb: impl FnMut(&mut Core<D>, PaneId) -> Result<()> + 'static,
    ) -> Result<()> {
        self.require_idle("pane_mode_changed observer")?;
        self.observers.pane_mode_changed = Some(Box::new(cb));
        Ok(())
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Raw access to the observer slots, for [`crate::testing::RecordingObservers`]
    /// to wire itself onto a real `Core` in integration tests. Unlike the
    /// `on_*` setters above this isn't gated by [`Self::require_idle`]: it's
    /// only meant to be called before `connect`.
    #[cfg(any(test, feature = "testing"))]
    pub(crate) fn observers_mut(&mut self) -> &mut Observers<D> {
        &mut self.observers
    }

    pub(crate) fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub(crate) fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    pub(crate) fn supervisor(&self) -> Option<&Supervisor> {
        self.supervisor.as_ref()
    }

    pub(crate) fn control_clients(&self) -> &[ControlClient] {
        &self.control_clients
    }

    pub(crate) fn control_clients_mut(&mut self) -> &mut Vec<ControlClient> {
        &mut self.control_clients
    }

    pub(crate) fn loop_handle(&self) -> &LoopHandle<'static, D> {
        &self.loop_handle
    }

    /// Runs `cmd` through the control client at `idx` via `cc_exec`,
    /// swallowing an error reply as an empty listing the same way a
    /// non-zero one-shot exit is swallowed (spec §4.5's "treat the listing
    /// as empty").
    pub(crate) fn exec_via_control_client(&mut self, idx: usize, cmd: &[String]) -> Result<Vec<u8>> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let Core { control_clients, scheduler, .. } = self;
        let reply = control_clients[idx].cc_exec(cmd, timeout, scheduler)?;
        if reply.is_error {
            return Ok(Vec::new());
        }
        Ok(reply.payload)
    }

    /// Drains whatever is available on the control client at `idx`,
    /// forwarding observed events to the scheduler. Used by the
    /// event-loop-driven readable callback (spec §4.3's `drain`); any
    /// framed reply seen here (there shouldn't be one outside of
    /// `cc_exec`'s own poll) is simply discarded.
    pub(crate) fn drain_control_client_events(&mut self, idx: usize) -> Result<()> {
        let Core { control_clients, scheduler, .. } = self;
        let _ = control_clients[idx].drain(|_kind, bits| scheduler.queue_refresh(bits))?;
        Ok(())
    }

    /// Unregisters every source this core owns and drops its supervisor and
    /// model. Shared by [`Self::disconnect`] and [`Drop`]; neither actually
    /// needs `D: HasCore<D>` since `LoopHandle::remove` takes no such bound
    /// (only registering a *new* source does).
    fn teardown(&mut self) {
        if !self.is_connected() {
            return;
        }
        for mut client in self.control_clients.drain(..) {
            if let Some(token) = client.fd_token.take() {
                crate::eventloop::remove(&self.loop_handle, token);
            }
        }
        if let Some(token) = self.sources.sigchld.take() {
            crate::eventloop::remove(&self.loop_handle, token);
        }
        if let Some(token) = self.sources.scheduler.take() {
            crate::eventloop::remove(&self.loop_handle, token);
        }
        self.supervisor = None;
        self.version = None;
        self.model = Model::new();
        ANY_CORE_CONNECTED.store(false, Ordering::SeqCst);
    }

    /// Tears down control clients, unregisters sources, and restores the
    /// `ANY_CORE_CONNECTED` guard. Errors during teardown are logged but
    /// never prevent teardown from completing (spec §7) — there simply are
    /// none here: unregistering a source and dropping a handle can't fail.
    pub fn disconnect(&mut self) {
        self.teardown();
    }
}

impl<D: HasCore<D>> Core<D> {
    /// Installs the SIGCHLD handler, runs `-V` and checks the version
    /// threshold, registers the sigchld and refresh-scheduler fds with the
    /// loop, and runs an initial sessions-pass reconciliation (spec §4.1,
    /// §4.2's SIGCHLD install, §6's `-V` contract).
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if ANY_CORE_CONNECTED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            fatal!("a second core attempted to connect in the same process");
        }

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let supervisor = match Supervisor::new(timeout) {
            Ok(s) => s,
            Err(e) => {
                ANY_CORE_CONNECTED.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let prefix = match self.config.command_prefix() {
            Ok(p) => p,
            Err(e) => {
                ANY_CORE_CONNECTED.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let version_check = supervisor
            .run_one_shot(&prefix, &["-V".to_string()])
            .and_then(|(_, out)| {
                crate::version::check_version_output(&String::from_utf8_lossy(&out))
            });
        let version = match version_check {
            Ok(v) => v,
            Err(e) => {
                ANY_CORE_CONNECTED.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let sigchld_token =
            crate::eventloop::add_fd(&self.loop_handle, supervisor.sigchld_fd(), |core| {
                crate::reconcile::handle_sigchld(core)
            })?;
        let scheduler_token =
            crate::eventloop::add_fd(&self.loop_handle, self.scheduler.read_fd(), |core| {
                crate::reconcile::drive_scheduler(core)
            })?;

        self.supervisor = Some(supervisor);
        self.version = Some(version);
        self.sources.sigchld = Some(sigchld_token);
        self.sources.scheduler = Some(scheduler_token);

        self.scheduler.queue_refresh(DirtyFlags::SESSIONS);
        crate::reconcile::drive_scheduler(self)
    }
}

impl<D> Drop for Core<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}
