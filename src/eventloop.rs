//! Realizes the injected event-loop interface (spec §6) directly atop
//! `calloop`: the core never owns a `LoopHandle`'s lifetime, only borrows
//! one the consumer already runs.

use std::os::fd::RawFd;

use std::time::Duration;

use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{Interest, LoopHandle, Mode, PostAction, RegistrationToken};

use crate::error::{Error, Result};

/// Lets the core find its own handle back out of the consumer's event-loop
/// data type `D`. `calloop` callbacks only ever receive `&mut D`, and the
/// core is generic over `D` (spec §5) rather than owning it, so every fd
/// source the core installs on the consumer's loop needs a way back to
/// `Core<D>` through whatever field the consumer stored it in.
pub trait HasCore<D>: 'static {
    fn core_mut(&mut self) -> &mut crate::Core<D>;
}

/// Registers `fd` for `Interest::READ` and routes every readiness
/// notification to `on_ready`. `add_fd` from spec §6's abstract interface.
///
/// `on_ready`'s `Result<(), Error>` is the "callback return convention"
/// from §6/§7: an `Err` is logged and turned into `PostAction::Continue`
/// so the loop tick aborts for this source without tearing down the whole
/// event loop (only our own source is left registered; the consumer's
/// other sources are unaffected).
pub fn add_fd<D, F>(loop_handle: &LoopHandle<'static, D>, fd: RawFd, mut on_ready: F) -> Result<RegistrationToken>
where
    D: HasCore<D>,
    F: FnMut(&mut crate::Core<D>) -> Result<()> + 'static,
{
    loop_handle
        .insert_source(
            Generic::new(fd, Interest::READ, Mode::Level),
            move |_readiness, _metadata, data| {
                let core = data.core_mut();
                if let Err(err) = on_ready(core) {
                    tracing::error!(error = %err, "event source callback failed, aborting this tick");
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|e| Error::invalid(format!("failed to register fd source: {e}")))
}

/// `remove` from spec §6's abstract interface.
pub fn remove<D>(loop_handle: &LoopHandle<'static, D>, token: RegistrationToken) {
    loop_handle.remove(token);
}

/// `add_timer` from spec §6's abstract interface. Not currently exercised
/// by the core's own bounded waits (`wait_pid`, `cc_exec` poll directly and
/// synchronously per spec §5), but kept available for a consumer that
/// wants to drive, say, a periodic health check off the same loop.
pub fn add_timer<D, F>(loop_handle: &LoopHandle<'static, D>, delay: Duration, mut on_fire: F) -> Result<RegistrationToken>
where
    D: HasCore<D>,
    F: FnMut(&mut crate::Core<D>) -> Result<()> + 'static,
{
    let timer = Timer::from_duration(delay);
    loop_handle
        .insert_source(timer, move |_deadline, _metadata, data| {
            let core = data.core_mut();
            if let Err(err) = on_fire(core) {
                tracing::error!(error = %err, "timer callback failed");
            }
            TimeoutAction::Drop
        })
        .map_err(|e| Error::invalid(format!("failed to register timer source: {e}")))
}

/// `timer_update` from spec §6's abstract interface: re-arms `token` with a
/// fresh deadline by removing and re-inserting it, since `calloop`'s
/// `Timer` source has no in-place reschedule primitive.
pub fn timer_update<D, F>(
    loop_handle: &LoopHandle<'static, D>,
    token: RegistrationToken,
    delay: Duration,
    on_fire: F,
) -> Result<RegistrationToken>
where
    D: HasCore<D>,
    F: FnMut(&mut crate::Core<D>) -> Result<()> + 'static,
{
    loop_handle.remove(token);
    add_timer(loop_handle, delay, on_fire)
}
