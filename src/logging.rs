//! Thin wrappers around `tracing`, see spec §4.7.
//!
//! The core never installs a subscriber itself — that stays the consumer's
//! job — it only emits events. `fatal!` is the one severity with
//! process-wide effect: it logs at error level and aborts, for invariant
//! violations that make continued operation unsound (the single-core-per
//! process guard in [`crate::Core::connect`] is the only current user).

/// Logs at error level and aborts the process. Reserved for invariants
/// whose violation means the core's internal bookkeeping can no longer be
/// trusted (see spec §6, "Fatal aborts the process").
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        std::process::abort();
    }};
}
