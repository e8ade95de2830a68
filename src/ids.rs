//! Primary keys for the four tracked entity kinds.
//!
//! Panes, windows and sessions are keyed by the small integer ids the mux
//! server itself assigns (`%N`, `@N`, `$N`). Clients are keyed by their tty
//! name instead, since the server has no integer client id.

use std::fmt;

macro_rules! int_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl $name {
            /// Parses the `%N` / `@N` / `$N` form the server uses in `-F` output.
            pub fn parse(s: &str) -> Option<Self> {
                let s = s.strip_prefix($prefix)?;
                s.parse().ok().map(Self)
            }
        }
    };
}

int_id!(PaneId, '%');
int_id!(WindowId, '@');
int_id!(SessionId, '$');

/// Client identity: the tty path the server reports, e.g. `/dev/pts/3`.
pub type ClientName = String;
