use crate::ids::SessionId;

/// A connected mux client (spec §3). Keyed by tty name since the server has
/// no integer client id.
#[derive(Debug, Clone)]
pub struct Client {
    pub name: String,
    pub pid: i32,
    pub session: Option<SessionId>,
}

impl Client {
    pub(crate) fn new(name: String, pid: i32) -> Self {
        Self {
            name,
            pid,
            session: None,
        }
    }
}
