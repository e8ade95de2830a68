//! The configuration surface from spec §4.1/§4.9.
//!
//! This is deliberately small: the core owns exactly the knobs the
//! distilled spec names (binary path, socket name/path, config file,
//! timeout, virtual terminal size) and nothing else — no layered config
//! file of its own, no CLI parsing. [`Config`] centralizes their defaults
//! and validation so the setters on [`crate::Core`] stay thin.

use std::path::PathBuf;

use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_VT_WIDTH: u32 = 80;
pub const DEFAULT_VT_HEIGHT: u32 = 24;
const MIN_VT_DIM: u32 = 10;

/// Which of the two mutually exclusive ways to address the mux server's
/// Unix socket is in effect (spec §4.1: "socket name OR socket path —
/// mutually exclusive — setting one clears the other").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socket {
    /// `-L name`: resolved by the mux binary under its own runtime dir.
    Name(String),
    /// `-S path`: an explicit socket path.
    Path(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub binary: Option<PathBuf>,
    pub socket: Option<Socket>,
    pub config_file: Option<PathBuf>,
    pub timeout_ms: u64,
    pub vt_width: u32,
    pub vt_height: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binary: None,
            socket: None,
            config_file: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            vt_width: DEFAULT_VT_WIDTH,
            vt_height: DEFAULT_VT_HEIGHT,
        }
    }
}

impl Config {
    pub fn set_socket_name(&mut self, name: impl Into<String>) {
        self.socket = Some(Socket::Name(name.into()));
    }

    pub fn set_socket_path(&mut self, path: impl Into<PathBuf>) {
        self.socket = Some(Socket::Path(path.into()));
    }

    pub fn set_size(&mut self, w: u32, h: u32) -> Result<()> {
        if w < MIN_VT_DIM || h < MIN_VT_DIM {
            return Err(Error::invalid(format!(
                "virtual terminal size {w}x{h} is below the minimum of {MIN_VT_DIM}x{MIN_VT_DIM}"
            )));
        }
        self.vt_width = w;
        self.vt_height = h;
        Ok(())
    }

    /// Builds the `{bin, -L|-S socket, -f config}` command-line prefix
    /// described in spec §4.2. Returns `InvalidArg` if no binary has been
    /// configured.
    pub fn command_prefix(&self) -> Result<Vec<String>> {
        let bin = self
            .binary
            .as_ref()
            .ok_or_else(|| Error::invalid("no mux binary path configured"))?;
        let mut prefix = vec![bin.to_string_lossy().into_owned()];

        match &self.socket {
            Some(Socket::Name(name)) => {
                prefix.push("-L".into());
                prefix.push(name.clone());
            }
            Some(Socket::Path(path)) => {
                prefix.push("-S".into());
                prefix.push(path.to_string_lossy().into_owned());
            }
            None => {}
        }

        if let Some(cfg) = &self.config_file {
            prefix.push("-f".into());
            prefix.push(cfg.to_string_lossy().into_owned());
        }

        Ok(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_fields_are_mutually_exclusive() {
        let mut cfg = Config::default();
        cfg.set_socket_name("default");
        assert_eq!(cfg.socket, Some(Socket::Name("default".into())));
        cfg.set_socket_path("/tmp/sock");
        assert_eq!(cfg.socket, Some(Socket::Path("/tmp/sock".into())));
    }

    #[test]
    fn rejects_too_small_terminal() {
        let mut cfg = Config::default();
        assert!(cfg.set_size(5, 24).is_err());
        assert!(cfg.set_size(80, 24).is_ok());
    }

    #[test]
    fn command_prefix_includes_socket_and_config() {
        let mut cfg = Config::default();
        cfg.binary = Some("/usr/bin/tmux".into());
        cfg.set_socket_name("work");
        cfg.config_file = Some("/home/me/.tmux.conf".into());
        assert_eq!(
            cfg.command_prefix().unwrap(),
            vec!["/usr/bin/tmux", "-L", "work", "-f", "/home/me/.tmux.conf"]
        );
    }
}
