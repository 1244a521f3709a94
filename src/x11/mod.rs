//! X11 connection context
//!
//! Owns the display connection, the WM atoms and the extension probes,
//! and resolves which terminal windows the overlay should attach to.
//! Terminal discovery matches the parent pid chains of the client
//! processes (tmux clients, `$WINDOWID`, or this process itself) against
//! the pids the window manager publishes on its top-level windows.

pub mod shm;
pub mod window;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use thiserror::Error;
use x11rb::atom_manager;
use x11rb::connection::Connection;
use x11rb::protocol::shape::ConnectionExt as _;
use x11rb::protocol::shm::ConnectionExt as _;
use x11rb::protocol::xproto::{AtomEnum, ConnectionExt as _, Window};
use x11rb::rust_connection::RustConnection;

use crate::term::{proc, tmux, TerminalWindowInfo};

atom_manager! {
    /// Atoms resolved once at connection time.
    pub Atoms: AtomsCookie {
        _NET_CLIENT_LIST,
        _NET_WM_PID,
    }
}

/// Failure of an overlay window operation.
#[derive(Debug, Error)]
pub enum WindowError {
    /// The X server rejected a request or the connection broke.
    #[error("X11 resource error: {0}")]
    Resource(String),
    /// The terminal window changed or vanished while the overlay was
    /// being set up against it.
    #[error("terminal window changed during setup: {0}")]
    StructuralRace(String),
}

impl From<x11rb::errors::ConnectionError> for WindowError {
    fn from(error: x11rb::errors::ConnectionError) -> Self {
        WindowError::Resource(error.to_string())
    }
}

impl From<x11rb::errors::ReplyError> for WindowError {
    fn from(error: x11rb::errors::ReplyError) -> Self {
        WindowError::Resource(error.to_string())
    }
}

impl From<x11rb::errors::ReplyOrIdError> for WindowError {
    fn from(error: x11rb::errors::ReplyOrIdError) -> Self {
        WindowError::Resource(error.to_string())
    }
}

/// Shared connection state of the overlay process.
pub struct XContext {
    pub conn: RustConnection,
    pub screen: usize,
    pub atoms: Atoms,
    /// MIT-SHM is available and usable for pixel transfer.
    pub shm_supported: bool,
}

impl XContext {
    /// Connects to the display named by `$DISPLAY` and probes the
    /// required extensions. The shape extension is mandatory, MIT-SHM
    /// is optional.
    pub fn connect() -> Result<Self> {
        let (conn, screen) = x11rb::connect(None).context("connecting to the X server")?;
        let atoms = Atoms::new(&conn)?.reply().context("interning atoms")?;

        conn.shape_query_version()
            .context("shape extension request")?
            .reply()
            .context("the shape extension is required for overlay masking")?;

        let shm_supported = match conn.shm_query_version() {
            Ok(cookie) => match cookie.reply() {
                Ok(version) => {
                    debug!(
                        "MIT-SHM {}.{} available",
                        version.major_version, version.minor_version
                    );
                    true
                }
                Err(_) => false,
            },
            Err(_) => false,
        };
        if !shm_supported {
            info!("MIT-SHM unavailable, falling back to core protocol pixel transfer");
        }

        Ok(Self {
            conn,
            screen,
            atoms,
            shm_supported,
        })
    }

    pub fn root(&self) -> Window {
        self.conn.setup().roots[self.screen].root
    }

    /// The terminal windows that currently host this layer, resolved
    /// from tmux clients, `$WINDOWID`, or our own process ancestry.
    pub fn enumerate_terminal_windows(&self) -> Result<Vec<TerminalWindowInfo>> {
        let mut infos = Vec::new();
        let mut clients: HashMap<i32, Option<PathBuf>> = HashMap::new();

        if let Some(pane) = tmux::get_pane() {
            for (pid, tty) in tmux::get_client_ttys_by_pid(&pane)? {
                clients.insert(pid, Some(tty));
            }
        } else if let Some(window_id) = window_id_from_environment() {
            let pid = std::process::id() as i32;
            let pty = proc::get_pty_slave(pid).unwrap_or_default();
            infos.push(TerminalWindowInfo::new(window_id, pty));
            return Ok(infos);
        } else {
            clients.insert(std::process::id() as i32, None);
        }

        if clients.is_empty() {
            // Inside an unfocused tmux window there is nothing to draw on.
            return Ok(infos);
        }

        let windows_by_pid = self.get_pid_window_id_map()?;
        for (pid, pty) in clients {
            match first_window_of_ancestry(&windows_by_pid, pid) {
                Some(window_id) => infos.push(TerminalWindowInfo::new(window_id, pty)),
                None => debug!("no mapped window found for client pid {pid}"),
            }
        }
        Ok(infos)
    }

    /// Owner pid of every mapped top-level window, from
    /// `_NET_CLIENT_LIST` and `_NET_WM_PID`.
    fn get_pid_window_id_map(&self) -> Result<HashMap<i32, Window>> {
        let reply = self
            .conn
            .get_property(
                false,
                self.root(),
                self.atoms._NET_CLIENT_LIST,
                AtomEnum::WINDOW,
                0,
                u32::MAX,
            )
            .context("_NET_CLIENT_LIST request")?
            .reply()
            .context("_NET_CLIENT_LIST reply")?;

        let mut map = HashMap::new();
        for window in reply.value32().into_iter().flatten() {
            match self.get_window_pid(window) {
                Ok(Some(pid)) => {
                    map.insert(pid, window);
                }
                Ok(None) => {}
                Err(error) => {
                    // Windows may be destroyed between the list request
                    // and the property read.
                    debug!("window 0x{window:x}: {error}");
                }
            }
        }
        Ok(map)
    }

    fn get_window_pid(&self, window: Window) -> Result<Option<i32>> {
        let reply = self
            .conn
            .get_property(
                false,
                window,
                self.atoms._NET_WM_PID,
                AtomEnum::CARDINAL,
                0,
                1,
            )?
            .reply()?;
        Ok(reply
            .value32()
            .and_then(|mut values| values.next())
            .map(|pid| pid as i32))
    }
}

fn window_id_from_environment() -> Option<Window> {
    let raw = std::env::var("WINDOWID").ok()?;
    match raw.parse() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!("ignoring unparsable WINDOWID '{raw}'");
            None
        }
    }
}

/// Walks the parent chain of `pid` (youngest first) and returns the
/// window of the first ancestor that owns one.
fn first_window_of_ancestry(windows_by_pid: &HashMap<i32, Window>, pid: i32) -> Option<Window> {
    proc::get_parent_pids(pid)
        .into_iter()
        .find_map(|ancestor| windows_by_pid.get(&ancestor).copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestry_match_prefers_the_youngest_owner() {
        let pid = std::process::id() as i32;
        let chain = proc::get_parent_pids(pid);
        assert!(chain.len() >= 2, "test needs a parent process");

        let mut map = HashMap::new();
        map.insert(chain[0], 0x100 as Window);
        map.insert(chain[1], 0x200 as Window);
        assert_eq!(first_window_of_ancestry(&map, pid), Some(0x100));

        map.remove(&chain[0]);
        assert_eq!(first_window_of_ancestry(&map, pid), Some(0x200));

        map.clear();
        assert_eq!(first_window_of_ancestry(&map, pid), None);
    }
}
