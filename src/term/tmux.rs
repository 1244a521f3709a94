//! tmux integration
//!
//! When the layer runs inside a tmux pane the terminal window hosting it
//! is owned by the tmux client, not by this process. These helpers query
//! tmux for the client processes, their ttys, and the pane offset within
//! the client window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::geometry::Distance;

/// Pane identifier this process runs in, if any.
pub fn get_pane() -> Option<String> {
    std::env::var("TMUX_PANE").ok().filter(|v| !v.is_empty())
}

fn display_message(pane: &str, format: &str) -> Result<String> {
    let output = Command::new("tmux")
        .args(["display", "-p", "-F", format, "-t", pane])
        .output()
        .context("running tmux display")?;
    if !output.status.success() {
        bail!("tmux display failed: {}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

/// Whether the tmux window owning our pane is the active one.
pub fn is_window_focused(pane: &str) -> Result<bool> {
    Ok(display_message(pane, "#{window_active}")? == "1")
}

/// Offset of our pane within the client terminal, in cell units.
pub fn get_offset(pane: &str) -> Result<Distance> {
    let raw = display_message(
        pane,
        "#{pane_top},#{pane_left},#{pane_bottom},#{pane_right},#{window_height},#{window_width}",
    )?;
    let fields: Vec<i32> = raw
        .split(',')
        .map(|v| v.parse().context("pane geometry field"))
        .collect::<Result<_>>()?;
    let [top, left, bottom, right, height, width] = fields[..] else {
        bail!("unexpected pane geometry: {raw}");
    };
    Ok(Distance::new(top, left, height - bottom, width - right))
}

/// pty of each tmux client displaying our pane, keyed by client pid.
///
/// An unfocused window has no visible pane, so it reports no clients.
pub fn get_client_ttys_by_pid(pane: &str) -> Result<HashMap<i32, PathBuf>> {
    if !is_window_focused(pane)? {
        return Ok(HashMap::new());
    }

    let output = Command::new("tmux")
        .args(["list-clients", "-F", "#{client_pid},#{client_tty}", "-t", pane])
        .output()
        .context("running tmux list-clients")?;
    if !output.status.success() {
        bail!(
            "tmux list-clients failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let mut clients = HashMap::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Some((pid, tty)) = line.split_once(',') else {
            continue;
        };
        let pid: i32 = pid.parse().with_context(|| format!("client pid in '{line}'"))?;
        clients.insert(pid, PathBuf::from(tty));
    }
    Ok(clients)
}
