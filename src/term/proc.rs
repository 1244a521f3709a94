//! /proc helpers
//!
//! Process ancestry and pty slave discovery, used to match terminal
//! client processes against X11 windows.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Minor device number bits of a tty_nr value (see tty_devnum in the
/// kernel: minor is split across bits 0-7 and 20-31).
const MINOR_DEVICE_NUMBER_MASK: u64 = 0b1111_1111_1111_0000_0000_0000_1111_1111;

/// Subset of /proc/<pid>/stat this crate cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub comm: String,
    pub ppid: i32,
    pub tty_nr: u64,
}

/// Reads the stat record of one process.
pub fn get_info(pid: i32) -> Result<ProcessInfo> {
    let path = format!("/proc/{pid}/stat");
    let data = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    parse_stat(&data).with_context(|| format!("parsing {path}"))
}

/// The comm field is wrapped in parentheses and may itself contain
/// spaces or parentheses, so the record is split at the last ')'.
fn parse_stat(data: &str) -> Result<ProcessInfo> {
    let open = data.find('(').context("missing '(' in stat record")?;
    let close = data.rfind(')').context("missing ')' in stat record")?;
    if close < open {
        bail!("malformed stat record");
    }

    let pid: i32 = data[..open].trim().parse().context("pid field")?;
    let comm = data[open + 1..close].to_string();
    let mut rest = data[close + 1..].split_whitespace();

    let _state = rest.next().context("state field")?;
    let ppid: i32 = rest.next().context("ppid field")?.parse()?;
    let _pgrp = rest.next().context("pgrp field")?;
    let _session = rest.next().context("session field")?;
    let tty_nr: u64 = rest.next().context("tty_nr field")?.parse()?;

    Ok(ProcessInfo {
        pid,
        comm,
        ppid,
        tty_nr,
    })
}

/// Command name of a process, from /proc/<pid>/comm.
pub fn get_command(pid: i32) -> Result<String> {
    let path = format!("/proc/{pid}/comm");
    let comm = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    Ok(comm.trim_end_matches('\n').to_string())
}

/// Chain of pids from `pid` up to (excluding) the init process.
pub fn get_parent_pids(pid: i32) -> Vec<i32> {
    let mut pids = Vec::new();
    let mut current = pid;
    while current > 1 {
        pids.push(current);
        match get_info(current) {
            Ok(info) => current = info.ppid,
            Err(_) => break,
        }
    }
    pids
}

/// Directories holding pty slave control devices, from
/// /proc/tty/drivers.
pub fn get_pty_slave_folders() -> Result<Vec<PathBuf>> {
    let data = fs::read_to_string("/proc/tty/drivers").context("reading /proc/tty/drivers")?;
    let mut folders = Vec::new();

    for line in data.lines() {
        // Format: "<name> <path> <major> <minor range> <type>", where the
        // driver name may contain spaces.
        let Some(position) = line.find("/dev/") else {
            continue;
        };
        let name = line[..position].trim();
        let path = line[position..]
            .split_whitespace()
            .next()
            .unwrap_or_default();
        if name == "pty_slave" && !path.is_empty() {
            folders.push(PathBuf::from(path));
        }
    }
    Ok(folders)
}

/// Control device of the pty slave attached to the given process, if
/// the device can be found.
pub fn get_pty_slave(pid: i32) -> Result<Option<PathBuf>> {
    let info = get_info(pid)?;
    let minor = info.tty_nr & MINOR_DEVICE_NUMBER_MASK;

    for folder in get_pty_slave_folders()? {
        let device = folder.join(minor.to_string());
        if device_number(&device) == Some(info.tty_nr) {
            return Ok(Some(device));
        }
    }
    Ok(None)
}

fn device_number(path: &Path) -> Option<u64> {
    nix::sys::stat::stat(path).ok().map(|s| s.st_rdev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_stat_record() {
        let record = "1234 (bash) S 1000 1234 1234 34816 0 0";
        let info = parse_stat(record).expect("valid record");
        assert_eq!(info.pid, 1234);
        assert_eq!(info.comm, "bash");
        assert_eq!(info.ppid, 1000);
        assert_eq!(info.tty_nr, 34816);
    }

    #[test]
    fn comm_may_contain_spaces_and_parens() {
        let record = "77 (tmux: client (x)) S 1 77 77 0 0";
        let info = parse_stat(record).expect("valid record");
        assert_eq!(info.comm, "tmux: client (x)");
        assert_eq!(info.ppid, 1);
    }

    #[test]
    fn own_process_is_visible() {
        let pid = std::process::id() as i32;
        let info = get_info(pid).expect("own stat record");
        assert_eq!(info.pid, pid);

        let chain = get_parent_pids(pid);
        assert_eq!(chain.first(), Some(&pid));
        assert!(chain.len() >= 1);
    }
}
