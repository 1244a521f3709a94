//! Terminal metadata resolver
//!
//! Determines the font cell size and padding of a target terminal window.
//! The numbers come from TIOCGWINSZ on the terminal's pty (cell grid plus
//! pixel size); when the terminal does not report pixel sizes the parent
//! window geometry is used as the fallback. Stale metrics are a
//! correctness bug, so the overlay window resets this state whenever the
//! parent geometry changes.

pub mod proc;
pub mod tmux;

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::debug;

nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);

/// Font and padding metadata of one target terminal window.
#[derive(Debug)]
pub struct TerminalWindowInfo {
    /// X11 id of the terminal window the overlay is attached to.
    pub window_id: u32,
    /// Control device of the terminal's pty slave, when known.
    pub pty: Option<PathBuf>,
    /// Width of one character cell in pixels.
    pub font_width: u32,
    /// Height of one character cell in pixels.
    pub font_height: u32,
    /// Inner padding between the window border and the character grid.
    pub padding: u32,
    version: u64,
    ready: bool,
}

impl TerminalWindowInfo {
    pub fn new(window_id: u32, pty: Option<PathBuf>) -> Self {
        Self {
            window_id,
            pty,
            font_width: 0,
            font_height: 0,
            padding: 0,
            version: 0,
            ready: false,
        }
    }

    /// False until `calculate_sizes` ran against current geometry.
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Identity of the current metric computation; transform cache
    /// entries made under an older version are stale.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Invalidates the cached metrics, forcing a recomputation on the
    /// next geometry need.
    pub fn reset(&mut self) {
        self.ready = false;
    }

    /// Recomputes cell size and padding from the terminal's winsize.
    ///
    /// `fallback_width`/`fallback_height` are the parent window pixel
    /// dimensions, used when the terminal reports a zero pixel size.
    pub fn calculate_sizes(&mut self, fallback_width: u32, fallback_height: u32) -> Result<()> {
        let size = self.query_winsize()?;
        let cols = u32::from(size.ws_col);
        let rows = u32::from(size.ws_row);
        if cols == 0 || rows == 0 {
            bail!("terminal reports an empty character grid");
        }

        let xpixel = if size.ws_xpixel != 0 {
            u32::from(size.ws_xpixel)
        } else {
            fallback_width
        };
        let ypixel = if size.ws_ypixel != 0 {
            u32::from(size.ws_ypixel)
        } else {
            fallback_height
        };

        let padding = guess_padding(cols, xpixel).max(guess_padding(rows, ypixel));
        self.font_width = guess_font_size(cols, xpixel, padding);
        self.font_height = guess_font_size(rows, ypixel, padding);
        self.padding = padding;
        self.version += 1;
        self.ready = true;

        debug!(
            "window 0x{:x}: cell {}x{} px, padding {} (grid {}x{}, {}x{} px)",
            self.window_id, self.font_width, self.font_height, padding, cols, rows, xpixel, ypixel
        );
        Ok(())
    }

    /// Builds an already-measured context without touching a pty.
    #[cfg(test)]
    pub(crate) fn with_metrics(
        window_id: u32,
        font_width: u32,
        font_height: u32,
        padding: u32,
    ) -> Self {
        let mut info = Self::new(window_id, None);
        info.font_width = font_width;
        info.font_height = font_height;
        info.padding = padding;
        info.version = 1;
        info.ready = true;
        info
    }

    /// Simulates a metric recalculation.
    #[cfg(test)]
    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    fn query_winsize(&self) -> Result<libc::winsize> {
        let mut size = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        match &self.pty {
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| format!("opening pty {}", path.display()))?;
                unsafe { tiocgwinsz(file.as_raw_fd(), &mut size) }
                    .with_context(|| format!("TIOCGWINSZ on {}", path.display()))?;
            }
            None => {
                unsafe { tiocgwinsz(std::io::stdout().as_raw_fd(), &mut size) }
                    .context("TIOCGWINSZ on stdout")?;
            }
        }
        Ok(size)
    }
}

/// The character grid rarely fills the window exactly; the remainder is
/// assumed to be symmetric padding. Not always right, but better than
/// assuming none.
fn guess_padding(chars: u32, pixels: u32) -> u32 {
    (pixels % chars) / 2
}

fn guess_font_size(chars: u32, pixels: u32, padding: u32) -> u32 {
    pixels.saturating_sub(2 * padding) / chars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_is_half_the_grid_remainder() {
        assert_eq!(guess_padding(80, 644), 2);
        assert_eq!(guess_padding(80, 640), 0);
        assert_eq!(guess_padding(24, 495), (495 % 24) / 2);
    }

    #[test]
    fn font_size_excludes_padding() {
        let padding = guess_padding(80, 644);
        assert_eq!(guess_font_size(80, 644, padding), 8);
        assert_eq!(guess_font_size(24, 384, 0), 16);
    }

    #[test]
    fn versions_start_unready() {
        let mut info = TerminalWindowInfo::new(42, None);
        assert!(!info.ready());
        assert_eq!(info.version(), 0);
        info.reset();
        assert!(!info.ready());
    }
}
