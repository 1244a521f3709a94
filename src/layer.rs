//! Overlay control loop
//!
//! Single-threaded cooperative loop multiplexing three sources: X11
//! events (readiness on the connection stream), command lines from
//! stdin, and UNIX signals. Command bursts are drained before drawing
//! so a batch of updates costs one redraw. Per-command failures are
//! reported as error records on stderr and never stop the loop.

use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::io::unix::AsyncFd;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use x11rb::connection::Connection;

use crate::command::codec::{error_record, CodecKind};
use crate::command::{Command, RedrawScheduler};
use crate::geometry::Distance;
use crate::loading::{ImageLoader, LoaderKind};
use crate::term::tmux;
use crate::view::View;
use crate::x11::window::WindowSet;
use crate::x11::XContext;

/// Startup parameters of the overlay routine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerOptions {
    pub codec: CodecKind,
    pub loader: LoaderKind,
    /// Suppress error records on stderr.
    pub silent: bool,
}

struct StreamFd(RawFd);

impl AsRawFd for StreamFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Runs the overlay until stdin closes or a termination signal
/// arrives.
pub async fn run(options: LayerOptions) -> Result<()> {
    let codec = options.codec;
    let silent = options.silent;
    let ctx = Rc::new(XContext::connect()?);

    let loader = ImageLoader::new(options.loader);
    loader.register_error_handler(std::sync::Arc::new(move |error| {
        report_error(codec, silent, "ImageLoadError", &error.to_string());
    }));

    let mut view = View::new(current_pane_offset());
    let mut windows = WindowSet::default();
    let infos = ctx
        .enumerate_terminal_windows()
        .context("enumerating terminal windows")?;
    if infos.is_empty() {
        info!("no terminal window found to attach to");
    }
    windows.sync(&ctx, infos);

    let mut scheduler = RedrawScheduler::default();
    let mut lines = spawn_stdin_reader();
    let x11_fd = AsyncFd::new(StreamFd(ctx.conn.stream().as_raw_fd()))
        .context("registering the X11 stream")?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            guard = x11_fd.readable() => {
                let mut guard = guard.context("waiting on the X11 stream")?;
                while let Some(event) = ctx.conn.poll_for_event()
                    .context("reading X11 events")?
                {
                    windows.process_event(&event, &mut view);
                }
                guard.clear_ready();
            }
            line = lines.recv() => {
                let Some(line) = line else {
                    debug!("stdin closed");
                    break;
                };
                handle_line(codec, silent, &line, &mut view, &loader, &mut scheduler);
                // Drain the burst so the whole batch costs one redraw.
                while let Ok(line) = lines.try_recv() {
                    handle_line(codec, silent, &line, &mut view, &loader, &mut scheduler);
                }
                if scheduler.take() {
                    windows.draw_all(&mut view);
                }
            }
            _ = sigint.recv() => {
                debug!("SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                debug!("SIGTERM");
                break;
            }
            _ = sigusr1.recv() => {
                reattach(&ctx, &mut windows, &mut view);
            }
        }
    }

    // In-flight decodes finish on their own; nothing waits on them.
    windows.destroy_all();
    Ok(())
}

/// Re-enumerates terminal windows and reconciles the overlay set,
/// typically after a tmux client attached, detached, or changed focus.
fn reattach(ctx: &Rc<XContext>, windows: &mut WindowSet, view: &mut View) {
    let infos = match ctx.enumerate_terminal_windows() {
        Ok(infos) => infos,
        Err(error) => {
            warn!("re-enumeration failed: {error:#}");
            return;
        }
    };
    let synced = windows.sync(ctx, infos);
    // The pane offset can change without the client set changing, e.g.
    // after panes are rearranged inside the same tmux window.
    let moved = refresh_offset(view, current_pane_offset());
    if synced || moved {
        windows.draw_all(view);
    }
}

/// Applies a new pane offset to the view. Returns true when it differs
/// from the previous one.
fn refresh_offset(view: &mut View, offset: Distance) -> bool {
    let moved = offset != view.offset;
    view.offset = offset;
    moved
}

fn handle_line(
    codec: CodecKind,
    silent: bool,
    line: &str,
    view: &mut View,
    loader: &ImageLoader,
    scheduler: &mut RedrawScheduler,
) {
    if line.trim().is_empty() {
        return;
    }

    let command = codec
        .decode(line)
        .and_then(|record| Command::from_record(&record));
    match command {
        Ok(command) => {
            if command.apply(view, loader) {
                scheduler.schedule();
            }
        }
        Err(error) => report_error(codec, silent, error.name(), &error.to_string()),
    }
}

/// Writes one error record to stderr in the active wire format.
fn report_error(codec: CodecKind, silent: bool, name: &str, message: &str) {
    warn!("{name}: {message}");
    if silent {
        return;
    }
    let line = codec.encode(&error_record(name, message));
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{line}");
}

fn current_pane_offset() -> Distance {
    let Some(pane) = tmux::get_pane() else {
        return Default::default();
    };
    match tmux::get_offset(&pane) {
        Ok(offset) => offset,
        Err(error) => {
            warn!("pane offset unavailable: {error:#}");
            Default::default()
        }
    }
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!("reading stdin: {error}");
                    break;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_of_commands_costs_one_redraw() {
        let loader = ImageLoader::new(LoaderKind::Synchronous);
        let mut view = View::default();
        let mut scheduler = RedrawScheduler::default();

        for identifier in ["a", "b", "c"] {
            let line = format!(
                r#"{{"action":"add","identifier":"{identifier}","x":0,"y":0,"path":"/no/such.png"}}"#
            );
            handle_line(CodecKind::Json, true, &line, &mut view, &loader, &mut scheduler);
        }

        assert_eq!(view.media.len(), 3);
        assert!(scheduler.take());
        assert!(!scheduler.take());
    }

    #[test]
    fn add_then_remove_leaves_the_view_empty() {
        let loader = ImageLoader::new(LoaderKind::Synchronous);
        let mut view = View::default();
        let mut scheduler = RedrawScheduler::default();
        let mut redraws = 0;

        let add = r#"{"action":"add","identifier":"a","x":0,"y":0,"path":"/no/such.png"}"#;
        handle_line(CodecKind::Json, true, add, &mut view, &loader, &mut scheduler);
        if scheduler.take() {
            redraws += 1;
        }

        let remove = r#"{"action":"remove","identifier":"a"}"#;
        handle_line(CodecKind::Json, true, remove, &mut view, &loader, &mut scheduler);
        if scheduler.take() {
            redraws += 1;
        }

        assert!(view.media.is_empty());
        assert_eq!(redraws, 2);
    }

    #[test]
    fn offset_refresh_reports_pane_movement() {
        let mut view = View::default();

        // Same offset: nothing to redraw.
        assert!(!refresh_offset(&mut view, Distance::default()));

        // A rearranged pane moves even when the client set is unchanged.
        let offset = Distance::new(2, 4, 0, 0);
        assert!(refresh_offset(&mut view, offset));
        assert_eq!(view.offset, offset);
        assert!(!refresh_offset(&mut view, offset));
    }

    #[test]
    fn malformed_line_does_not_touch_the_view() {
        let loader = ImageLoader::new(LoaderKind::Synchronous);
        let mut view = View::default();
        let mut scheduler = RedrawScheduler::default();

        handle_line(CodecKind::Json, true, "not json", &mut view, &loader, &mut scheduler);
        handle_line(CodecKind::Json, true, "", &mut view, &loader, &mut scheduler);

        assert!(view.media.is_empty());
        assert!(!scheduler.take());
    }
}
