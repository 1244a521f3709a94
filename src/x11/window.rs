//! Overlay windows
//!
//! One `OverlayWindow` per terminal window: a borderless child window
//! covering the parent, click-through and invisible outside the shape
//! mask. Drawing composites every placement of the shared view into the
//! staging surface, pushes the pixels, and sets the bounding shape to
//! the list of placement rectangles so only image areas are visible.

use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, warn};
use x11rb::connection::Connection;
use x11rb::protocol::shape::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{
    ChangeWindowAttributesAux, ClipOrdering, ConfigureWindowAux, ConnectionExt as _,
    CreateGCAux, CreateWindowAux, EventMask, Gcontext, Rectangle, Window, WindowClass,
};
use x11rb::protocol::Event;
use x11rb::COPY_DEPTH_FROM_PARENT;

use crate::term::TerminalWindowInfo;
use crate::view::View;

use super::shm::Surface;
use super::{WindowError, XContext};

/// Renders the shared view onto some output.
pub trait Drawable {
    fn draw(&mut self, view: &mut View) -> Result<(), WindowError>;
}

/// Follows geometry changes of the underlying output.
pub trait Resizable {
    fn resize(&mut self, width: u32, height: u32) -> Result<(), WindowError>;
}

/// A click-through child window laid over one terminal window.
pub struct OverlayWindow {
    ctx: Rc<XContext>,
    pub term_info: TerminalWindowInfo,
    parent: Window,
    window: Window,
    gc: Gcontext,
    width: u32,
    height: u32,
    surface: Surface,
}

impl OverlayWindow {
    /// Creates and maps the overlay over `term_info`'s window. The
    /// window starts fully transparent; content appears on first draw.
    pub fn new(ctx: Rc<XContext>, mut term_info: TerminalWindowInfo) -> Result<Self, WindowError> {
        let parent = term_info.window_id;
        let geometry = ctx
            .conn
            .get_geometry(parent)?
            .reply()
            .map_err(|error| WindowError::StructuralRace(error.to_string()))?;
        let width = u32::from(geometry.width);
        let height = u32::from(geometry.height);

        if let Err(error) = term_info.calculate_sizes(width, height) {
            // The pty may not be measurable yet; draw retries.
            warn!("window 0x{parent:x}: {error:#}");
        }

        let window = ctx.conn.generate_id()?;
        ctx.conn.create_window(
            COPY_DEPTH_FROM_PARENT,
            window,
            parent,
            0,
            0,
            geometry.width,
            geometry.height,
            0,
            WindowClass::INPUT_OUTPUT,
            0,
            &CreateWindowAux::new()
                .background_pixel(0)
                .border_pixel(0)
                .event_mask(EventMask::EXPOSURE),
        )?;
        ctx.conn.change_window_attributes(
            parent,
            &ChangeWindowAttributesAux::new().event_mask(EventMask::STRUCTURE_NOTIFY),
        )?;

        // Empty rectangle lists: no input region, no visible region.
        ctx.conn.shape_rectangles(
            shape::SO::SET,
            shape::SK::INPUT,
            ClipOrdering::UNSORTED,
            window,
            0,
            0,
            &[],
        )?;
        ctx.conn.shape_rectangles(
            shape::SO::SET,
            shape::SK::BOUNDING,
            ClipOrdering::UNSORTED,
            window,
            0,
            0,
            &[],
        )?;

        let gc = ctx.conn.generate_id()?;
        ctx.conn
            .create_gc(gc, window, &CreateGCAux::new().graphics_exposures(0))?;

        let surface = Surface::new(&ctx, width, height)?;

        ctx.conn.map_window(window)?;
        ctx.conn.flush()?;
        debug!("overlay 0x{window:x} mapped over 0x{parent:x} ({width}x{height})");

        Ok(Self {
            ctx,
            term_info,
            parent,
            window,
            gc,
            width,
            height,
            surface,
        })
    }

    /// Reacts to one X11 event. Events addressed to other windows are
    /// ignored, so every event can be offered to every overlay.
    pub fn process_event(&mut self, event: &Event, view: &mut View) -> Result<(), WindowError> {
        match event {
            Event::Expose(expose) if expose.window == self.window && expose.count == 0 => {
                self.draw(view)
            }
            Event::ConfigureNotify(configure) if configure.window == self.parent => {
                let new_width = u32::from(configure.width);
                let new_height = u32::from(configure.height);
                let grew = new_width > self.width || new_height > self.height;

                if new_width != self.width || new_height != self.height {
                    self.resize(new_width, new_height)?;
                    // A shrink leaves the already drawn content valid.
                    if grew {
                        self.draw(view)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Unmaps and destroys the window and its server-side resources.
    pub fn destroy(&mut self) {
        self.surface.release(&self.ctx);
        let _ = self.ctx.conn.free_gc(self.gc);
        let _ = self.ctx.conn.unmap_window(self.window);
        let _ = self.ctx.conn.destroy_window(self.window);
        let _ = self.ctx.conn.flush();
        debug!("overlay 0x{:x} destroyed", self.window);
    }
}

impl Drawable for OverlayWindow {
    fn draw(&mut self, view: &mut View) -> Result<(), WindowError> {
        if !self.term_info.ready() {
            if let Err(error) = self.term_info.calculate_sizes(self.width, self.height) {
                warn!("window 0x{:x}: {error:#}", self.parent);
                return Ok(());
            }
        }

        self.surface.clear();
        let offset = view.offset;
        let mut visible: Vec<Rectangle> = Vec::with_capacity(view.media.len());

        // Insertion order; a later placement draws over an earlier one.
        for placement in view.media.values_mut() {
            let resolved = placement.resolve(offset, &self.term_info);
            if let Some(rect) = self.surface.blit(&resolved.image, resolved.x, resolved.y) {
                visible.push(rect);
            }
        }

        self.surface.push(&self.ctx, self.window, self.gc)?;
        self.ctx.conn.shape_rectangles(
            shape::SO::SET,
            shape::SK::BOUNDING,
            ClipOrdering::UNSORTED,
            self.window,
            0,
            0,
            &visible,
        )?;
        self.ctx.conn.flush()?;
        Ok(())
    }
}

impl Resizable for OverlayWindow {
    fn resize(&mut self, width: u32, height: u32) -> Result<(), WindowError> {
        self.ctx.conn.configure_window(
            self.window,
            &ConfigureWindowAux::new().width(width).height(height),
        )?;
        self.surface.resize(&self.ctx, width, height)?;
        self.width = width;
        self.height = height;
        // Cell metrics derive from the window geometry.
        self.term_info.reset();
        self.ctx.conn.flush()?;
        Ok(())
    }
}

/// The overlays currently attached, keyed by terminal window id.
#[derive(Default)]
pub struct WindowSet {
    windows: HashMap<Window, OverlayWindow>,
}

impl WindowSet {
    /// Reconciles the overlay set against a fresh enumeration of
    /// terminal windows. Returns true when any overlay was created or
    /// destroyed.
    pub fn sync(
        &mut self,
        ctx: &Rc<XContext>,
        infos: Vec<TerminalWindowInfo>,
    ) -> bool {
        let mut changed = false;
        let wanted: Vec<Window> = infos.iter().map(|info| info.window_id).collect();

        let stale: Vec<Window> = self
            .windows
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for id in stale {
            if let Some(mut window) = self.windows.remove(&id) {
                window.destroy();
                changed = true;
            }
        }

        for info in infos {
            if self.windows.contains_key(&info.window_id) {
                continue;
            }
            let id = info.window_id;
            match OverlayWindow::new(Rc::clone(ctx), info) {
                Ok(window) => {
                    self.windows.insert(id, window);
                    changed = true;
                }
                Err(WindowError::StructuralRace(reason)) => {
                    // The terminal vanished between enumeration and
                    // attach; the next re-enumeration settles it.
                    debug!("skipping window 0x{id:x}: {reason}");
                }
                Err(error) => warn!("attaching to window 0x{id:x}: {error}"),
            }
        }
        changed
    }

    /// Draws the view on every overlay. A failure on one overlay does
    /// not prevent the others from updating.
    pub fn draw_all(&mut self, view: &mut View) {
        for window in self.windows.values_mut() {
            let drawable: &mut dyn Drawable = window;
            if let Err(error) = drawable.draw(view) {
                warn!("draw failed: {error}");
            }
        }
    }

    /// Offers one event to every overlay.
    pub fn process_event(&mut self, event: &Event, view: &mut View) {
        for window in self.windows.values_mut() {
            if let Err(error) = window.process_event(event, view) {
                warn!("event handling failed: {error}");
            }
        }
    }

    pub fn destroy_all(&mut self) {
        for (_, mut window) in self.windows.drain() {
            window.destroy();
        }
    }
}
