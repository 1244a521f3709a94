//! Pixel transfer
//!
//! Each overlay window composites its placements into one BGRX staging
//! buffer and pushes it with a single request per draw. The buffer lives
//! in a System V shared memory segment when MIT-SHM is available;
//! otherwise a heap buffer is sent through chunked core protocol
//! PutImage requests.

use std::io;
use std::ptr;

use image::RgbImage;
use log::warn;
use x11rb::connection::{Connection, RequestConnection as _};
use x11rb::protocol::shm::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{ConnectionExt as _, Gcontext, ImageFormat, Rectangle, Window};

use super::{WindowError, XContext};

const BYTES_PER_PIXEL: usize = 4;
const SCREEN_DEPTH: u8 = 24;

/// An attached System V shared memory segment.
///
/// The segment is marked for removal right after attach, so it cannot
/// leak even if the process dies before detaching.
struct ShmSegment {
    id: i32,
    addr: *mut u8,
    size: usize,
}

impl ShmSegment {
    fn new(size: usize) -> io::Result<Self> {
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
        if id < 0 {
            return Err(io::Error::last_os_error());
        }

        let addr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if addr as isize == -1 {
            let error = io::Error::last_os_error();
            unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
            return Err(error);
        }
        unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };

        Ok(Self {
            id,
            addr: addr.cast(),
            size,
        })
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr, self.size) }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr, self.size) }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe { libc::shmdt(self.addr.cast()) };
    }
}

enum Transfer {
    Shared {
        segment: ShmSegment,
        seg_id: shm::Seg,
    },
    Core {
        pixels: Vec<u8>,
    },
}

/// Staging buffer of one overlay window, sized to the window.
pub struct Surface {
    width: u32,
    height: u32,
    transfer: Transfer,
}

impl Surface {
    pub fn new(ctx: &XContext, width: u32, height: u32) -> Result<Self, WindowError> {
        let width = width.max(1);
        let height = height.max(1);
        let size = width as usize * height as usize * BYTES_PER_PIXEL;

        let transfer = if ctx.shm_supported {
            match Self::attach_shared(ctx, size) {
                Ok(transfer) => transfer,
                Err(error) => {
                    warn!("shared memory setup failed ({error}), using core protocol");
                    Transfer::Core {
                        pixels: vec![0; size],
                    }
                }
            }
        } else {
            Transfer::Core {
                pixels: vec![0; size],
            }
        };

        Ok(Self {
            width,
            height,
            transfer,
        })
    }

    fn attach_shared(ctx: &XContext, size: usize) -> Result<Transfer, WindowError> {
        let segment =
            ShmSegment::new(size).map_err(|error| WindowError::Resource(error.to_string()))?;
        let seg_id = ctx.conn.generate_id()?;
        ctx.conn
            .shm_attach(seg_id, segment.id as u32, false)?
            .check()?;
        Ok(Transfer::Shared { segment, seg_id })
    }

    /// Replaces the buffer with one sized to the new window geometry.
    pub fn resize(&mut self, ctx: &XContext, width: u32, height: u32) -> Result<(), WindowError> {
        self.release(ctx);
        *self = Self::new(ctx, width, height)?;
        Ok(())
    }

    /// Detaches the server-side segment. The local mapping is freed on
    /// drop.
    pub fn release(&mut self, ctx: &XContext) {
        if let Transfer::Shared { seg_id, .. } = &self.transfer {
            let _ = ctx.conn.shm_detach(*seg_id);
        }
    }

    fn pixels_mut(&mut self) -> &mut [u8] {
        match &mut self.transfer {
            Transfer::Shared { segment, .. } => segment.as_mut_slice(),
            Transfer::Core { pixels } => pixels,
        }
    }

    fn pixels(&self) -> &[u8] {
        match &self.transfer {
            Transfer::Shared { segment, .. } => segment.as_slice(),
            Transfer::Core { pixels } => pixels,
        }
    }

    pub fn clear(&mut self) {
        self.pixels_mut().fill(0);
    }

    /// Copies an image into the buffer at a signed position, clipping
    /// against the surface. Returns the visible rectangle, if any.
    pub fn blit(&mut self, image: &RgbImage, x: i32, y: i32) -> Option<Rectangle> {
        let dst_x0 = x.max(0);
        let dst_y0 = y.max(0);
        let dst_x1 = x.saturating_add(image.width() as i32).min(self.width as i32);
        let dst_y1 = y
            .saturating_add(image.height() as i32)
            .min(self.height as i32);
        if dst_x0 >= dst_x1 || dst_y0 >= dst_y1 {
            return None;
        }

        let src = image.as_raw();
        let src_stride = image.width() as usize * 3;
        let dst_stride = self.width as usize * BYTES_PER_PIXEL;
        let columns = (dst_x1 - dst_x0) as usize;
        let pixels = self.pixels_mut();

        for row in dst_y0..dst_y1 {
            let src_offset = (row - y) as usize * src_stride + (dst_x0 - x) as usize * 3;
            let dst_offset = row as usize * dst_stride + dst_x0 as usize * BYTES_PER_PIXEL;
            for column in 0..columns {
                let s = src_offset + column * 3;
                let d = dst_offset + column * BYTES_PER_PIXEL;
                pixels[d] = src[s + 2];
                pixels[d + 1] = src[s + 1];
                pixels[d + 2] = src[s];
                pixels[d + 3] = 0;
            }
        }

        Some(Rectangle {
            x: dst_x0 as i16,
            y: dst_y0 as i16,
            width: (dst_x1 - dst_x0) as u16,
            height: (dst_y1 - dst_y0) as u16,
        })
    }

    /// Sends the whole buffer to the window in one request (or, on the
    /// core protocol path, as few as the request size limit allows).
    pub fn push(
        &self,
        ctx: &XContext,
        window: Window,
        gc: Gcontext,
    ) -> Result<(), WindowError> {
        match &self.transfer {
            Transfer::Shared { seg_id, .. } => {
                ctx.conn.shm_put_image(
                    window,
                    gc,
                    self.width as u16,
                    self.height as u16,
                    0,
                    0,
                    self.width as u16,
                    self.height as u16,
                    0,
                    0,
                    SCREEN_DEPTH,
                    ImageFormat::Z_PIXMAP.into(),
                    false,
                    *seg_id,
                    0,
                )?;
            }
            Transfer::Core { .. } => {
                let pixels = self.pixels();
                let row_bytes = self.width as usize * BYTES_PER_PIXEL;
                // Leave headroom for the request header.
                let budget = ctx.conn.maximum_request_bytes().saturating_sub(1024);
                let rows_per_chunk = (budget / row_bytes).max(1) as u32;

                let mut row = 0;
                while row < self.height {
                    let rows = rows_per_chunk.min(self.height - row);
                    let start = row as usize * row_bytes;
                    let end = (row + rows) as usize * row_bytes;
                    ctx.conn.put_image(
                        ImageFormat::Z_PIXMAP,
                        window,
                        gc,
                        self.width as u16,
                        rows as u16,
                        0,
                        row as i16,
                        0,
                        SCREEN_DEPTH,
                        &pixels[start..end],
                    )?;
                    row += rows;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_surface(width: u32, height: u32) -> Surface {
        Surface {
            width,
            height,
            transfer: Transfer::Core {
                pixels: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
            },
        }
    }

    #[test]
    fn blit_converts_rgb_to_bgrx() {
        let mut surface = core_surface(4, 2);
        let image = RgbImage::from_pixel(1, 1, image::Rgb([10, 20, 30]));

        let rect = surface.blit(&image, 2, 1).expect("visible");
        assert_eq!((rect.x, rect.y, rect.width, rect.height), (2, 1, 1, 1));

        let offset = (1 * 4 + 2) * BYTES_PER_PIXEL;
        assert_eq!(
            &surface.pixels()[offset..offset + 4],
            &[30, 20, 10, 0]
        );
    }

    #[test]
    fn blit_clips_against_the_surface() {
        let mut surface = core_surface(4, 4);
        let image = RgbImage::from_pixel(3, 3, image::Rgb([255, 255, 255]));

        let rect = surface.blit(&image, -1, 3).expect("partially visible");
        assert_eq!((rect.x, rect.y), (0, 3));
        assert_eq!((rect.width, rect.height), (2, 1));

        // Fully outside yields no rectangle.
        assert!(surface.blit(&image, 10, 10).is_none());
        assert!(surface.blit(&image, -5, 0).is_none());
    }

    #[test]
    fn later_blits_overwrite_earlier_ones() {
        let mut surface = core_surface(2, 1);
        surface.blit(&RgbImage::from_pixel(2, 1, image::Rgb([1, 1, 1])), 0, 0);
        surface.blit(&RgbImage::from_pixel(1, 1, image::Rgb([9, 9, 9])), 1, 0);

        assert_eq!(surface.pixels()[0], 1);
        assert_eq!(surface.pixels()[BYTES_PER_PIXEL], 9);
    }
}
