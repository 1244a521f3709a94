//! Image loading subsystem
//!
//! Decodes arbitrary image files into an opaque RGB buffer, either on the
//! calling thread or on a bounded worker pool (threads or helper
//! processes, both sized to the CPU core count). Consumers receive an
//! [`ImageHolder`] immediately and may block-wait on it; a failed decode
//! resolves the holder to a 1x1 placeholder so waiters never hang.

pub mod worker;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

use image::{DynamicImage, Rgb, RgbImage};
use log::{debug, warn};
use thiserror::Error;

/// Decode failure for a single source file.
#[derive(Debug, Clone, Error)]
#[error("failed to load image '{path}': {message}")]
pub struct ImageLoadError {
    pub path: PathBuf,
    pub message: String,
}

/// Callback invoked by the loader for every failed decode.
pub type ErrorCallback = Arc<dyn Fn(&ImageLoadError) + Send + Sync>;

/// Decodes and normalizes one image file.
///
/// Sources with transparency are alpha-blended onto a white background,
/// so the compositor only ever sees opaque RGB data.
pub fn load_image(path: &Path) -> Result<RgbImage, ImageLoadError> {
    let to_error = |message: String| ImageLoadError {
        path: path.to_path_buf(),
        message,
    };

    let reader = image::io::Reader::open(path)
        .map_err(|e| to_error(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| to_error(e.to_string()))?;
    let decoded = reader.decode().map_err(|e| to_error(e.to_string()))?;
    Ok(normalize(decoded))
}

/// Flattens any decoded format into opaque RGB.
fn normalize(image: DynamicImage) -> RgbImage {
    if image.color().has_alpha() {
        let rgba = image.to_rgba8();
        let mut rgb = RgbImage::new(rgba.width(), rgba.height());
        for (source, target) in rgba.pixels().zip(rgb.pixels_mut()) {
            let alpha = u32::from(source[3]);
            for channel in 0..3 {
                let value = u32::from(source[channel]) * alpha + 255 * (255 - alpha);
                target[channel] = (value / 255) as u8;
            }
        }
        rgb
    } else {
        image.to_rgb8()
    }
}

/// Stand-in pixel for unreadable files.
pub fn placeholder() -> RgbImage {
    RgbImage::from_pixel(1, 1, Rgb([255, 255, 255]))
}

/// Bridge between an image loader and its consumers.
///
/// Exactly one writer (the loader) assigns the image, then notifies all
/// waiters. Multiple consumers may block on the same holder.
pub struct ImageHolder {
    path: PathBuf,
    slot: Mutex<Option<Arc<RgbImage>>>,
    ready: Condvar,
}

impl ImageHolder {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub fn new_ready(path: PathBuf, image: Arc<RgbImage>) -> Self {
        Self {
            path,
            slot: Mutex::new(Some(image)),
            ready: Condvar::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Assigns the loaded image and wakes every waiter.
    pub fn reveal(&self, image: Arc<RgbImage>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(image);
        self.ready.notify_all();
    }

    /// Blocks until the loader has assigned an image.
    pub fn wait(&self) -> Arc<RgbImage> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        while slot.is_none() {
            slot = self.ready.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
        Arc::clone(slot.as_ref().expect("slot checked above"))
    }

    /// Returns the image if it is already available.
    pub fn try_get(&self) -> Option<Arc<RgbImage>> {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl fmt::Debug for ImageHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageHolder")
            .field("path", &self.path)
            .field("ready", &self.try_get().is_some())
            .finish()
    }
}

/// Loader strategy selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoaderKind {
    /// Decode right away on the calling thread.
    Synchronous,
    /// Decode on a bounded worker thread pool.
    #[default]
    Thread,
    /// Decode in helper child processes.
    Process,
}

impl LoaderKind {
    pub fn name(self) -> &'static str {
        match self {
            LoaderKind::Synchronous => "synchronous",
            LoaderKind::Thread => "thread",
            LoaderKind::Process => "process",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "synchronous" => Some(LoaderKind::Synchronous),
            "thread" => Some(LoaderKind::Thread),
            "process" => Some(LoaderKind::Process),
            _ => None,
        }
    }
}

/// Queued holders are referenced weakly: a placement that disappeared
/// before its decode started costs nothing.
type Job = Weak<ImageHolder>;

enum Strategy {
    Synchronous,
    Pool { queue: mpsc::Sender<Job> },
}

/// Image loader front end shared by the control loop and the command
/// handlers.
pub struct ImageLoader {
    strategy: Strategy,
    // Shared with the pool threads, so a handler registered after
    // startup still reaches them.
    errors: Arc<Mutex<Option<ErrorCallback>>>,
    // Keeps pool threads joinable on shutdown.
    _workers: Vec<thread::JoinHandle<()>>,
}

impl ImageLoader {
    pub fn new(kind: LoaderKind) -> Self {
        match kind {
            LoaderKind::Synchronous => Self {
                strategy: Strategy::Synchronous,
                errors: Arc::new(Mutex::new(None)),
                _workers: Vec::new(),
            },
            LoaderKind::Thread | LoaderKind::Process => Self::pool(kind),
        }
    }

    fn pool(kind: LoaderKind) -> Self {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let errors: Arc<Mutex<Option<ErrorCallback>>> = Arc::new(Mutex::new(None));

        let mut workers = Vec::with_capacity(cores);
        for index in 0..cores {
            let receiver = Arc::clone(&receiver);
            let errors = Arc::clone(&errors);
            let handle = thread::Builder::new()
                .name(format!("termlay-load-{index}"))
                .spawn(move || match kind {
                    LoaderKind::Process => worker::process_pool_thread(receiver, errors),
                    _ => thread_pool_thread(receiver, errors),
                })
                .expect("spawning a loader thread");
            workers.push(handle);
        }

        debug!("{} loader started with {} workers", kind.name(), cores);
        Self {
            strategy: Strategy::Pool { queue: sender },
            errors,
            _workers: workers,
        }
    }

    /// Registers the handler called for decode failures.
    pub fn register_error_handler(&self, handler: ErrorCallback) {
        *self.errors.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Starts loading `path` and returns the holder the image will be
    /// assigned to. Never blocks on the pool strategies.
    pub fn load(&self, path: &Path) -> Arc<ImageHolder> {
        match &self.strategy {
            Strategy::Synchronous => {
                let image = match load_image(path) {
                    Ok(image) => Arc::new(image),
                    Err(error) => {
                        self.report(&error);
                        Arc::new(placeholder())
                    }
                };
                Arc::new(ImageHolder::new_ready(path.to_path_buf(), image))
            }
            Strategy::Pool { queue } => {
                let holder = Arc::new(ImageHolder::new(path.to_path_buf()));
                if queue.send(Arc::downgrade(&holder)).is_err() {
                    // Pool already shut down; fall back to an inline decode.
                    warn!("loader pool gone, decoding {} inline", path.display());
                    let image = match load_image(path) {
                        Ok(image) => Arc::new(image),
                        Err(error) => {
                            self.report(&error);
                            Arc::new(placeholder())
                        }
                    };
                    holder.reveal(image);
                }
                holder
            }
        }
    }

    fn report(&self, error: &ImageLoadError) {
        report_shared(&self.errors, error);
    }
}

fn thread_pool_thread(
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    errors: Arc<Mutex<Option<ErrorCallback>>>,
) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(|e| e.into_inner());
            receiver.recv()
        };
        let holder = match job {
            Ok(weak) => match weak.upgrade() {
                Some(holder) => holder,
                None => continue,
            },
            Err(_) => return,
        };

        let image = match load_image(holder.path()) {
            Ok(image) => Arc::new(image),
            Err(error) => {
                report_shared(&errors, &error);
                Arc::new(placeholder())
            }
        };
        holder.reveal(image);
    }
}

pub(crate) fn report_shared(
    errors: &Arc<Mutex<Option<ErrorCallback>>>,
    error: &ImageLoadError,
) {
    let handler = errors.lock().unwrap_or_else(|e| e.into_inner()).clone();
    if let Some(handler) = handler {
        handler(error);
    }
}
