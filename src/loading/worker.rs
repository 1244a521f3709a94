//! Helper-process decode workers
//!
//! The process loader strategy runs the decode in child processes to get
//! real CPU parallelism for large images. Each pool thread owns one
//! worker child and speaks a tiny line-oriented protocol with it:
//! request `<path>\n`, response `ok <w> <h>\n` + raw RGB bytes, or
//! `err <message>\n`.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use image::RgbImage;
use log::{debug, warn};

use super::{load_image, placeholder, report_shared, ErrorCallback, ImageHolder, ImageLoadError};

/// Hidden routine name dispatched by `main`.
pub const WORKER_ROUTINE: &str = "__decode-worker";

/// Worker child entry point: serve decode requests until stdin closes.
pub fn run_worker() -> anyhow::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = stdin.lock();
    let mut writer = io::BufWriter::new(stdout.lock());
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let path = Path::new(line.trim_end_matches('\n'));

        match load_image(path) {
            Ok(image) => {
                writeln!(writer, "ok {} {}", image.width(), image.height())?;
                writer.write_all(image.as_raw())?;
            }
            Err(error) => {
                let message = error.message.replace('\n', " ");
                writeln!(writer, "err {message}")?;
            }
        }
        writer.flush()?;
    }
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Worker {
    fn spawn() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .arg(WORKER_ROUTINE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin missing"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout missing"))?;
        debug!("decode worker spawned (pid {})", child.id());
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Sends one request and reads back the decoded buffer.
    ///
    /// `Err(io::Error)` means the worker itself broke (it gets respawned);
    /// a decode failure comes back as `Ok(Err(..))`.
    fn decode(&mut self, path: &Path) -> io::Result<Result<RgbImage, ImageLoadError>> {
        writeln!(self.stdin, "{}", path.display())?;
        self.stdin.flush()?;

        let mut header = String::new();
        if self.stdout.read_line(&mut header)? == 0 {
            return Err(io::Error::other("worker closed its stdout"));
        }
        let header = header.trim_end_matches('\n');

        if let Some(rest) = header.strip_prefix("ok ") {
            let mut parts = rest.split(' ');
            let width: u32 = parts
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| io::Error::other("malformed worker header"))?;
            let height: u32 = parts
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| io::Error::other("malformed worker header"))?;
            let mut pixels = vec![0u8; width as usize * height as usize * 3];
            self.stdout.read_exact(&mut pixels)?;
            let image = RgbImage::from_raw(width, height, pixels)
                .ok_or_else(|| io::Error::other("worker buffer size mismatch"))?;
            Ok(Ok(image))
        } else if let Some(message) = header.strip_prefix("err ") {
            Ok(Err(ImageLoadError {
                path: path.to_path_buf(),
                message: message.to_string(),
            }))
        } else {
            Err(io::Error::other("malformed worker response"))
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Closing stdin lets the child exit on its own; reap it so no
        // zombie is left behind.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Pool thread body for the process loader strategy.
pub(crate) fn process_pool_thread(
    receiver: Arc<Mutex<mpsc::Receiver<std::sync::Weak<ImageHolder>>>>,
    errors: Arc<Mutex<Option<ErrorCallback>>>,
) {
    let mut worker: Option<Worker> = None;

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

        let image = decode_with_retry(&mut worker, holder.path(), &errors);
        holder.reveal(image);
    }
}

fn decode_with_retry(
    worker: &mut Option<Worker>,
    path: &Path,
    errors: &Arc<Mutex<Option<ErrorCallback>>>,
) -> Arc<RgbImage> {
    // One respawn attempt for a broken worker, then decode inline rather
    // than dropping the request.
    for _ in 0..2 {
        if worker.is_none() {
            match Worker::spawn() {
                Ok(spawned) => *worker = Some(spawned),
                Err(error) => {
                    warn!("failed to spawn decode worker: {error}");
                    break;
                }
            }
        }
        if let Some(active) = worker.as_mut() {
            match active.decode(path) {
                Ok(Ok(image)) => return Arc::new(image),
                Ok(Err(error)) => {
                    report_shared(errors, &error);
                    return Arc::new(placeholder());
                }
                Err(error) => {
                    warn!("decode worker broke ({error}), respawning");
                    *worker = None;
                }
            }
        }
    }

    match load_image(path) {
        Ok(image) => Arc::new(image),
        Err(error) => {
            report_shared(errors, &error);
            Arc::new(placeholder())
        }
    }
}
