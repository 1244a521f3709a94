//! Embedding API
//!
//! Drives an overlay child process from another Rust program. A
//! `Canvas` owns the process and a command queue; queued commands are
//! written as JSON lines with `draw` set only on the last one, so a
//! whole batch costs a single redraw. The `lazy` scope extends one
//! batch over arbitrary code.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};

use log::debug;
use serde_json::Value;
use thiserror::Error;

use crate::command::codec::Record;
use crate::geometry::Point;
use crate::scaling::Scaler;

#[derive(Debug, Error)]
pub enum CanvasError {
    #[error("placement identifier '{0}' is already taken")]
    DuplicateIdentifier(String),
    #[error("no placement named '{0}'")]
    UnknownIdentifier(String),
    #[error("overlay process: {0}")]
    Io(#[from] io::Error),
}

/// Whether a placement is currently shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Invisible,
}

/// Everything an `add` command carries besides the identifier.
#[derive(Debug, Clone, Default)]
pub struct PlacementOptions {
    /// Position in terminal cells.
    pub x: i32,
    pub y: i32,
    /// Target box in cells; 0 keeps the intrinsic size.
    pub width: u32,
    pub height: u32,
    pub anchor: Point,
    pub scaler: Scaler,
    pub path: PathBuf,
}

struct PlacementState {
    options: PlacementOptions,
    visible: bool,
}

/// Handle to a spawned overlay process.
pub struct Canvas {
    child: Child,
    stdin: Option<ChildStdin>,
    queue: Vec<Record>,
    lazy_depth: u32,
    placements: HashMap<String, PlacementState>,
}

impl Canvas {
    /// Spawns `termlay layer` speaking JSON on its stdin.
    pub fn spawn() -> Result<Self, CanvasError> {
        let executable =
            std::env::current_exe().unwrap_or_else(|_| PathBuf::from(env!("CARGO_PKG_NAME")));
        let mut child = Command::new(executable)
            .args(["layer", "--parser", "json"])
            .stdin(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "child stdin not captured")
        })?;
        debug!("overlay child pid {}", child.id());

        Ok(Self {
            child,
            stdin: Some(stdin),
            queue: Vec::new(),
            lazy_depth: 0,
            placements: HashMap::new(),
        })
    }

    /// Registers a placement. A visible placement is drawn immediately
    /// (or at the end of the surrounding lazy scope).
    pub fn create_placement(
        &mut self,
        identifier: &str,
        options: PlacementOptions,
        visibility: Visibility,
    ) -> Result<(), CanvasError> {
        if self.placements.contains_key(identifier) {
            return Err(CanvasError::DuplicateIdentifier(identifier.to_string()));
        }

        let visible = visibility == Visibility::Visible;
        if visible {
            self.enqueue(add_record(identifier, &options))?;
        }
        self.placements
            .insert(identifier.to_string(), PlacementState { options, visible });
        Ok(())
    }

    /// Replaces the geometry of an existing placement and, when it is
    /// visible, reissues the draw.
    pub fn update_placement(
        &mut self,
        identifier: &str,
        options: PlacementOptions,
    ) -> Result<(), CanvasError> {
        let state = self
            .placements
            .get_mut(identifier)
            .ok_or_else(|| CanvasError::UnknownIdentifier(identifier.to_string()))?;
        state.options = options;
        if state.visible {
            let record = add_record(identifier, &state.options);
            self.enqueue(record)?;
        }
        Ok(())
    }

    /// Shows or hides a placement without forgetting its geometry.
    pub fn set_visibility(
        &mut self,
        identifier: &str,
        visibility: Visibility,
    ) -> Result<(), CanvasError> {
        let state = self
            .placements
            .get_mut(identifier)
            .ok_or_else(|| CanvasError::UnknownIdentifier(identifier.to_string()))?;
        let wanted = visibility == Visibility::Visible;
        if state.visible == wanted {
            return Ok(());
        }
        state.visible = wanted;

        let record = if wanted {
            add_record(identifier, &state.options)
        } else {
            remove_record(identifier)
        };
        self.enqueue(record)
    }

    /// Removes a placement entirely.
    pub fn remove_placement(&mut self, identifier: &str) -> Result<(), CanvasError> {
        let state = self
            .placements
            .remove(identifier)
            .ok_or_else(|| CanvasError::UnknownIdentifier(identifier.to_string()))?;
        if state.visible {
            self.enqueue(remove_record(identifier))?;
        }
        Ok(())
    }

    /// Batches every command issued inside `body` into one transmission
    /// ending in a single redraw.
    pub fn lazy<R>(
        &mut self,
        body: impl FnOnce(&mut Self) -> R,
    ) -> Result<R, CanvasError> {
        self.transmit()?;
        self.lazy_depth += 1;
        let result = body(self);
        self.lazy_depth -= 1;
        self.transmit()?;
        Ok(result)
    }

    fn enqueue(&mut self, record: Record) -> Result<(), CanvasError> {
        self.queue.push(record);
        if self.lazy_depth == 0 {
            self.transmit()?;
        }
        Ok(())
    }

    fn transmit(&mut self) -> Result<(), CanvasError> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let batch = encode_batch(std::mem::take(&mut self.queue));
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "overlay process already shut down")
        })?;
        stdin.write_all(batch.as_bytes())?;
        stdin.flush()?;
        Ok(())
    }
}

impl Drop for Canvas {
    fn drop(&mut self) {
        // Closing stdin ends the child's command stream; it tears its
        // windows down and exits.
        let _ = self.transmit();
        drop(self.stdin.take());
        let _ = self.child.wait();
    }
}

/// Serializes a batch, marking only the last command for drawing.
fn encode_batch(queue: Vec<Record>) -> String {
    let total = queue.len();
    let mut batch = String::new();
    for (index, mut record) in queue.into_iter().enumerate() {
        record.insert("draw".into(), Value::Bool(index + 1 == total));
        batch.push_str(&Value::Object(record).to_string());
        batch.push('\n');
    }
    batch
}

fn add_record(identifier: &str, options: &PlacementOptions) -> Record {
    let mut record = Record::new();
    record.insert("action".into(), Value::String("add".into()));
    record.insert("identifier".into(), Value::String(identifier.into()));
    record.insert("x".into(), Value::from(options.x));
    record.insert("y".into(), Value::from(options.y));
    record.insert("width".into(), Value::from(options.width));
    record.insert("height".into(), Value::from(options.height));
    record.insert(
        "scaling_position_x".into(),
        Value::from(f64::from(options.anchor.x)),
    );
    record.insert(
        "scaling_position_y".into(),
        Value::from(f64::from(options.anchor.y)),
    );
    record.insert(
        "scaler".into(),
        Value::String(options.scaler.name().into()),
    );
    record.insert(
        "path".into(),
        Value::String(options.path.to_string_lossy().into_owned()),
    );
    record
}

fn remove_record(identifier: &str) -> Record {
    let mut record = Record::new();
    record.insert("action".into(), Value::String("remove".into()));
    record.insert("identifier".into(), Value::String(identifier.into()));
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_draws_exactly_once() {
        let queue = vec![
            add_record("a", &PlacementOptions::default()),
            add_record("b", &PlacementOptions::default()),
            remove_record("a"),
        ];
        let batch = encode_batch(queue);
        let lines: Vec<&str> = batch.lines().collect();
        assert_eq!(lines.len(), 3);

        let draws: Vec<bool> = lines
            .iter()
            .map(|line| {
                serde_json::from_str::<Value>(line).expect("valid json")["draw"]
                    .as_bool()
                    .expect("draw flag present")
            })
            .collect();
        assert_eq!(draws, [false, false, true]);
    }

    #[test]
    fn add_record_carries_the_full_field_set() {
        let options = PlacementOptions {
            x: 2,
            y: 3,
            width: 10,
            height: 5,
            anchor: Point::new(0.5, 1.0),
            scaler: Scaler::Cover,
            path: PathBuf::from("/tmp/img.png"),
        };
        let record = add_record("pic", &options);
        assert_eq!(record["action"], Value::String("add".into()));
        assert_eq!(record["identifier"], Value::String("pic".into()));
        assert_eq!(record["scaler"], Value::String("cover".into()));
        assert_eq!(record["x"], Value::from(2));
        assert_eq!(record["scaling_position_y"], Value::from(1.0));
    }
}
