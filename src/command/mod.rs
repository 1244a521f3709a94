//! Command protocol
//!
//! Flat tagged command type plus its application to the view. Every
//! per-command failure is converted into an error record at this
//! boundary; nothing here may take the control loop down.

pub mod codec;

use std::path::PathBuf;
use std::time::SystemTime;

use log::debug;
use serde_json::Value;
use thiserror::Error;

use crate::geometry::Point;
use crate::loading::ImageLoader;
use crate::scaling::Scaler;
use crate::view::{ImageSource, Placement, View};

use codec::Record;

/// Failure while decoding or validating one command record.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The line could not be parsed at all.
    #[error("{0}")]
    Decode(String),
    /// The record was well-formed but a field was missing or invalid.
    #[error("{0}")]
    Validation(String),
}

impl CommandError {
    /// Error-kind tag used in reported error records.
    pub fn name(&self) -> &'static str {
        match self {
            CommandError::Decode(_) => "DecodeError",
            CommandError::Validation(_) => "ValidationError",
        }
    }
}

/// Payload of an `add` command.
#[derive(Debug, Clone, PartialEq)]
pub struct AddCommand {
    pub identifier: String,
    pub x: i32,
    pub y: i32,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub anchor: Point,
    pub scaler: Scaler,
    pub draw: bool,
}

/// Payload of a `remove` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveCommand {
    pub identifier: String,
    pub draw: bool,
}

/// One decoded command, dispatched by its action tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Add(AddCommand),
    Remove(RemoveCommand),
}

impl Command {
    /// Validates a decoded record into a command.
    pub fn from_record(record: &Record) -> Result<Self, CommandError> {
        let action = require_str(record, "action")?;
        match action.as_str() {
            "add" => Ok(Command::Add(AddCommand {
                identifier: require_str(record, "identifier")?,
                x: require_i32(record, "x")?,
                y: require_i32(record, "y")?,
                path: PathBuf::from(require_str(record, "path")?),
                width: optional_u32(record, "width", 0)?,
                height: optional_u32(record, "height", 0)?,
                anchor: Point::new(
                    optional_f32(record, "scaling_position_x", 0.0)?,
                    optional_f32(record, "scaling_position_y", 0.0)?,
                ),
                scaler: optional_scaler(record, "scaler", Scaler::Contain)?,
                draw: optional_bool(record, "draw", true)?,
            })),
            "remove" => Ok(Command::Remove(RemoveCommand {
                identifier: require_str(record, "identifier")?,
                draw: optional_bool(record, "draw", true)?,
            })),
            other => Err(CommandError::Validation(format!(
                "unknown action '{other}'"
            ))),
        }
    }

    /// Applies this command to the view. Returns true when the mutation
    /// warrants a redraw.
    pub fn apply(self, view: &mut View, loader: &ImageLoader) -> bool {
        match self {
            Command::Add(add) => {
                let draw = add.draw;
                apply_add(add, view, loader);
                draw
            }
            Command::Remove(remove) => {
                let removed = view.media.remove(&remove.identifier).is_some();
                if !removed {
                    debug!("remove of unknown identifier '{}'", remove.identifier);
                }
                // Removing nothing changes nothing on screen.
                removed && remove.draw
            }
        }
    }
}

fn apply_add(add: AddCommand, view: &mut View, loader: &ImageLoader) {
    let current_modified = std::fs::metadata(&add.path)
        .and_then(|meta| meta.modified())
        .ok();

    // An unchanged file keeps the decoded image and its transform cache;
    // only the placement geometry is updated and the loader stays idle.
    if let Some(previous) = view.media.get_mut(&add.identifier) {
        if previous.path == add.path
            && previous.image_if_ready().is_some()
            && !is_newer(current_modified, previous.last_modified)
        {
            previous.x = add.x;
            previous.y = add.y;
            previous.width = add.width;
            previous.height = add.height;
            previous.anchor = add.anchor;
            previous.scaler = add.scaler;
            return;
        }
    }

    let holder = loader.load(&add.path);
    let placement = Placement::new(
        add.x,
        add.y,
        add.width,
        add.height,
        add.anchor,
        add.scaler,
        add.path,
        current_modified,
        ImageSource::Loading(holder),
    );
    // Insertion replaces any placement with the same identifier.
    view.media.replace(add.identifier, placement);
}

fn is_newer(current: Option<SystemTime>, previous: Option<SystemTime>) -> bool {
    match (current, previous) {
        (Some(current), Some(previous)) => current > previous,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Coalescing redraw flag owned by the control loop.
///
/// Scheduling while a redraw is already pending is a no-op; the actual
/// draw happens once per scheduling opportunity and reflects the state
/// at draw time.
#[derive(Debug, Default)]
pub struct RedrawScheduler {
    pending: bool,
}

impl RedrawScheduler {
    pub fn schedule(&mut self) {
        self.pending = true;
    }

    /// Clears the flag and reports whether a redraw was due.
    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }
}

fn require_str(record: &Record, key: &str) -> Result<String, CommandError> {
    match record.get(key) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(other) => Err(CommandError::Validation(format!(
            "field '{key}' must be a string, got {other}"
        ))),
        None => Err(CommandError::Validation(format!(
            "missing required field '{key}'"
        ))),
    }
}

fn require_i32(record: &Record, key: &str) -> Result<i32, CommandError> {
    match record.get(key) {
        Some(value) => parse_i64(key, value).and_then(|number| {
            i32::try_from(number)
                .map_err(|_| CommandError::Validation(format!("field '{key}' out of range")))
        }),
        None => Err(CommandError::Validation(format!(
            "missing required field '{key}'"
        ))),
    }
}

fn optional_u32(record: &Record, key: &str, default: u32) -> Result<u32, CommandError> {
    match record.get(key) {
        Some(value) => parse_i64(key, value).and_then(|number| {
            u32::try_from(number).map_err(|_| {
                CommandError::Validation(format!("field '{key}' must be a non-negative integer"))
            })
        }),
        None => Ok(default),
    }
}

fn optional_f32(record: &Record, key: &str, default: f32) -> Result<f32, CommandError> {
    let Some(value) = record.get(key) else {
        return Ok(default);
    };
    match value {
        Value::Number(number) => number
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| CommandError::Validation(format!("field '{key}' must be a number"))),
        Value::String(text) => text
            .parse()
            .map_err(|_| CommandError::Validation(format!("field '{key}' must be a number"))),
        other => Err(CommandError::Validation(format!(
            "field '{key}' must be a number, got {other}"
        ))),
    }
}

fn optional_bool(record: &Record, key: &str, default: bool) -> Result<bool, CommandError> {
    let Some(value) = record.get(key) else {
        return Ok(default);
    };
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::String(text) => match text.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(CommandError::Validation(format!(
                "field '{key}' must be a boolean"
            ))),
        },
        other => Err(CommandError::Validation(format!(
            "field '{key}' must be a boolean, got {other}"
        ))),
    }
}

fn optional_scaler(record: &Record, key: &str, default: Scaler) -> Result<Scaler, CommandError> {
    let Some(value) = record.get(key) else {
        return Ok(default);
    };
    let name = match value {
        Value::String(text) => text.as_str(),
        other => {
            return Err(CommandError::Validation(format!(
                "field '{key}' must be a string, got {other}"
            )))
        }
    };
    Scaler::parse(name).ok_or_else(|| {
        CommandError::Validation(format!(
            "unknown scaler '{name}' (expected crop, distort, contain, forced_cover or cover)"
        ))
    })
}

fn parse_i64(key: &str, value: &Value) -> Result<i64, CommandError> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| CommandError::Validation(format!("field '{key}' must be an integer"))),
        Value::String(text) => text
            .parse()
            .map_err(|_| CommandError::Validation(format!("field '{key}' must be an integer"))),
        other => Err(CommandError::Validation(format!(
            "field '{key}' must be an integer, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loading::LoaderKind;

    fn decode(line: &str) -> Result<Command, CommandError> {
        let record = codec::CodecKind::Json.decode(line)?;
        Command::from_record(&record)
    }

    fn add_line(identifier: &str, path: &str) -> String {
        format!(r#"{{"action":"add","identifier":"{identifier}","x":0,"y":0,"path":"{path}"}}"#)
    }

    #[test]
    fn add_command_fills_defaults() {
        let command = decode(&add_line("a", "/tmp/a.png")).expect("valid add");
        let Command::Add(add) = command else {
            panic!("expected an add command");
        };
        assert_eq!(add.width, 0);
        assert_eq!(add.height, 0);
        assert_eq!(add.scaler, Scaler::Contain);
        assert_eq!(add.anchor, Point::new(0.0, 0.0));
        assert!(add.draw);
    }

    #[test]
    fn string_typed_fields_are_accepted() {
        // The simple and bash codecs deliver every value as a string.
        let record = codec::CodecKind::Simple
            .decode("action\tadd\tidentifier\ta\tx\t-3\ty\t2\tpath\t/tmp/a.png\tdraw\tFalse")
            .expect("decodes");
        let Command::Add(add) = Command::from_record(&record).expect("validates") else {
            panic!("expected an add command");
        };
        assert_eq!(add.x, -3);
        assert!(!add.draw);
    }

    #[test]
    fn missing_fields_are_validation_errors() {
        let error = decode(r#"{"action":"add","identifier":"a"}"#).unwrap_err();
        assert!(matches!(error, CommandError::Validation(_)));
        assert_eq!(error.name(), "ValidationError");

        let error = decode(r#"{"action":"flip"}"#).unwrap_err();
        assert!(matches!(error, CommandError::Validation(_)));
    }

    #[test]
    fn bad_scaler_is_rejected() {
        let line = r#"{"action":"add","identifier":"a","x":0,"y":0,"path":"/p","scaler":"zoom"}"#;
        assert!(decode(line).is_err());
    }

    #[test]
    fn adding_same_identifier_replaces() {
        let loader = ImageLoader::new(LoaderKind::Synchronous);
        let mut view = View::default();

        for x in [1, 9] {
            let command = Command::Add(AddCommand {
                identifier: "a".into(),
                x,
                y: 0,
                path: PathBuf::from("/no/such/image.png"),
                width: 0,
                height: 0,
                anchor: Point::default(),
                scaler: Scaler::Contain,
                draw: true,
            });
            assert!(command.apply(&mut view, &loader));
        }

        assert_eq!(view.media.len(), 1);
        assert_eq!(view.media.get("a").map(|p| p.x), Some(9));
    }

    #[test]
    fn removing_unknown_identifier_is_a_silent_noop() {
        let loader = ImageLoader::new(LoaderKind::Synchronous);
        let mut view = View::default();
        let command = Command::Remove(RemoveCommand {
            identifier: "ghost".into(),
            draw: true,
        });
        // No redraw for a mutation that changed nothing.
        assert!(!command.apply(&mut view, &loader));
        assert!(view.media.is_empty());
    }

    #[test]
    fn scheduler_coalesces_bursts() {
        let mut scheduler = RedrawScheduler::default();
        assert!(!scheduler.take());

        for _ in 0..10 {
            scheduler.schedule();
        }
        assert!(scheduler.is_pending());
        assert!(scheduler.take());
        // The burst collapsed into a single due redraw.
        assert!(!scheduler.take());
    }
}
