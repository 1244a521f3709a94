//! termlay - X11 image overlay layer for terminal emulators
//!
//! Displays images as click-through child windows positioned over
//! terminal windows and tmux panes, driven by a line-oriented command
//! stream on stdin.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │               Control Loop                    │
//! ├───────────────────────────────────────────────┤
//! │  stdin commands  →  View (placements)         │
//! │  X11 events      →  OverlayWindow per terminal│
//! │  signals         →  re-enumeration / shutdown │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Programs embed the overlay through [`client::Canvas`], which spawns
//! the `layer` routine as a child process and feeds it JSON commands.

pub mod client;
pub mod command;
pub mod config;
pub mod geometry;
pub mod layer;
pub mod loading;
pub mod scaling;
pub mod term;
pub mod view;
pub mod x11;

pub use client::{Canvas, PlacementOptions, Visibility};
pub use geometry::{Distance, Point};
pub use scaling::Scaler;
