//! Drawing operations: the unit every client sends, every peer receives,
//! and every room log stores.
//!
//! Two shapes exist:
//! ```text
//! ┌────────────────┐  validate(bounds)  ┌────────────────┐
//! │ WireOperation  │ ─────────────────► │ Operation      │
//! │ (client JSON)  │                    │ (closed Stroke)│
//! │ mode: String   │ ◄───────────────── │ mode: enum     │
//! └────────────────┘      From<&Op>     └────────────────┘
//! ```
//!
//! `WireOperation` mirrors what drawing clients put on the wire (`mode` as a
//! free string, `lines` / `circles` payload arrays). `Operation` only exists
//! once validation succeeded, so a stored or broadcast operation can never
//! carry an unknown mode or a point outside the canvas.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Room used when a client does not name one.
pub const DEFAULT_ROOM: &str = "default";

/// Canvas width shared by every drawing client.
pub const CANVAS_WIDTH: f64 = 1280.0;

/// Canvas height shared by every drawing client.
pub const CANVAS_HEIGHT: f64 = 720.0;

/// A point in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One pencil stroke increment (`line` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: Point,
    pub end: Point,
}

impl Segment {
    pub fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }
}

/// One eraser dab (`circle` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Erase {
    pub center: Point,
    pub radius: f64,
}

impl Erase {
    pub fn new(center: Point, radius: f64) -> Self {
        Self { center, radius }
    }
}

/// Valid coordinate range: `[0, width] × [0, height]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanvasBounds {
    pub width: f64,
    pub height: f64,
}

impl Default for CanvasBounds {
    fn default() -> Self {
        Self {
            width: CANVAS_WIDTH,
            height: CANVAS_HEIGHT,
        }
    }
}

impl CanvasBounds {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Whether the point is finite and inside the canvas (edges included).
    pub fn contains(&self, point: &Point) -> bool {
        point.x.is_finite()
            && point.y.is_finite()
            && (0.0..=self.width).contains(&point.x)
            && (0.0..=self.height).contains(&point.y)
    }

    fn check(&self, point: &Point) -> Result<(), ValidationError> {
        if self.contains(point) {
            Ok(())
        } else {
            Err(ValidationError::OutOfBounds {
                x: point.x,
                y: point.y,
            })
        }
    }
}

/// Operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Pencil,
    Rubber,
    Clear,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Pencil => "pencil",
            Mode::Rubber => "rubber",
            Mode::Clear => "clear",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pencil" => Ok(Mode::Pencil),
            "rubber" => Ok(Mode::Rubber),
            "clear" => Ok(Mode::Clear),
            other => Err(ValidationError::UnknownMode(other.to_string())),
        }
    }
}

/// Payload of a validated operation. Each variant carries only what its
/// mode needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stroke {
    Pencil {
        color: Option<String>,
        segments: Vec<Segment>,
    },
    Rubber {
        erases: Vec<Erase>,
    },
    Clear,
}

impl Stroke {
    pub fn mode(&self) -> Mode {
        match self {
            Stroke::Pencil { .. } => Mode::Pencil,
            Stroke::Rubber { .. } => Mode::Rubber,
            Stroke::Clear => Mode::Clear,
        }
    }
}

/// A validated drawing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Authoring session as chosen by the client. Not unique per operation.
    pub id: String,
    pub room: String,
    pub stroke: Stroke,
    /// Server-assigned at durable-write time (µs since the Unix epoch).
    pub timestamp: Option<u64>,
}

impl Operation {
    pub fn new(id: impl Into<String>, room: impl Into<String>, stroke: Stroke) -> Self {
        let room: String = room.into();
        Self {
            id: id.into(),
            room: room_or_default(Some(room)),
            stroke,
            timestamp: None,
        }
    }

    pub fn pencil(
        id: impl Into<String>,
        room: impl Into<String>,
        color: Option<String>,
        segments: Vec<Segment>,
    ) -> Self {
        Self::new(id, room, Stroke::Pencil { color, segments })
    }

    pub fn rubber(id: impl Into<String>, room: impl Into<String>, erases: Vec<Erase>) -> Self {
        Self::new(id, room, Stroke::Rubber { erases })
    }

    pub fn clear(id: impl Into<String>, room: impl Into<String>) -> Self {
        Self::new(id, room, Stroke::Clear)
    }

    pub fn mode(&self) -> Mode {
        self.stroke.mode()
    }

    pub fn is_clear(&self) -> bool {
        matches!(self.stroke, Stroke::Clear)
    }
}

/// Resolve an optional room name, falling back to [`DEFAULT_ROOM`].
pub fn room_or_default(room: Option<String>) -> String {
    match room {
        Some(name) if !name.is_empty() => name,
        _ => DEFAULT_ROOM.to_string(),
    }
}

/// Operation as it travels over the wire.
///
/// Field names follow the drawing clients (`lines`, `circles`); the
/// `segments` / `erases` spellings are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOperation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub id: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "segments")]
    pub lines: Option<Vec<Segment>>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "erases")]
    pub circles: Option<Vec<Erase>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl WireOperation {
    /// Turn a raw client operation into an [`Operation`] or reject it.
    ///
    /// Payload arrays belonging to the other mode are ignored, and any
    /// client-supplied timestamp is discarded: timestamps are assigned by
    /// the log at write time.
    pub fn validate(self, bounds: &CanvasBounds) -> Result<Operation, ValidationError> {
        let mode: Mode = self.mode.parse()?;
        let stroke = match mode {
            Mode::Pencil => {
                let segments = self.lines.unwrap_or_default();
                if segments.is_empty() {
                    return Err(ValidationError::EmptyPayload(mode));
                }
                for segment in &segments {
                    bounds.check(&segment.start)?;
                    bounds.check(&segment.end)?;
                }
                Stroke::Pencil {
                    color: self.color,
                    segments,
                }
            }
            Mode::Rubber => {
                let erases = self.circles.unwrap_or_default();
                if erases.is_empty() {
                    return Err(ValidationError::EmptyPayload(mode));
                }
                for erase in &erases {
                    bounds.check(&erase.center)?;
                    if !erase.radius.is_finite() || erase.radius < 0.0 {
                        return Err(ValidationError::InvalidRadius(erase.radius));
                    }
                }
                Stroke::Rubber { erases }
            }
            Mode::Clear => Stroke::Clear,
        };

        Ok(Operation {
            id: self.id,
            room: room_or_default(self.room),
            stroke,
            timestamp: None,
        })
    }
}

impl From<&Operation> for WireOperation {
    fn from(op: &Operation) -> Self {
        let (color, lines, circles) = match &op.stroke {
            Stroke::Pencil { color, segments } => (color.clone(), Some(segments.clone()), None),
            Stroke::Rubber { erases } => (None, None, Some(erases.clone())),
            Stroke::Clear => (None, None, None),
        };
        Self {
            room: Some(op.room.clone()),
            id: op.id.clone(),
            mode: op.mode().as_str().to_string(),
            color,
            lines,
            circles,
            timestamp: op.timestamp,
        }
    }
}

impl From<Operation> for WireOperation {
    fn from(op: Operation) -> Self {
        Self::from(&op)
    }
}

/// Reasons an inbound operation is dropped at ingress.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Unknown mode: {0:?}")]
    UnknownMode(String),

    #[error("{0} operation carries an empty payload")]
    EmptyPayload(Mode),

    #[error("Point ({x}, {y}) lies outside the canvas")]
    OutOfBounds { x: f64, y: f64 },

    #[error("Invalid eraser radius: {0}")]
    InvalidRadius(f64),
}
