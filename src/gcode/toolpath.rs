// src/gcode/toolpath.rs - Modal-state G-code interpreter emitting motion primitives
use serde::Serialize;

use super::{clean_lines, parse_words, strip_comments, Position, Word};

const MM_PER_INCH: f64 = 25.4;

/// Motion modal group (G0/G1/G2/G3/G38.x/G80).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionMode {
    #[default]
    Rapid,
    Linear,
    ArcCw,
    ArcCcw,
    ProbeToward,
    ProbeTowardNoError,
    ProbeAway,
    ProbeAwayNoError,
    Cancel,
}

/// Work coordinate system modal group (G54-G59).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinateSystem {
    #[default]
    G54,
    G55,
    G56,
    G57,
    G58,
    G59,
}

/// Plane selection modal group (G17/G18/G19).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Plane {
    #[default]
    Xy,
    Xz,
    Yz,
}

/// Unit modal group (G20/G21).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Units {
    Inches,
    #[default]
    Millimeters,
}

/// Distance modal group (G90/G91).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distance {
    #[default]
    Absolute,
    Relative,
}

/// Feedrate modal group (G93/G94).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedrateMode {
    InverseTime,
    #[default]
    UnitsPerMinute,
}

/// The sticky G-code settings in effect for a block. Exactly one member
/// of each group is active; a line changes only the groups its words
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModalState {
    pub motion: MotionMode,
    pub coordinate: CoordinateSystem,
    pub plane: Plane,
    pub units: Units,
    pub distance: Distance,
    pub feedrate: FeedrateMode,
}

/// A positioned motion primitive. Coordinates are machine-space
/// millimeters; arc centers are absolute, not offsets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Motion {
    Line {
        modal: ModalState,
        from: Position,
        to: Position,
    },
    Arc {
        modal: ModalState,
        from: Position,
        to: Position,
        center: Position,
    },
}

/// Axis-aligned bounding box over every position a program visits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub min: Position,
    pub max: Position,
}

impl Bounds {
    fn expand(&mut self, p: Position) {
        self.min.x = self.min.x.min(p.x);
        self.min.y = self.min.y.min(p.y);
        self.min.z = self.min.z.min(p.z);
        self.max.x = self.max.x.max(p.x);
        self.max.y = self.max.y.max(p.y);
        self.max.z = self.max.z.max(p.z);
    }
}

/// Parameter words collected for one command.
#[derive(Debug, Clone, Copy, Default)]
struct Params {
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    i: Option<f64>,
    j: Option<f64>,
    k: Option<f64>,
    r: Option<f64>,
    p: Option<f64>,
    s: Option<f64>,
    f: Option<f64>,
}

impl Params {
    fn set(&mut self, word: Word) {
        match word.letter {
            'X' => self.x = Some(word.value),
            'Y' => self.y = Some(word.value),
            'Z' => self.z = Some(word.value),
            'I' => self.i = Some(word.value),
            'J' => self.j = Some(word.value),
            'K' => self.k = Some(word.value),
            'R' => self.r = Some(word.value),
            'P' => self.p = Some(word.value),
            'S' => self.s = Some(word.value),
            'F' => self.f = Some(word.value),
            _ => {}
        }
    }

    fn any_axis(&self) -> bool {
        self.x.is_some()
            || self.y.is_some()
            || self.z.is_some()
            || self.i.is_some()
            || self.j.is_some()
            || self.k.is_some()
    }
}

/// Interprets G-code text into line/arc motion primitives while tracking
/// modal state and position. Pure and synchronous; no I/O. Unsupported
/// codes are silently ignored so a partial dialect never aborts a
/// program.
#[derive(Debug, Clone, Default)]
pub struct ToolpathInterpreter {
    modal: ModalState,
    position: Position,
    dwell_ms: f64,
    bounds: Option<Bounds>,
}

impl ToolpathInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a pass from a known modal state and position instead of the
    /// machine defaults.
    pub fn with_state(modal: ModalState, position: Position) -> Self {
        Self {
            modal,
            position,
            dwell_ms: 0.0,
            bounds: None,
        }
    }

    /// Runs a whole program through the interpreter, invoking `emit` for
    /// every motion primitive in order.
    pub fn interpret(&mut self, text: &str, emit: &mut dyn FnMut(Motion)) {
        for line in clean_lines(text) {
            self.interpret_words(&parse_words(&line), emit);
        }
    }

    /// Interprets a single statement. Comments are stripped first, so raw
    /// program lines can be fed directly.
    pub fn interpret_line(&mut self, line: &str, emit: &mut dyn FnMut(Motion)) {
        let cleaned = strip_comments(line);
        if cleaned.is_empty() || cleaned.starts_with('%') {
            return;
        }
        self.interpret_words(&parse_words(&cleaned), emit);
    }

    fn interpret_words(&mut self, words: &[Word], emit: &mut dyn FnMut(Motion)) {
        // A G or M word opens a command that collects the parameter words
        // after it; axis words with no preceding command replay the
        // sticky motion mode.
        let mut command: Option<Word> = None;
        let mut params = Params::default();
        for &word in words {
            if word.letter == 'G' || word.letter == 'M' {
                self.dispatch(command.take(), params, emit);
                params = Params::default();
                command = Some(word);
            } else {
                params.set(word);
            }
        }
        self.dispatch(command, params, emit);
    }

    fn dispatch(&mut self, command: Option<Word>, params: Params, emit: &mut dyn FnMut(Motion)) {
        match command {
            Some(word) if word.letter == 'G' => {
                let major = word.value.trunc() as i32;
                let minor = ((word.value - word.value.trunc()) * 10.0).round() as i32;
                self.dispatch_g(major, minor, params, emit);
            }
            // M words (spindle, coolant, program control) carry no motion.
            Some(_) => {}
            // Axis words replay the sticky motion mode; spindle/feed/dwell
            // words on their own move nothing.
            None if params.any_axis() => self.dispatch_motion(self.modal.motion, params, emit),
            None => {}
        }
    }

    fn dispatch_g(&mut self, major: i32, minor: i32, params: Params, emit: &mut dyn FnMut(Motion)) {
        match (major, minor) {
            (0, 0) => {
                self.modal.motion = MotionMode::Rapid;
                self.motion_line(params, emit);
            }
            (1, 0) => {
                self.modal.motion = MotionMode::Linear;
                self.motion_line(params, emit);
            }
            (2, 0) => {
                self.modal.motion = MotionMode::ArcCw;
                self.motion_arc(params, true, emit);
            }
            (3, 0) => {
                self.modal.motion = MotionMode::ArcCcw;
                self.motion_arc(params, false, emit);
            }
            (4, 0) => {
                // Dwell: P is milliseconds, S is seconds.
                if let Some(p) = params.p {
                    self.dwell_ms += p;
                }
                if let Some(s) = params.s {
                    self.dwell_ms += s * 1000.0;
                }
            }
            // Offset-table writes are recognized so programs carrying them
            // interpret cleanly, but the tables themselves are not modeled.
            (10, 0) => {}
            (17, 0) => self.modal.plane = Plane::Xy,
            (18, 0) => self.modal.plane = Plane::Xz,
            (19, 0) => self.modal.plane = Plane::Yz,
            (20, 0) => self.modal.units = Units::Inches,
            (21, 0) => self.modal.units = Units::Millimeters,
            (38, 2) => {
                self.modal.motion = MotionMode::ProbeToward;
                self.motion_line(params, emit);
            }
            (38, 3) => {
                self.modal.motion = MotionMode::ProbeTowardNoError;
                self.motion_line(params, emit);
            }
            (38, 4) => {
                self.modal.motion = MotionMode::ProbeAway;
                self.motion_line(params, emit);
            }
            (38, 5) => {
                self.modal.motion = MotionMode::ProbeAwayNoError;
                self.motion_line(params, emit);
            }
            (54, 0) => self.modal.coordinate = CoordinateSystem::G54,
            (55, 0) => self.modal.coordinate = CoordinateSystem::G55,
            (56, 0) => self.modal.coordinate = CoordinateSystem::G56,
            (57, 0) => self.modal.coordinate = CoordinateSystem::G57,
            (58, 0) => self.modal.coordinate = CoordinateSystem::G58,
            (59, 0) => self.modal.coordinate = CoordinateSystem::G59,
            (80, 0) => self.modal.motion = MotionMode::Cancel,
            (90, 0) => self.modal.distance = Distance::Absolute,
            (91, 0) => self.modal.distance = Distance::Relative,
            (92, 0) => {
                // Axis words are absolute; a missing axis sets that axis
                // to zero, so a bare G92 zeroes all three.
                self.position = Position {
                    x: self.translate(self.position.x, Some(params.x.unwrap_or(0.0)), false),
                    y: self.translate(self.position.y, Some(params.y.unwrap_or(0.0)), false),
                    z: self.translate(self.position.z, Some(params.z.unwrap_or(0.0)), false),
                };
            }
            (93, 0) => self.modal.feedrate = FeedrateMode::InverseTime,
            (94, 0) => self.modal.feedrate = FeedrateMode::UnitsPerMinute,
            _ => {
                tracing::debug!("ignoring unsupported code G{}.{}", major, minor);
            }
        }
    }

    fn dispatch_motion(&mut self, mode: MotionMode, params: Params, emit: &mut dyn FnMut(Motion)) {
        match mode {
            MotionMode::Rapid
            | MotionMode::Linear
            | MotionMode::ProbeToward
            | MotionMode::ProbeTowardNoError
            | MotionMode::ProbeAway
            | MotionMode::ProbeAwayNoError => self.motion_line(params, emit),
            MotionMode::ArcCw => self.motion_arc(params, true, emit),
            MotionMode::ArcCcw => self.motion_arc(params, false, emit),
            MotionMode::Cancel => {}
        }
    }

    fn motion_line(&mut self, params: Params, emit: &mut dyn FnMut(Motion)) {
        let target = self.target(params);
        emit(Motion::Line {
            modal: self.modal,
            from: self.position,
            to: target,
        });
        self.expand_bounds(self.position);
        self.expand_bounds(target);
        self.position = target;
    }

    fn motion_arc(&mut self, params: Params, clockwise: bool, emit: &mut dyn FnMut(Motion)) {
        let target = self.target(params);
        // I/J/K are offsets from the start point; a missing offset is zero.
        let center = Position {
            x: self.translate(self.position.x, Some(params.i.unwrap_or(0.0)), true),
            y: self.translate(self.position.y, Some(params.j.unwrap_or(0.0)), true),
            z: self.translate(self.position.z, Some(params.k.unwrap_or(0.0)), true),
        };
        let v1 = to_plane(self.modal.plane, self.position);
        let v2 = to_plane(self.modal.plane, target);
        let mut v0 = to_plane(self.modal.plane, center);

        if let Some(r) = params.r {
            // Radius form: derive the center from chord geometry in the
            // working plane.
            let r = self.to_mm(r);
            let dx = v2.x - v1.x;
            let dy = v2.y - v1.y;
            let distance = (dx * dx + dy * dy).sqrt();
            let det = 4.0 * r * r - dx * dx - dy * dy;
            if distance == 0.0 || det < 0.0 {
                tracing::warn!(
                    "arc radius {} cannot reach endpoint ({}, {}); skipping arc",
                    r,
                    target.x,
                    target.y
                );
                self.expand_bounds(self.position);
                self.expand_bounds(target);
                self.position = target;
                return;
            }
            let mut height = det.sqrt() / 2.0;
            if clockwise {
                height = -height;
            }
            if r < 0.0 {
                height = -height;
            }
            v0.x = v1.x + dx / 2.0 - dy / distance * height;
            v0.y = v1.y + dy / 2.0 + dx / distance * height;
        }

        emit(Motion::Arc {
            modal: self.modal,
            from: self.position,
            to: target,
            center: from_plane(self.modal.plane, v0),
        });
        self.expand_bounds(self.position);
        self.expand_bounds(target);
        self.position = target;
    }

    fn target(&self, params: Params) -> Position {
        let relative = self.is_relative_distance();
        Position {
            x: self.translate(self.position.x, params.x, relative),
            y: self.translate(self.position.y, params.y, relative),
            z: self.translate(self.position.z, params.z, relative),
        }
    }

    /// Resolves one axis word against the current coordinate: inches are
    /// converted to millimeters first, then the value either offsets the
    /// current coordinate (relative) or replaces it (absolute). A missing
    /// word keeps the coordinate unchanged.
    fn translate(&self, current: f64, value: Option<f64>, relative: bool) -> f64 {
        let Some(value) = value else {
            return current;
        };
        let value = self.to_mm(value);
        if relative {
            current + value
        } else {
            value
        }
    }

    fn to_mm(&self, value: f64) -> f64 {
        match self.modal.units {
            Units::Inches => value * MM_PER_INCH,
            Units::Millimeters => value,
        }
    }

    fn expand_bounds(&mut self, p: Position) {
        match &mut self.bounds {
            Some(bounds) => bounds.expand(p),
            None => self.bounds = Some(Bounds { min: p, max: p }),
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn modal(&self) -> ModalState {
        self.modal
    }

    /// Total dwell requested by G4 words, in milliseconds.
    pub fn dwell_ms(&self) -> f64 {
        self.dwell_ms
    }

    /// Bounding box over every visited position, if any motion occurred.
    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    pub fn is_metric_units(&self) -> bool {
        self.modal.units == Units::Millimeters
    }

    pub fn is_imperial_units(&self) -> bool {
        self.modal.units == Units::Inches
    }

    pub fn is_absolute_distance(&self) -> bool {
        self.modal.distance == Distance::Absolute
    }

    pub fn is_relative_distance(&self) -> bool {
        self.modal.distance == Distance::Relative
    }

    pub fn is_xy_plane(&self) -> bool {
        self.modal.plane == Plane::Xy
    }

    pub fn is_xz_plane(&self) -> bool {
        self.modal.plane == Plane::Xz
    }

    pub fn is_yz_plane(&self) -> bool {
        self.modal.plane == Plane::Yz
    }

    pub fn is_inverse_time_feedrate_mode(&self) -> bool {
        self.modal.feedrate == FeedrateMode::InverseTime
    }

    pub fn is_units_per_minute_feedrate_mode(&self) -> bool {
        self.modal.feedrate == FeedrateMode::UnitsPerMinute
    }
}

/// Maps machine axes into the working plane: the first two coordinates
/// are in-plane, the third is the plane normal.
fn to_plane(plane: Plane, p: Position) -> Position {
    match plane {
        Plane::Xy => p,
        Plane::Xz => Position::new(p.z, p.x, p.y),
        Plane::Yz => Position::new(p.y, p.z, p.x),
    }
}

fn from_plane(plane: Plane, p: Position) -> Position {
    match plane {
        Plane::Xy => p,
        Plane::Xz => Position::new(p.y, p.z, p.x),
        Plane::Yz => Position::new(p.z, p.x, p.y),
    }
}
