//! Grid geometry: template reification, padding and clipping.
//!
//! Everything here is pure and deterministic. Normalized values are fractions of
//! a reference size (the image for [`Rectangle`], the extraction rectangle for
//! [`Template`] positions, the box itself for [`Paddings`]). Pixel values are
//! `f64` until [`pad`] rounds them into a [`PixelRect`].

use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

/// A 2D vector, serialized as `[x, y]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2(pub f64, pub f64);

impl Vec2 {
    pub const ZERO: Self = Self(0.0, 0.0);

    pub fn new(x: f64, y: f64) -> Self {
        Self(x, y)
    }

    pub fn x(&self) -> f64 {
        self.0
    }

    pub fn y(&self) -> f64 {
        self.1
    }

    fn is_finite(&self) -> bool {
        self.0.is_finite() && self.1.is_finite()
    }
}

impl Add for Vec2 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0, self.1 + rhs.1)
    }
}

impl Sub for Vec2 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0, self.1 - rhs.1)
    }
}

/// Component-wise product.
impl Mul for Vec2 {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self(self.0 * rhs.0, self.1 * rhs.1)
    }
}

/// Axis-aligned rectangle given by its top-left corner and size.
///
/// Used both normalized (extraction coords, `[0, 1]` against the image) and in
/// pixel space (box rectangles before rounding).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rectangle {
    pub top_left: Vec2,
    pub size: Vec2,
}

impl Rectangle {
    pub fn new(top_left: Vec2, size: Vec2) -> Self {
        Self { top_left, size }
    }

    /// The whole reference area, `(0, 0)` to `(1, 1)`.
    pub fn full() -> Self {
        Self::new(Vec2::ZERO, Vec2(1.0, 1.0))
    }
}

/// Fractional paddings relative to a box's own width (`l`, `r`) and height
/// (`t`, `b`). Fields missing on the wire take the default paddings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Paddings {
    pub l: f64,
    pub r: f64,
    pub t: f64,
    pub b: f64,
}

impl Paddings {
    pub const NONE: Self = Self {
        l: 0.0,
        r: 0.0,
        t: 0.0,
        b: 0.0,
    };

    pub fn new(l: f64, r: f64, t: f64, b: f64) -> Self {
        Self { l, r, t, b }
    }

    fn is_finite(&self) -> bool {
        [self.l, self.r, self.t, self.b].iter().all(|v| v.is_finite())
    }
}

impl Default for Paddings {
    fn default() -> Self {
        Self {
            l: 0.1,
            r: 0.1,
            t: 0.1,
            b: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
    #[error("{0} boundaries must be sorted in ascending order")]
    UnsortedBoundaries(&'static str),
    #[error("template defines no boxes")]
    EmptyTemplate,
}

/// Description of a grid of extraction boxes, normalized to the extraction
/// rectangle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Template {
    /// Row and column boundaries: `n + 1` boundaries delimit `n` cells. Every
    /// box shares the size of the narrowest column and the shortest row.
    Grid { rows: Vec<f64>, cols: Vec<f64> },

    /// Explicit shared box size plus the top-left offset of every row and
    /// column.
    #[serde(rename_all = "camelCase")]
    Boxes {
        box_size: Vec2,
        rows: Vec<f64>,
        cols: Vec<f64>,
    },
}

impl Template {
    /// Evenly spaced `rows × cols` grid covering the whole rectangle.
    pub fn uniform(rows: usize, cols: usize) -> Self {
        Self::Grid {
            rows: boundaries(rows),
            cols: boundaries(cols),
        }
    }

    fn row_offsets(&self) -> &[f64] {
        match self {
            Self::Grid { rows, .. } => cells(rows),
            Self::Boxes { rows, .. } => rows,
        }
    }

    fn col_offsets(&self) -> &[f64] {
        match self {
            Self::Grid { cols, .. } => cells(cols),
            Self::Boxes { cols, .. } => cols,
        }
    }

    pub fn box_count(&self) -> usize {
        self.row_offsets().len() * self.col_offsets().len()
    }

    /// Normalized size shared by every box.
    pub fn box_size(&self) -> Vec2 {
        match self {
            Self::Grid { rows, cols } => Vec2(min_gap(cols), min_gap(rows)),
            Self::Boxes { box_size, .. } => *box_size,
        }
    }

    /// Box top-left positions in row-major order, plus the shared box size.
    pub fn reify(&self) -> ReifiedModel {
        let cols = self.col_offsets();
        let box_positions = self
            .row_offsets()
            .iter()
            .flat_map(|&y| cols.iter().map(move |&x| Vec2(x, y)))
            .collect();
        ReifiedModel {
            box_positions,
            box_size: self.box_size(),
        }
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        let (rows, cols) = match self {
            Self::Grid { rows, cols } => {
                if !is_sorted(rows) {
                    return Err(GeometryError::UnsortedBoundaries("row"));
                }
                if !is_sorted(cols) {
                    return Err(GeometryError::UnsortedBoundaries("column"));
                }
                (rows, cols)
            }
            Self::Boxes {
                box_size,
                rows,
                cols,
            } => {
                if !box_size.is_finite() {
                    return Err(GeometryError::NonFinite("box size"));
                }
                (rows, cols)
            }
        };
        if !rows.iter().chain(cols).all(|v| v.is_finite()) {
            return Err(GeometryError::NonFinite("template offsets"));
        }
        if self.box_count() == 0 {
            return Err(GeometryError::EmptyTemplate);
        }
        Ok(())
    }
}

fn boundaries(n: usize) -> Vec<f64> {
    (0..=n).map(|i| i as f64 / n as f64).collect()
}

/// Cell starts of a boundary list: every boundary but the last.
fn cells(boundaries: &[f64]) -> &[f64] {
    match boundaries.split_last() {
        Some((_, starts)) => starts,
        None => &[],
    }
}

fn min_gap(boundaries: &[f64]) -> f64 {
    boundaries
        .windows(2)
        .map(|w| w[1] - w[0])
        .reduce(f64::min)
        .unwrap_or(0.0)
}

fn is_sorted(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] <= w[1])
}

/// A template evaluated into concrete normalized positions.
#[derive(Debug, Clone, PartialEq)]
pub struct ReifiedModel {
    pub box_positions: Vec<Vec2>,
    pub box_size: Vec2,
}

impl ReifiedModel {
    pub fn box_count(&self) -> usize {
        self.box_positions.len()
    }
}

/// One extraction session against one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub model: Template,
    pub coords: Rectangle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pads: Option<Paddings>,
}

impl ExtractConfig {
    pub fn new(model: Template, coords: Rectangle) -> Self {
        Self {
            model,
            coords,
            pads: None,
        }
    }

    pub fn with_pads(mut self, pads: Paddings) -> Self {
        self.pads = Some(pads);
        self
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if !self.coords.top_left.is_finite() || !self.coords.size.is_finite() {
            return Err(GeometryError::NonFinite("coords"));
        }
        if let Some(pads) = &self.pads
            && !pads.is_finite()
        {
            return Err(GeometryError::NonFinite("paddings"));
        }
        self.model.validate()
    }
}

/// Pixel-space projection of an [`ExtractConfig`] against one image size.
#[derive(Debug, Clone, PartialEq)]
pub struct ReifiedConfig {
    pub model: ReifiedModel,
    pub top_left: Vec2,
    pub size: Vec2,
    pub box_size: Vec2,
}

impl ReifiedConfig {
    pub fn new(config: &ExtractConfig, image_size: Vec2) -> Self {
        let top_left = config.coords.top_left * image_size;
        let size = config.coords.size * image_size;
        let model = config.model.reify();
        let box_size = model.box_size * size;
        Self {
            model,
            top_left,
            size,
            box_size,
        }
    }

    /// Pixel rectangle of box `idx`, or `None` past the last box.
    pub fn box_rect(&self, idx: usize) -> Option<Rectangle> {
        let position = self.model.box_positions.get(idx)?;
        Some(Rectangle::new(
            self.top_left + *position * self.size,
            self.box_size,
        ))
    }
}

/// Integer pixel rectangle. Width and height may be zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PixelRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl PixelRect {
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// Grows `rect` by `pads` (fractions of its own size) and rounds to the
/// nearest pixel.
pub fn pad(rect: &Rectangle, pads: &Paddings) -> PixelRect {
    let Rectangle {
        top_left: Vec2(x, y),
        size: Vec2(w, h),
    } = *rect;
    PixelRect {
        x: (x - pads.l * w).round() as i64,
        y: (y - pads.t * h).round() as i64,
        width: ((1.0 + pads.l + pads.r) * w).round() as i64,
        height: ((1.0 + pads.t + pads.b) * h).round() as i64,
    }
}

/// Clamps `rect` into a `width × height` image.
///
/// The top-left is clamped to `[0, width - 1] × [0, height - 1]`, the far edge
/// to the image bounds. Never fails: a box past the right or bottom edge keeps
/// a one-pixel strip along that edge, a box past the left or top edge becomes
/// empty. The result is never negative and `clip` is idempotent.
pub fn clip(rect: PixelRect, width: u32, height: u32) -> PixelRect {
    let (w, h) = (i64::from(width), i64::from(height));
    let x0 = rect.x.clamp(0, (w - 1).max(0));
    let y0 = rect.y.clamp(0, (h - 1).max(0));
    let x1 = rect.x.saturating_add(rect.width).clamp(x0, w);
    let y1 = rect.y.saturating_add(rect.height).clamp(y0, h);
    PixelRect::new(x0, y0, x1 - x0, y1 - y0)
}
