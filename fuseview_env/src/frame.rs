//! The composite debug frame handed to sinks.

use image::RgbImage;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// 8-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const BLACK: Rgb = Rgb(0, 0, 0);

    /// Gray level replicated into all three channels.
    pub fn gray(level: u8) -> Self {
        Self(level, level, level)
    }
}

impl From<Rgb> for image::Rgb<u8> {
    fn from(color: Rgb) -> Self {
        image::Rgb([color.0, color.1, color.2])
    }
}

impl From<image::Rgb<u8>> for Rgb {
    fn from(pixel: image::Rgb<u8>) -> Self {
        Self(pixel[0], pixel[1], pixel[2])
    }
}

/// Axis-aligned pixel rectangle, `x..x + width` by `y..y + height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// True if pixel `(x, y)` lies inside.
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.x as i64
            && y >= self.y as i64
            && x < self.x as i64 + self.width as i64
            && y < self.y as i64 + self.height as i64
    }

    /// Part of `self` that lies inside `other`; `None` if they do not overlap.
    pub fn intersect(&self, other: &PixelRect) -> Option<PixelRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        (x0 < x1 && y0 < y1).then(|| PixelRect::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// Vector geometry drawn on top of the raster panels, in frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Circle {
        center: Point2<f64>,
        radius: f64,
        color: Rgb,
        weight: u32,
    },
    Polyline {
        points: Vec<Point2<f64>>,
        color: Rgb,
        weight: u32,
    },
}

impl Primitive {
    /// Shifts the primitive by `(dx, dy)` pixels.
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        let offset = nalgebra::Vector2::new(dx, dy);
        match self {
            Primitive::Circle { center, radius, color, weight } => Primitive::Circle {
                center: center + offset,
                radius: *radius,
                color: *color,
                weight: *weight,
            },
            Primitive::Polyline { points, color, weight } => Primitive::Polyline {
                points: points.iter().map(|p| p + offset).collect(),
                color: *color,
                weight: *weight,
            },
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            Primitive::Circle { weight, .. } | Primitive::Polyline { weight, .. } => *weight,
        }
    }
}

/// A text caption anchored at its baseline-left corner.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub text: String,
    pub origin: Point2<f64>,
    pub color: Rgb,
}

/// Geometry drawn only inside `clip` (the whole frame when `None`).
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub primitive: Primitive,
    pub clip: Option<PixelRect>,
}

impl Overlay {
    /// Geometry free to span the whole frame.
    pub fn unclipped(primitive: Primitive) -> Self {
        Self { primitive, clip: None }
    }

    /// Geometry confined to one panel.
    pub fn clipped(primitive: Primitive, clip: PixelRect) -> Self {
        Self {
            primitive,
            clip: Some(clip),
        }
    }
}

/// Composite raster plus the overlay geometry still to be drawn.
///
/// Sinks that can draw (an OpenCV window) render `overlays` and `labels`
/// natively; others rasterize the overlays in software first.
#[derive(Debug, Clone)]
pub struct RenderFrame {
    image: RgbImage,

    /// Overlay geometry in frame coordinates
    pub overlays: Vec<Overlay>,

    /// Panel captions
    pub labels: Vec<Label>,
}

impl RenderFrame {
    /// Creates a black frame with no overlays.
    pub fn new(width: u32, height: u32) -> Self {
        Self::from_image(RgbImage::new(width, height))
    }

    /// Wraps an existing raster.
    pub fn from_image(image: RgbImage) -> Self {
        Self {
            image,
            overlays: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// The whole frame as a rectangle.
    pub fn bounds(&self) -> PixelRect {
        PixelRect::new(0, 0, self.width(), self.height())
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn get(&self, x: u32, y: u32) -> Rgb {
        (*self.image.get_pixel(x, y)).into()
    }

    /// Writes a pixel; coordinates outside the frame are ignored.
    pub fn put(&mut self, x: i64, y: i64, color: Rgb) {
        if x >= 0 && y >= 0 && x < self.width() as i64 && y < self.height() as i64 {
            self.image.put_pixel(x as u32, y as u32, color.into());
        }
    }

    /// Packed `RGBRGB...` bytes, row-major.
    pub fn as_rgb_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }
}
