//! 2D affine transforms
//!
//! The draw layer hands the cache a full affine transform; the cache only
//! cares about whether the transform decomposes into a scale + translation
//! and, if so, what the scale factors are.

/// A row-major 2x3 affine transform:
///
/// ```text
/// | scale_x  skew_x   tx |
/// | skew_y   scale_y  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform2d {
    pub scale_x: f32,
    pub skew_x: f32,
    pub skew_y: f32,
    pub scale_y: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Transform2d {
    /// The identity transform
    pub fn identity() -> Self {
        Self {
            scale_x: 1.0,
            skew_x: 0.0,
            skew_y: 0.0,
            scale_y: 1.0,
            tx: 0.0,
            ty: 0.0,
        }
    }

    /// A pure scale transform
    pub fn scale(sx: f32, sy: f32) -> Self {
        Self {
            scale_x: sx,
            scale_y: sy,
            ..Self::identity()
        }
    }

    /// A pure translation
    pub fn translation(tx: f32, ty: f32) -> Self {
        Self {
            tx,
            ty,
            ..Self::identity()
        }
    }

    /// A transform with rotation/skew terms, for callers that compose
    /// arbitrary affine matrices.
    pub fn with_skew(mut self, kx: f32, ky: f32) -> Self {
        self.skew_x = kx;
        self.skew_y = ky;
        self
    }

    /// Returns true if this transform is a scale followed by a translation,
    /// with no rotation or skew component. Only such transforms have
    /// well-defined per-axis scale factors for pre-scaled decodes.
    pub fn is_scale_translate(&self) -> bool {
        self.skew_x == 0.0 && self.skew_y == 0.0
    }

    /// Absolute per-axis scale factors.
    ///
    /// For non-decomposable transforms this is the scale of the basis
    /// vectors, which is what the quality downgrade rules key off.
    pub fn scale_factors(&self) -> (f32, f32) {
        if self.is_scale_translate() {
            (self.scale_x.abs(), self.scale_y.abs())
        } else {
            let sx = (self.scale_x * self.scale_x + self.skew_y * self.skew_y).sqrt();
            let sy = (self.scale_y * self.scale_y + self.skew_x * self.skew_x).sqrt();
            (sx, sy)
        }
    }
}

impl Default for Transform2d {
    fn default() -> Self {
        Self::identity()
    }
}
