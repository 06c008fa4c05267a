//! Rasterline Core Library
//!
//! Shared value types for the image decode/upload pipeline: integer
//! geometry, 2D transforms, filter quality grades, image identities and
//! draw descriptions.

pub mod geometry;
pub mod image;
pub mod transform;

pub use geometry::{IntRect, IntSize};
pub use image::{
    Bitmap, DrawImage, FilterQuality, ImageId, PixelSource, PixelSourceError, SourceImage,
};
pub use transform::Transform2d;
