//! Rasterline Render Library
//!
//! The raster side of the pipeline: quality-graded bitmap scaling, an
//! encoded-image pixel source, and the graphics backend abstraction with
//! its lock discipline.

pub mod backend;
pub mod scale;
pub mod source;

pub use backend::{
    BackendCounters, BackendError, ContextGuard, DrawSurface, GraphicsContext, RasterBackend,
    SoftwareBackend, TestBackend, TextureId,
};
pub use scale::scale_bitmap;
pub use source::EncodedImageSource;
