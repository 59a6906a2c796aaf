//! Pixel layouts and CPU-side frame conversion.
//!
//! ## Components
//! - `layout`: the `PixelLayout` enumeration, frame/plane sizes and which
//!   layout the GPU reads back for each target
//! - `convert`: pure per-frame transforms from capture layout to target layout,
//!   plus the BT.709 RGB→YUV math shared with the GPU shader

pub mod convert;
pub mod layout;

pub use convert::{convert, rgb_to_planar, rgb_to_ycbcr};
pub use layout::{ConversionPlan, PixelLayout, PlaneGeometry};
