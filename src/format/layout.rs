//! Pixel layout enumeration.

use serde::{Deserialize, Serialize};

/// Raw frame layouts the encoder can be fed with.
///
/// Planar layouts store Y, U and V planes back to back; semi-planar layouts
/// store Y followed by one interleaved chroma plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayout {
    /// Packed 8-bit RGB, three bytes per pixel.
    Rgb24,
    /// Planar 4:2:0 (yuv420p).
    I420,
    /// Planar 4:2:2 (yuv422p).
    I422,
    /// Planar 4:4:4 (yuv444p).
    I444,
    /// Semi-planar 4:2:0, chroma interleaved as UV.
    Nv12,
    /// Semi-planar 4:2:0, chroma interleaved as VU.
    Nv21,
}

/// What the write path has to do with a captured frame before streaming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionPlan {
    /// Captured bytes are already in the target layout.
    Passthrough,
    /// Captured bytes must be transformed on a worker thread.
    Offload,
}

/// Dimensions of the planes making up one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneGeometry {
    pub luma_width: usize,
    pub luma_height: usize,
    pub chroma_width: usize,
    pub chroma_height: usize,
}

impl PixelLayout {
    /// Parse an ffmpeg pixel format name.
    ///
    /// Returns `None` for formats the pipeline cannot produce directly; those
    /// are captured as packed RGB and converted by the encoder itself.
    pub fn from_pix_fmt(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "rgb24" => Some(PixelLayout::Rgb24),
            "yuv420p" => Some(PixelLayout::I420),
            "yuv422p" => Some(PixelLayout::I422),
            "yuv444p" => Some(PixelLayout::I444),
            "nv12" => Some(PixelLayout::Nv12),
            "nv21" => Some(PixelLayout::Nv21),
            _ => None,
        }
    }

    /// ffmpeg name of this layout.
    pub fn pix_fmt(&self) -> &'static str {
        match self {
            PixelLayout::Rgb24 => "rgb24",
            PixelLayout::I420 => "yuv420p",
            PixelLayout::I422 => "yuv422p",
            PixelLayout::I444 => "yuv444p",
            PixelLayout::Nv12 => "nv12",
            PixelLayout::Nv21 => "nv21",
        }
    }

    /// Layout the GPU writes into a slot when this layout is the target.
    ///
    /// 4:2:0 variants are subsampled on the GPU, 4:2:2 is read back at full
    /// chroma resolution and subsampled on the CPU.
    pub fn capture_layout(&self) -> PixelLayout {
        match self {
            PixelLayout::Rgb24 => PixelLayout::Rgb24,
            PixelLayout::I420 | PixelLayout::Nv12 | PixelLayout::Nv21 => PixelLayout::I420,
            PixelLayout::I422 | PixelLayout::I444 => PixelLayout::I444,
        }
    }

    pub fn conversion(&self) -> ConversionPlan {
        if self.capture_layout() == *self {
            ConversionPlan::Passthrough
        } else {
            ConversionPlan::Offload
        }
    }

    pub fn is_yuv(&self) -> bool {
        !matches!(self, PixelLayout::Rgb24)
    }

    /// Horizontal and vertical chroma subsampling factors.
    pub fn chroma_subsampling(&self) -> (usize, usize) {
        match self {
            PixelLayout::Rgb24 | PixelLayout::I444 => (1, 1),
            PixelLayout::I422 => (2, 1),
            PixelLayout::I420 | PixelLayout::Nv12 | PixelLayout::Nv21 => (2, 2),
        }
    }

    pub fn planes(&self, width: u32, height: u32) -> PlaneGeometry {
        let (sx, sy) = self.chroma_subsampling();
        let (w, h) = (width as usize, height as usize);
        PlaneGeometry {
            luma_width: w,
            luma_height: h,
            chroma_width: w.div_ceil(sx),
            chroma_height: h.div_ceil(sy),
        }
    }

    /// Bytes in one frame of this layout.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let planes = self.planes(width, height);
        let luma = planes.luma_width * planes.luma_height;
        match self {
            PixelLayout::Rgb24 => luma * 3,
            _ => luma + 2 * planes.chroma_width * planes.chroma_height,
        }
    }
}

impl std::fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.pix_fmt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pix_fmt() {
        assert_eq!(PixelLayout::from_pix_fmt("YUV420P"), Some(PixelLayout::I420));
        assert_eq!(PixelLayout::from_pix_fmt("nv21"), Some(PixelLayout::Nv21));
        assert_eq!(PixelLayout::from_pix_fmt(" yuv444p "), Some(PixelLayout::I444));
        assert_eq!(PixelLayout::from_pix_fmt("yuv420p10le"), None);
    }

    #[test]
    fn test_frame_sizes_1080p() {
        let (w, h) = (1920, 1080);
        assert_eq!(PixelLayout::Rgb24.frame_size(w, h), 1920 * 1080 * 3);
        assert_eq!(PixelLayout::I420.frame_size(w, h), 1920 * 1080 * 3 / 2);
        assert_eq!(PixelLayout::Nv12.frame_size(w, h), 1920 * 1080 * 3 / 2);
        assert_eq!(PixelLayout::I422.frame_size(w, h), 1920 * 1080 * 2);
        assert_eq!(PixelLayout::I444.frame_size(w, h), 1920 * 1080 * 3);
    }

    #[test]
    fn test_capture_layouts() {
        assert_eq!(PixelLayout::Nv12.capture_layout(), PixelLayout::I420);
        assert_eq!(PixelLayout::Nv21.capture_layout(), PixelLayout::I420);
        assert_eq!(PixelLayout::I422.capture_layout(), PixelLayout::I444);
        assert_eq!(PixelLayout::Rgb24.capture_layout(), PixelLayout::Rgb24);
    }

    #[test]
    fn test_only_reordered_layouts_offload() {
        for layout in [PixelLayout::Rgb24, PixelLayout::I420, PixelLayout::I444] {
            assert_eq!(layout.conversion(), ConversionPlan::Passthrough);
        }
        for layout in [PixelLayout::I422, PixelLayout::Nv12, PixelLayout::Nv21] {
            assert_eq!(layout.conversion(), ConversionPlan::Offload);
        }
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&PixelLayout::Nv12).unwrap();
        assert_eq!(json, "\"nv12\"");
    }
}
