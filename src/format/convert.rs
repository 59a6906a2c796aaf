//! Frame conversion between capture layouts and target layouts.
//!
//! All functions are pure: they read one complete source frame and write one
//! complete destination frame.

use super::layout::PixelLayout;
use crate::error::{PipelineError, PipelineResult};

/// BT.709 luma coefficients.
const KR: f32 = 0.2126;
const KB: f32 = 0.0722;
const KG: f32 = 1.0 - KR - KB;

/// Convert one frame from `src_layout` to `dst_layout`.
///
/// Identical layouts are copied. Supported transforms are the ones the write
/// path needs: I420 → NV12/NV21 and I444 → I422.
pub fn convert(
    src_layout: PixelLayout,
    src: &[u8],
    dst_layout: PixelLayout,
    dst: &mut [u8],
    width: u32,
    height: u32,
) -> PipelineResult<()> {
    let src_size = src_layout.frame_size(width, height);
    let dst_size = dst_layout.frame_size(width, height);

    if src.len() < src_size || dst.len() < dst_size {
        return Err(PipelineError::Other(format!(
            "frame buffer too small for {}x{} {} -> {} ({} / {} bytes)",
            width,
            height,
            src_layout,
            dst_layout,
            src.len(),
            dst.len()
        )));
    }

    match (src_layout, dst_layout) {
        (a, b) if a == b => {
            dst[..dst_size].copy_from_slice(&src[..src_size]);
            Ok(())
        },
        (PixelLayout::I420, PixelLayout::Nv12) => {
            i420_to_semi_planar(src, dst, width, height, false);
            Ok(())
        },
        (PixelLayout::I420, PixelLayout::Nv21) => {
            i420_to_semi_planar(src, dst, width, height, true);
            Ok(())
        },
        (PixelLayout::I444, PixelLayout::I422) => {
            i444_to_i422(src, dst, width, height);
            Ok(())
        },
        (from, to) => Err(PipelineError::UnsupportedConversion {
            from: from.to_string(),
            to: to.to_string(),
        }),
    }
}

/// Merge the U and V planes of an I420 frame into one interleaved plane.
fn i420_to_semi_planar(src: &[u8], dst: &mut [u8], width: u32, height: u32, swap_uv: bool) {
    let planes = PixelLayout::I420.planes(width, height);
    let luma = planes.luma_width * planes.luma_height;
    let chroma = planes.chroma_width * planes.chroma_height;

    dst[..luma].copy_from_slice(&src[..luma]);

    let u = &src[luma..luma + chroma];
    let v = &src[luma + chroma..luma + 2 * chroma];
    let (first, second) = if swap_uv { (v, u) } else { (u, v) };

    for (i, pair) in dst[luma..luma + 2 * chroma]
        .chunks_exact_mut(2)
        .enumerate()
    {
        pair[0] = first[i];
        pair[1] = second[i];
    }
}

/// Halve the horizontal chroma resolution of an I444 frame.
fn i444_to_i422(src: &[u8], dst: &mut [u8], width: u32, height: u32) {
    let w = width as usize;
    let h = height as usize;
    let luma = w * h;
    let half = PixelLayout::I422.planes(width, height).chroma_width;

    dst[..luma].copy_from_slice(&src[..luma]);

    for plane in 0..2 {
        let src_plane = &src[luma * (1 + plane)..luma * (2 + plane)];
        let dst_start = luma + plane * half * h;
        let dst_plane = &mut dst[dst_start..dst_start + half * h];

        for (src_row, dst_row) in src_plane
            .chunks_exact(w)
            .zip(dst_plane.chunks_exact_mut(half))
        {
            for (x, out) in dst_row.iter_mut().enumerate() {
                let a = src_row[2 * x] as u16;
                // Odd widths repeat the last column
                let b = src_row.get(2 * x + 1).copied().unwrap_or(src_row[2 * x]) as u16;
                *out = ((a + b + 1) / 2) as u8;
            }
        }
    }
}

/// Unrounded BT.709 limited-range Y, Cb, Cr of one RGB pixel.
fn ycbcr_f32(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;

    let luma = KR * r + KG * g + KB * b;
    let y = 16.0 + 219.0 * luma;
    let cb = 128.0 + 224.0 * (b - luma) / (2.0 * (1.0 - KB));
    let cr = 128.0 + 224.0 * (r - luma) / (2.0 * (1.0 - KR));
    (y, cb, cr)
}

fn quantize(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// BT.709 limited-range conversion of one RGB pixel.
pub fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (y, cb, cr) = ycbcr_f32(r, g, b);
    (quantize(y), quantize(cb), quantize(cr))
}

/// Convert a packed RGB frame into a planar YUV frame (I420 or I444).
///
/// 4:2:0 chroma is the mean of each 2x2 block. Rows are written in the same
/// order as they appear in `rgb`.
pub fn rgb_to_planar(
    rgb: &[u8],
    dst_layout: PixelLayout,
    dst: &mut [u8],
    width: u32,
    height: u32,
) -> PipelineResult<()> {
    if !matches!(dst_layout, PixelLayout::I420 | PixelLayout::I444) {
        return Err(PipelineError::UnsupportedConversion {
            from: PixelLayout::Rgb24.to_string(),
            to: dst_layout.to_string(),
        });
    }

    let w = width as usize;
    let h = height as usize;
    if rgb.len() < w * h * 3 || dst.len() < dst_layout.frame_size(width, height) {
        return Err(PipelineError::Other(format!(
            "frame buffer too small for {}x{} rgb24 -> {}",
            width, height, dst_layout
        )));
    }

    let planes = dst_layout.planes(width, height);
    let chroma = planes.chroma_width * planes.chroma_height;
    let (sx, sy) = dst_layout.chroma_subsampling();
    let luma_len = w * h;

    let mut cb_acc = vec![0.0f32; chroma];
    let mut cr_acc = vec![0.0f32; chroma];
    let mut counts = vec![0u8; chroma];

    for y in 0..h {
        for x in 0..w {
            let p = (y * w + x) * 3;
            let (luma, cb, cr) = ycbcr_f32(rgb[p], rgb[p + 1], rgb[p + 2]);
            dst[y * w + x] = quantize(luma);

            let c = (y / sy) * planes.chroma_width + x / sx;
            cb_acc[c] += cb;
            cr_acc[c] += cr;
            counts[c] += 1;
        }
    }

    let (u_plane, v_plane) = dst[luma_len..luma_len + 2 * chroma].split_at_mut(chroma);
    for c in 0..chroma {
        let n = counts[c].max(1) as f32;
        u_plane[c] = quantize(cb_acc[c] / n);
        v_plane[c] = quantize(cr_acc[c] / n);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4x2 I420 frame with recognizable planes.
    fn i420_4x2() -> Vec<u8> {
        let mut frame = vec![10, 11, 12, 13, 14, 15, 16, 17];
        frame.extend([100, 101]); // U
        frame.extend([200, 201]); // V
        frame
    }

    #[test]
    fn test_same_layout_is_byte_identical() {
        let src: Vec<u8> = (0..(8 * 4 * 3)).map(|i| i as u8).collect();
        let mut dst = vec![0u8; src.len()];
        convert(PixelLayout::Rgb24, &src, PixelLayout::Rgb24, &mut dst, 8, 4).unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn test_i420_to_nv12_interleaves_uv() {
        let src = i420_4x2();
        let mut dst = vec![0u8; PixelLayout::Nv12.frame_size(4, 2)];
        convert(PixelLayout::I420, &src, PixelLayout::Nv12, &mut dst, 4, 2).unwrap();
        assert_eq!(&dst[..8], &src[..8]);
        assert_eq!(&dst[8..], &[100, 200, 101, 201]);
    }

    #[test]
    fn test_i420_to_nv21_interleaves_vu() {
        let src = i420_4x2();
        let mut dst = vec![0u8; PixelLayout::Nv21.frame_size(4, 2)];
        convert(PixelLayout::I420, &src, PixelLayout::Nv21, &mut dst, 4, 2).unwrap();
        assert_eq!(&dst[8..], &[200, 100, 201, 101]);
    }

    #[test]
    fn test_i444_to_i422_averages_pairs() {
        // 2x1 frame: Y=[1,2], U=[10,13], V=[20,20]
        let src = vec![1, 2, 10, 13, 20, 20];
        let mut dst = vec![0u8; PixelLayout::I422.frame_size(2, 1)];
        convert(PixelLayout::I444, &src, PixelLayout::I422, &mut dst, 2, 1).unwrap();
        assert_eq!(dst, vec![1, 2, 12, 20]);
    }

    #[test]
    fn test_unsupported_pair_is_rejected() {
        let src = vec![0u8; PixelLayout::I420.frame_size(2, 2)];
        let mut dst = vec![0u8; PixelLayout::I444.frame_size(2, 2)];
        let err = convert(PixelLayout::I420, &src, PixelLayout::I444, &mut dst, 2, 2).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedConversion { .. }));
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let src = vec![0u8; 3];
        let mut dst = vec![0u8; 12];
        assert!(convert(PixelLayout::I420, &src, PixelLayout::Nv12, &mut dst, 4, 2).is_err());
    }

    #[test]
    fn test_bt709_reference_points() {
        assert_eq!(rgb_to_ycbcr(0, 0, 0), (16, 128, 128));
        assert_eq!(rgb_to_ycbcr(255, 255, 255), (235, 128, 128));
        let (_, cb, cr) = rgb_to_ycbcr(255, 0, 0);
        assert!(cb < 128);
        assert_eq!(cr, 240);
    }

    #[test]
    fn test_rgb_to_i420_averages_blocks() {
        // 2x2 frame, left column white, right column black
        let rgb = vec![
            255, 255, 255, 0, 0, 0, //
            255, 255, 255, 0, 0, 0,
        ];
        let mut dst = vec![0u8; PixelLayout::I420.frame_size(2, 2)];
        rgb_to_planar(&rgb, PixelLayout::I420, &mut dst, 2, 2).unwrap();
        assert_eq!(&dst[..4], &[235, 16, 235, 16]);
        assert_eq!(&dst[4..], &[128, 128]);
    }

    #[test]
    fn test_rgb_to_i444_keeps_full_chroma() {
        let rgb = vec![255, 0, 0, 0, 0, 255];
        let mut dst = vec![0u8; PixelLayout::I444.frame_size(2, 1)];
        rgb_to_planar(&rgb, PixelLayout::I444, &mut dst, 2, 1).unwrap();
        // Red has low Cb, blue has high Cb
        assert!(dst[2] < 128 && dst[3] > 128);
        // Red has high Cr, blue has low Cr
        assert!(dst[4] > 128 && dst[5] < 128);
    }
}
