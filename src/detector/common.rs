use std::path::Path;

use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use ort::session::{Session, SessionOutputs, builder::GraphOptimizationLevel};
use rayon::prelude::*;

use crate::types::{Frame, Keypoint};

#[derive(Clone, Debug)]
pub struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub orig_w: u32,
    pub orig_h: u32,
}

#[derive(Clone, Debug)]
pub struct CropTransform {
    pub center: (f32, f32),
    pub side: f32,
    pub angle: f32,
    pub output_size: u32,
    pub orig_w: u32,
    pub orig_h: u32,
}

pub fn load_session(model_path: &Path, intra_threads: usize) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ORT session from {}", model_path.display()))?;
    Ok(session)
}

/// First scalar of output `idx`, if the model produced it.
pub fn scalar_output(outputs: &SessionOutputs<'_>, idx: usize) -> Option<f32> {
    if outputs.len() <= idx {
        return None;
    }
    outputs[idx]
        .try_extract_array::<f32>()
        .ok()
        .and_then(|arr| arr.iter().next().copied())
}

pub fn flat_output(outputs: &SessionOutputs<'_>, idx: usize) -> Result<Vec<f32>> {
    if outputs.len() <= idx {
        return Err(anyhow!(
            "model returned {} outputs, expected at least {}",
            outputs.len(),
            idx + 1
        ));
    }
    let arr = outputs[idx].try_extract_array::<f32>()?;
    Ok(arr.iter().copied().collect())
}

fn check_frame(frame: &Frame) -> Result<()> {
    let expected_len = (frame.width as usize)
        .saturating_mul(frame.height as usize)
        .saturating_mul(4);
    if frame.rgba.len() != expected_len {
        return Err(anyhow!(
            "frame buffer size mismatch: got {}, expected {}",
            frame.rgba.len(),
            expected_len
        ));
    }
    if frame.width == 0 || frame.height == 0 {
        return Err(anyhow!("empty frame {}x{}", frame.width, frame.height));
    }
    Ok(())
}

pub fn prepare_frame_with_size(
    frame: &Frame,
    target_size: u32,
) -> Result<(Array4<f32>, LetterboxInfo)> {
    check_frame(frame)?;

    let scale = target_size as f32 / (frame.width.max(frame.height) as f32);
    let new_w = ((frame.width as f32 * scale).round().max(1.0) as u32).min(target_size);
    let new_h = ((frame.height as f32 * scale).round().max(1.0) as u32).min(target_size);

    let src_image = fir::images::Image::from_vec_u8(
        frame.width,
        frame.height,
        frame.rgba.clone(),
        fir::PixelType::U8x4,
    )?;
    let mut dst_image = fir::images::Image::new(new_w, new_h, fir::PixelType::U8x4);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("fast resize failed")?;
    let resized = dst_image.into_vec();

    let pad_x = ((target_size as i64 - new_w as i64) / 2).max(0) as usize;
    let pad_y = ((target_size as i64 - new_h as i64) / 2).max(0) as usize;
    let mut canvas = vec![0u8; (target_size as usize) * (target_size as usize) * 4];
    for px in canvas.chunks_mut(4) {
        px[3] = 255;
    }
    let dst_stride = target_size as usize * 4;
    let src_stride = new_w as usize * 4;
    for row in 0..(new_h as usize) {
        let dst_offset = (pad_y + row) * dst_stride + pad_x * 4;
        let src_offset = row * src_stride;
        canvas[dst_offset..dst_offset + src_stride]
            .copy_from_slice(&resized[src_offset..src_offset + src_stride]);
    }

    let normalized: Vec<f32> = canvas
        .par_chunks_exact(4)
        .flat_map_iter(|px| {
            [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ]
        })
        .collect();
    let input = Array4::<f32>::from_shape_vec(
        (1, target_size as usize, target_size as usize, 3),
        normalized,
    )
    .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;

    let letterbox = LetterboxInfo {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
        orig_w: frame.width,
        orig_h: frame.height,
    };

    Ok((input, letterbox))
}

/// Splits a flat model output into `count` landmarks of `stride` values,
/// keeping the first three (x, y, z) of each.
pub fn decode_landmarks(flat: &[f32], count: usize, stride: usize) -> Result<Vec<[f32; 3]>> {
    if stride < 3 {
        return Err(anyhow!("landmark stride {stride} too small"));
    }
    if flat.len() < count * stride {
        return Err(anyhow!(
            "unexpected landmarks length: got {}, need {}",
            flat.len(),
            count * stride
        ));
    }

    Ok(flat
        .chunks_exact(stride)
        .take(count)
        .map(|chunk| [chunk[0], chunk[1], chunk[2]])
        .collect())
}

impl LetterboxInfo {
    /// Maps a landmark in model-input pixels back to normalized frame coordinates.
    pub fn to_normalized(&self, point: [f32; 3]) -> Keypoint {
        let [x, y, z] = point;
        let px = ((x - self.pad_x) / self.scale).clamp(0.0, self.orig_w as f32);
        let py = ((y - self.pad_y) / self.scale).clamp(0.0, self.orig_h as f32);
        let pz = z / self.scale;
        Keypoint::new(
            px / self.orig_w as f32,
            py / self.orig_h as f32,
            pz / self.orig_w as f32,
        )
    }
}

pub fn prepare_rotated_crop(
    frame: &Frame,
    center: (f32, f32),
    side: f32,
    angle: f32,
    output_size: u32,
) -> Result<(Array4<f32>, CropTransform)> {
    check_frame(frame)?;

    let half = output_size as f32 / 2.0;
    let scale = side / output_size as f32;
    let cos = angle.cos();
    let sin = angle.sin();

    let data: Vec<f32> = (0..output_size)
        .into_par_iter()
        .flat_map_iter(|y| {
            let dy = (y as f32 + 0.5 - half) * scale;
            (0..output_size).flat_map(move |x| {
                let dx = (x as f32 + 0.5 - half) * scale;
                let src_x = center.0 + dx * cos - dy * sin;
                let src_y = center.1 + dx * sin + dy * cos;
                sample_rgb(frame, src_x, src_y)
            })
        })
        .collect();

    let array =
        Array4::<f32>::from_shape_vec((1, output_size as usize, output_size as usize, 3), data)
            .map_err(|err| anyhow!("failed to build rotated crop tensor: {err}"))?;

    let transform = CropTransform {
        center,
        side,
        angle,
        output_size,
        orig_w: frame.width,
        orig_h: frame.height,
    };

    Ok((array, transform))
}

impl CropTransform {
    /// Maps a point in crop pixels back to frame pixels.
    pub fn project(&self, x: f32, y: f32) -> (f32, f32) {
        let half = self.output_size as f32 / 2.0;
        let scale = self.side / self.output_size as f32;
        let dx = (x - half) * scale;
        let dy = (y - half) * scale;
        let cos = self.angle.cos();
        let sin = self.angle.sin();
        let ox = self.center.0 + dx * cos - dy * sin;
        let oy = self.center.1 + dx * sin + dy * cos;
        (
            ox.clamp(0.0, self.orig_w as f32),
            oy.clamp(0.0, self.orig_h as f32),
        )
    }

    /// Maps a landmark in crop pixels to normalized frame coordinates.
    pub fn to_normalized(&self, point: [f32; 3]) -> Keypoint {
        let [x, y, z] = point;
        let (px, py) = self.project(x, y);
        let pz = z * self.side / self.output_size as f32;
        Keypoint::new(
            px / self.orig_w as f32,
            py / self.orig_h as f32,
            pz / self.orig_w as f32,
        )
    }
}

fn sample_rgb(frame: &Frame, x: f32, y: f32) -> [f32; 3] {
    if x.is_nan() || y.is_nan() {
        return [0.0, 0.0, 0.0];
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let x1 = x0 + 1.0;
    let y1 = y0 + 1.0;

    let (w, h) = (frame.width as i32, frame.height as i32);
    let fetch = |cx: f32, cy: f32| -> [f32; 3] {
        let ix = cx as i32;
        let iy = cy as i32;
        if ix < 0 || iy < 0 || ix >= w || iy >= h {
            return [0.0, 0.0, 0.0];
        }
        let idx = ((iy as u32 * frame.width + ix as u32) as usize) * 4;
        if idx + 2 >= frame.rgba.len() {
            return [0.0, 0.0, 0.0];
        }
        [
            frame.rgba[idx] as f32 / 255.0,
            frame.rgba[idx + 1] as f32 / 255.0,
            frame.rgba[idx + 2] as f32 / 255.0,
        ]
    };

    let fx = x - x0;
    let fy = y - y0;
    let c00 = fetch(x0, y0);
    let c10 = fetch(x1, y0);
    let c01 = fetch(x0, y1);
    let c11 = fetch(x1, y1);

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    [
        lerp(lerp(c00[0], c10[0], fx), lerp(c01[0], c11[0], fx), fy),
        lerp(lerp(c00[1], c10[1], fx), lerp(c01[1], c11[1], fx), fy),
        lerp(lerp(c00[2], c10[2], fx), lerp(c01[2], c11[2], fx), fy),
    ]
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Axis-aligned bounds `(min_x, min_y, max_x, max_y)` of pixel points.
pub fn bounds(points: &[(f32, f32)]) -> Option<(f32, f32, f32, f32)> {
    if points.is_empty() {
        return None;
    }
    Some(points.iter().fold(
        (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
        |acc, &(x, y)| (acc.0.min(x), acc.1.min(y), acc.2.max(x), acc.3.max(y)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32) -> Frame {
        Frame::new(vec![128u8; (width * height * 4) as usize], width, height).unwrap()
    }

    #[test]
    fn letterbox_pads_the_short_side() {
        let frame = solid_frame(200, 100);
        let (input, letterbox) = prepare_frame_with_size(&frame, 64).unwrap();
        assert_eq!(input.shape(), &[1, 64, 64, 3]);
        assert_eq!(letterbox.pad_x, 0.0);
        assert_eq!(letterbox.pad_y, 16.0);
        assert!((letterbox.scale - 0.32).abs() < 1e-6);
    }

    #[test]
    fn letterbox_inverse_maps_to_unit_square() {
        let frame = solid_frame(200, 100);
        let (_, letterbox) = prepare_frame_with_size(&frame, 64).unwrap();
        let kp = letterbox.to_normalized([32.0, 32.0, 0.0]);
        assert!((kp.x - 0.5).abs() < 1e-5);
        assert!((kp.y - 0.5).abs() < 1e-5);
    }

    #[test]
    fn crop_projection_is_centered() {
        let frame = solid_frame(100, 100);
        let (input, transform) = prepare_rotated_crop(&frame, (50.0, 40.0), 20.0, 0.0, 8).unwrap();
        assert_eq!(input.shape(), &[1, 8, 8, 3]);
        let (x, y) = transform.project(4.0, 4.0);
        assert!((x - 50.0).abs() < 1e-4);
        assert!((y - 40.0).abs() < 1e-4);
    }

    #[test]
    fn decode_landmarks_respects_stride() {
        let flat: Vec<f32> = (0..10).map(|v| v as f32).collect();
        let pts = decode_landmarks(&flat, 2, 5).unwrap();
        assert_eq!(pts, vec![[0.0, 1.0, 2.0], [5.0, 6.0, 7.0]]);
        assert!(decode_landmarks(&flat, 3, 5).is_err());
    }
}
