//! Brightness/colour signature of a face crop.
//!
//! Not a learned descriptor: the face region is resampled to a fixed tile
//! and a fixed set of tile pixels is read back. The schedule never depends
//! on pixel values, so the same input always yields the same embedding.

use crate::types::{Embedding, FaceBox, EMBEDDING_DIM};
use thiserror::Error;

/// Side length of the normalised face tile.
pub const TILE_SIZE: usize = 100;

/// Distance in tile pixels between consecutive samples.
const SAMPLE_STRIDE: usize = TILE_SIZE * TILE_SIZE / EMBEDDING_DIM;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("degenerate face region: {width}x{height}")]
    InvalidRegion { width: f32, height: f32 },
}

/// Read access to the pixels of the current frame.
pub trait FrameSample {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// RGB value at (x, y). Only called with in-bounds coordinates.
    fn rgb(&self, x: u32, y: u32) -> [u8; 3];
}

/// Converts a face region of a frame into an [`Embedding`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn extract<F: FrameSample + ?Sized>(
        &self,
        frame: &F,
        face: &FaceBox,
    ) -> Result<Embedding, ExtractError> {
        let width = face.width();
        let height = face.height();
        if !(width > 0.0 && height > 0.0 && width.is_finite() && height.is_finite()) {
            return Err(ExtractError::InvalidRegion { width, height });
        }

        let tile = resample_tile(frame, face);

        let values: Vec<f32> = (0..EMBEDDING_DIM)
            .map(|i| {
                let [r, g, b] = tile[i * SAMPLE_STRIDE];
                (r as f32 + g as f32 + b as f32) / (3.0 * 255.0)
            })
            .collect();

        // Every value is a mean of bytes divided by 255, so this cannot fail.
        Embedding::from_values(values).map_err(|_| ExtractError::InvalidRegion { width, height })
    }
}

/// Bilinearly resample the face region into a `TILE_SIZE`² RGB tile.
///
/// Tile pixels whose source position falls outside the frame are black.
pub(crate) fn resample_tile<F: FrameSample + ?Sized>(frame: &F, face: &FaceBox) -> Vec<[u8; 3]> {
    let mut tile = vec![[0u8; 3]; TILE_SIZE * TILE_SIZE];

    let frame_w = frame.width() as i64;
    let frame_h = frame.height() as i64;
    if frame_w == 0 || frame_h == 0 {
        return tile;
    }

    let (left, top) = face.top_left;
    let scale_x = face.width() / TILE_SIZE as f32;
    let scale_y = face.height() / TILE_SIZE as f32;

    for ty in 0..TILE_SIZE {
        let sy = top + (ty as f32 + 0.5) * scale_y;
        if sy < 0.0 || sy >= frame_h as f32 {
            continue;
        }
        let src_y = sy - 0.5;
        let y0 = (src_y.floor() as i64).clamp(0, frame_h - 1);
        let y1 = (y0 + 1).min(frame_h - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for tx in 0..TILE_SIZE {
            let sx = left + (tx as f32 + 0.5) * scale_x;
            if sx < 0.0 || sx >= frame_w as f32 {
                continue;
            }
            let src_x = sx - 0.5;
            let x0 = (src_x.floor() as i64).clamp(0, frame_w - 1);
            let x1 = (x0 + 1).min(frame_w - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame.rgb(x0 as u32, y0 as u32);
            let tr = frame.rgb(x1 as u32, y0 as u32);
            let bl = frame.rgb(x0 as u32, y1 as u32);
            let br = frame.rgb(x1 as u32, y1 as u32);

            let mut px = [0u8; 3];
            for c in 0..3 {
                let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                    + tr[c] as f32 * fx * (1.0 - fy)
                    + bl[c] as f32 * (1.0 - fx) * fy
                    + br[c] as f32 * fx * fy;
                px[c] = val.round().clamp(0.0, 255.0) as u8;
            }
            tile[ty * TILE_SIZE + tx] = px;
        }
    }

    tile
}


#[cfg(test)]
mod tests {
    use super::test_frames::RgbFrame;
    use super::*;

    #[test]
    fn test_sample_stride() {
        assert_eq!(SAMPLE_STRIDE, 78);
        assert!((EMBEDDING_DIM - 1) * SAMPLE_STRIDE < TILE_SIZE * TILE_SIZE);
    }

    #[test]
    fn test_uniform_frame_yields_channel_mean() {
        let frame = RgbFrame::uniform(64, 48, [30, 60, 90]);
        let face = FaceBox::new((8.0, 8.0), (40.0, 40.0));
        let e = FeatureExtractor.extract(&frame, &face).unwrap();

        assert_eq!(e.values().len(), EMBEDDING_DIM);
        let expected = (30.0 + 60.0 + 90.0) / (3.0 * 255.0);
        for v in e.values() {
            assert!((v - expected).abs() < 1e-6, "got {v}, expected {expected}");
        }
    }

    #[test]
    fn test_values_in_unit_range() {
        let frame = RgbFrame::gradient(320, 240);
        let face = FaceBox::new((50.0, 30.0), (210.0, 200.0));
        let e = FeatureExtractor.extract(&frame, &face).unwrap();
        assert!(e.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_extraction_is_reproducible() {
        let frame = RgbFrame::gradient(320, 240);
        let face = FaceBox::new((17.3, 21.9), (143.1, 188.4));
        let a = FeatureExtractor.extract(&frame, &face).unwrap();
        let b = FeatureExtractor.extract(&frame, &face).unwrap();
        assert_eq!(a.values(), b.values());
    }

    #[test]
    fn test_different_regions_differ() {
        let frame = RgbFrame::gradient(320, 240);
        let left = FeatureExtractor
            .extract(&frame, &FaceBox::new((0.0, 0.0), (100.0, 100.0)))
            .unwrap();
        let right = FeatureExtractor
            .extract(&frame, &FaceBox::new((200.0, 100.0), (300.0, 200.0)))
            .unwrap();
        assert_ne!(left.values(), right.values());
    }

    #[test]
    fn test_degenerate_box_rejected() {
        let frame = RgbFrame::uniform(32, 32, [255, 255, 255]);
        let zero_width = FaceBox::new((10.0, 10.0), (10.0, 20.0));
        let inverted = FaceBox::new((10.0, 20.0), (20.0, 5.0));
        assert!(matches!(
            FeatureExtractor.extract(&frame, &zero_width),
            Err(ExtractError::InvalidRegion { .. })
        ));
        assert!(matches!(
            FeatureExtractor.extract(&frame, &inverted),
            Err(ExtractError::InvalidRegion { .. })
        ));
    }

    #[test]
    fn test_region_outside_frame_is_black() {
        let frame = RgbFrame::uniform(32, 32, [255, 255, 255]);
        let face = FaceBox::new((100.0, 100.0), (150.0, 150.0));
        let e = FeatureExtractor.extract(&frame, &face).unwrap();
        assert!(e.values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_partially_outside_region() {
        // Left half of the box hangs off the frame edge.
        let frame = RgbFrame::uniform(100, 100, [255, 255, 255]);
        let face = FaceBox::new((-50.0, 0.0), (50.0, 100.0));
        let tile = resample_tile(&frame, &face);
        assert_eq!(tile[0], [0, 0, 0]);
        assert_eq!(tile[TILE_SIZE - 1], [255, 255, 255]);
    }
}
