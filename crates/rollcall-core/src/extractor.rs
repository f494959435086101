//! Face detection / embedding capability.
//!
//! The engine only depends on [`FaceExtractor`]: image bytes in, a set of
//! (region, embedding) pairs out. [`HistogramExtractor`] is a deterministic
//! whole-frame reference implementation built on the `image` crate; model-backed
//! extractors plug in behind the same trait.

use crate::types::{BoundingBox, DetectedFace, Embedding};
use image::imageops::FilterType;
use image::GrayImage;
use thiserror::Error;

const WORK_SIZE: u32 = 160;
const PATCH_SIZE: u32 = 20;
const HISTOGRAM_BINS: usize = 64;
const PATCHES_PER_SIDE: usize = (WORK_SIZE / PATCH_SIZE) as usize;

/// Dimensionality produced by [`HistogramExtractor`].
pub const HISTOGRAM_EMBEDDING_DIM: usize = HISTOGRAM_BINS + PATCHES_PER_SIDE * PATCHES_PER_SIDE;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("no face found in image")]
    NoFace,
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Detect faces in an encoded image and embed each one.
///
/// Implementations are called from blocking worker threads and must be
/// shareable across them.
pub trait FaceExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractError>;

    /// Length of every embedding this extractor produces.
    fn dimensions(&self) -> usize;
}

/// Treats the whole image as a single face and embeds it as a grey-level
/// histogram followed by an 8×8 grid of patch means, L2-normalised.
#[derive(Debug, Default, Clone, Copy)]
pub struct HistogramExtractor;

impl HistogramExtractor {
    fn embed(gray: &GrayImage) -> Embedding {
        let mut values = Vec::with_capacity(HISTOGRAM_EMBEDDING_DIM);

        let mut histogram = [0u32; HISTOGRAM_BINS];
        for pixel in gray.pixels() {
            histogram[pixel.0[0] as usize * HISTOGRAM_BINS / 256] += 1;
        }
        let total = (gray.width() * gray.height()).max(1) as f32;
        values.extend(histogram.iter().map(|&count| count as f32 / total));

        for py in 0..PATCHES_PER_SIDE as u32 {
            for px in 0..PATCHES_PER_SIDE as u32 {
                let mut sum = 0u32;
                for y in py * PATCH_SIZE..(py + 1) * PATCH_SIZE {
                    for x in px * PATCH_SIZE..(px + 1) * PATCH_SIZE {
                        sum += gray.get_pixel(x, y).0[0] as u32;
                    }
                }
                let mean = sum as f32 / (PATCH_SIZE * PATCH_SIZE) as f32;
                values.push(mean / 255.0);
            }
        }

        Embedding::new(values).normalized()
    }
}

impl FaceExtractor for HistogramExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractError> {
        let decoded =
            image::load_from_memory(image).map_err(|e| ExtractError::Decode(e.to_string()))?;
        let (width, height) = (decoded.width(), decoded.height());
        if width == 0 || height == 0 {
            return Err(ExtractError::NoFace);
        }

        let gray = image::imageops::resize(
            &decoded.to_luma8(),
            WORK_SIZE,
            WORK_SIZE,
            FilterType::Triangle,
        );

        tracing::trace!(width, height, "histogram extractor: embedding whole frame");

        Ok(vec![DetectedFace {
            region: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: width as f32,
                height: height as f32,
                confidence: 1.0,
            },
            embedding: Self::embed(&gray),
        }])
    }

    fn dimensions(&self) -> usize {
        HISTOGRAM_EMBEDDING_DIM
    }
}
