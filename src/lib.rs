// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! This library contains exposure fusion functions,
//! based on OpenCV <https://crates.io/crates/opencv> and Rayon <https://crates.io/crates/rayon>.
//!
//! Exposure fusion merges differently exposed photographs of the same scene into one
//! well exposed image:
//! 1. the images are aligned to the first one ([`align`])
//! 2. every pixel of every image is scored for contrast, saturation and
//!    exposedness, and the scores are normalized to sum to one per pixel ([`weights`])
//! 3. the images are blended with their scores in a Laplacian pyramid ([`pyramid`])
//!
//! Read more about the method here:
//! <http://research.edm.uhasselt.be/tmertens/papers/exposure_fusion_reduced.pdf>

pub mod align;
pub mod pyramid;
pub mod utils;
pub mod weights;

pub use opencv;
use opencv::{core::Mat, prelude::*};
use std::path::PathBuf;
use thiserror::Error;

pub use align::{AlignmentParameters, align_images};
pub use pyramid::{DEFAULT_LEVELS, blend_pyramids};
pub use weights::{QualityMeasures, compute_weights};

#[derive(Error, Debug)]
pub enum FusionError {
    #[error(transparent)]
    OpenCvError(#[from] opencv::Error),
    #[error("Images not read")]
    ImagesNotRead,
    #[error("Channel count mismatch: image #{index} has {channels} channel(s), expected 3")]
    ChannelCountMismatch { index: usize, channels: i32 },
    #[error("Size mismatch: image #{index} is {found:?}, expected {expected:?}")]
    SizeMismatch {
        index: usize,
        expected: (i32, i32),
        found: (i32, i32),
    },
    #[error("Weights not generated")]
    WeightsNotGenerated,
    #[error("Blending produced empty output")]
    EmptyBlendOutput,
    #[error("Failed to save output {0}")]
    SaveFailed(PathBuf),
    #[error("Invalid path encoding {0}")]
    InvalidPathEncoding(PathBuf),
    #[error("Invalid parameter(s) {0}")]
    InvalidParams(String),
}

/// Parameters of a complete exposure fusion run.
#[derive(Debug, Clone, Copy)]
pub struct FusionParameters {
    /// Number of pyramid levels used for blending, reduced to what the image size supports.
    pub levels: i32,

    /// Quality measures multiplied into the fusion weights.
    pub measures: QualityMeasures,

    /// Keypoint alignment settings, `None` when the images are known to be aligned.
    pub alignment: Option<AlignmentParameters>,
}

impl Default for FusionParameters {
    fn default() -> Self {
        Self {
            levels: DEFAULT_LEVELS,
            measures: QualityMeasures::default(),
            alignment: Some(AlignmentParameters::default()),
        }
    }
}

/// Fuses decoded images into one image.
///
/// The images must all have three channels and the same size, samples may be
/// 8 bit, 16 bit or normalized `CV_32F`. The first image is the alignment reference.
///
/// # Returns
/// - `Ok(Mat)`: the fused image in `CV_32FC3` format (normalized 0-1 range)
/// - `Err(FusionError)` on:
///   - no images, or images with the wrong channel count or size
///   - invalid parameters
///   - OpenCV failures
///
/// ```
/// # use libfuser::{prelude::*, opencv::prelude::*, opencv::core};
/// # fn f() -> Result<(),FusionError> {
/// let grey = core::Mat::new_rows_cols_with_default(64, 64, core::CV_8UC3, core::Scalar::all(128.0))?;
/// let fused = fuse(&[grey.clone(), grey.clone(), grey], FusionParameters::default())?;
/// assert_eq!(fused.typ(), core::CV_32FC3);
/// # Ok(())}
/// # f().unwrap();
/// ```
pub fn fuse(images: &[Mat], params: FusionParameters) -> Result<Mat, FusionError> {
    let size = utils::validate_images(images)?;
    pyramid::check_levels(params.levels)?;
    log::info!(
        "{} images of {}x{} accepted",
        images.len(),
        size.width,
        size.height
    );

    let images = images
        .iter()
        .map(utils::to_f32)
        .collect::<Result<Vec<_>, _>>()?;

    let images = if let Some(alignment) = params.alignment {
        let (unaligned, aligned) = align_images(&images, alignment)?;
        log::info!(
            "Image alignment complete, {} of {} images left unaligned",
            unaligned,
            images.len().saturating_sub(1)
        );
        aligned
    } else {
        images
    };

    let weights = compute_weights(&images, params.measures)?;
    if weights.len() != images.len() {
        return Err(FusionError::WeightsNotGenerated);
    }
    log::info!("Weight computation complete");

    let output = blend_pyramids(&images, &weights, params.levels)?;
    if output.empty() {
        return Err(FusionError::EmptyBlendOutput);
    }
    log::info!("Blending complete");
    Ok(output)
}

/// Reads the image files, fuses them and writes the result as an 8 bit image.
///
/// The order of `files` matters: the first image defines the frame the others are
/// aligned to. Nothing is written when any step fails.
///
/// ```rust,no_run
/// # use libfuser::prelude::*;
/// # fn f() -> Result<(),FusionError> {
/// exposure_fusion(
///     ["dark.jpg", "normal.jpg", "bright.jpg"],
///     "fused.jpg",
///     FusionParameters {
///         levels: 9,
///         measures: QualityMeasures::ALL,
///         alignment: Some(AlignmentParameters::default()),
///     },
/// )?;
/// # Ok(())}
/// ```
pub fn exposure_fusion<I, P, Q>(files: I, output: Q, params: FusionParameters) -> Result<(), FusionError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<std::path::Path>,
    Q: AsRef<std::path::Path>,
{
    let images = utils::read_images(files)?;
    let fused = fuse(&images, params)?;
    drop(images);
    utils::imwrite(output.as_ref(), &utils::to_u8(&fused)?)?;
    log::info!("Saved {:?}", output.as_ref());
    Ok(())
}

pub mod prelude {
    pub use super::{
        AlignmentParameters, FusionError, FusionParameters, QualityMeasures, align_images,
        blend_pyramids, compute_weights, exposure_fusion, fuse,
    };
}
