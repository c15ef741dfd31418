// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Per pixel quality measures and the normalized fusion weight maps built from them.
//!
//! Read more about the measures in Mertens, Kautz and Van Reeth, "Exposure Fusion"
//! <http://research.edm.uhasselt.be/tmertens/papers/exposure_fusion_reduced.pdf>

use crate::FusionError;
use crate::utils::UnsafeMatsSyncWrapper;
use opencv::core::{self, AlgorithmHint, Mat, Scalar, Vec3f};
use opencv::{imgproc, prelude::*};
use rayon::prelude::*;

/// Width of the exposedness Gauss curve
pub const EXPOSEDNESS_SIGMA: f32 = 0.2;

/// Selects which quality measures are multiplied into the fusion weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityMeasures {
    /// Absolute Laplacian of the grey image, favours edges and texture.
    pub contrast: bool,
    /// Standard deviation of the color channels, favours vivid colors.
    pub saturation: bool,
    /// Closeness of every channel to mid-gray, penalizes clipped samples.
    pub exposedness: bool,
}

impl QualityMeasures {
    pub const ALL: QualityMeasures = QualityMeasures {
        contrast: true,
        saturation: true,
        exposedness: true,
    };

    pub const NONE: QualityMeasures = QualityMeasures {
        contrast: false,
        saturation: false,
        exposedness: false,
    };
}

impl Default for QualityMeasures {
    /// Exposedness only
    fn default() -> Self {
        Self {
            exposedness: true,
            ..Self::NONE
        }
    }
}

/// Absolute value of the discrete Laplacian (aperture 1) of the grey conversion.
///
/// `img` must be `CV_32FC3`, the result is `CV_32FC1`.
pub fn contrast(img: &Mat) -> Result<Mat, FusionError> {
    let mut grey = Mat::default();
    imgproc::cvt_color(
        img,
        &mut grey,
        imgproc::COLOR_BGR2GRAY,
        0,
        AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;
    let mut lap = Mat::default();
    imgproc::laplacian(
        &grey,
        &mut lap,
        core::CV_32F,
        1,
        1.0,
        0.0,
        core::BORDER_DEFAULT,
    )?;
    Ok(core::abs(&lap)?.to_mat()?)
}

/// Population standard deviation of the three channel values of a pixel.
#[inline]
pub fn pixel_saturation(px: &Vec3f) -> f32 {
    let mean = (px[0] + px[1] + px[2]) / 3.0;
    let variance =
        ((px[0] - mean).powi(2) + (px[1] - mean).powi(2) + (px[2] - mean).powi(2)) / 3.0;
    variance.sqrt()
}

/// Product over the channels of `exp(-(c-0.5)^2 / (2*sigma^2))`.
#[inline]
pub fn pixel_exposedness(px: &Vec3f) -> f32 {
    let two_sigma_sq = 2.0 * EXPOSEDNESS_SIGMA * EXPOSEDNESS_SIGMA;
    (0..3)
        .map(|c| (-(px[c] - 0.5).powi(2) / two_sigma_sq).exp())
        .product()
}

fn map_pixels(img: &Mat, f: impl Fn(&Vec3f) -> f32) -> Result<Mat, FusionError> {
    if img.typ() != core::CV_32FC3 {
        return Err(FusionError::InvalidParams(format!(
            "expected a CV_32FC3 image, got type {}",
            img.typ()
        )));
    }
    // data_typed() wants a continuous buffer, ROIs are not
    let owned;
    let img = if img.is_continuous() {
        img
    } else {
        owned = img.try_clone()?;
        &owned
    };
    let mut dst =
        Mat::new_rows_cols_with_default(img.rows(), img.cols(), core::CV_32FC1, Scalar::all(0.0))?;
    for (d, px) in dst
        .data_typed_mut::<f32>()?
        .iter_mut()
        .zip(img.data_typed::<Vec3f>()?.iter())
    {
        *d = f(px);
    }
    Ok(dst)
}

/// Per pixel color saturation of a `CV_32FC3` image, see [`pixel_saturation`].
pub fn saturation(img: &Mat) -> Result<Mat, FusionError> {
    map_pixels(img, pixel_saturation)
}

/// Per pixel well-exposedness of a `CV_32FC3` image, see [`pixel_exposedness`].
pub fn exposedness(img: &Mat) -> Result<Mat, FusionError> {
    map_pixels(img, pixel_exposedness)
}

/// The raw (not normalized) fusion weight of one image: the product of the
/// enabled measures. With no measure enabled every weight is 1.
pub fn quality_weight(img: &Mat, measures: QualityMeasures) -> Result<Mat, FusionError> {
    let mut weight =
        Mat::new_rows_cols_with_default(img.rows(), img.cols(), core::CV_32FC1, Scalar::all(1.0))?;
    let enabled = [
        (measures.contrast, contrast as fn(&Mat) -> Result<Mat, FusionError>),
        (measures.saturation, saturation),
        (measures.exposedness, exposedness),
    ];
    for (_, measure) in enabled.iter().filter(|(on, _)| *on) {
        let m = measure(img)?;
        let mut product = Mat::default();
        core::multiply(&weight, &m, &mut product, 1.0, -1)?;
        weight = product;
    }
    Ok(weight)
}

/// Divides the weights of every pixel by their sum over all maps, so that they sum
/// to one. Pixels where the sum is exactly zero are left untouched.
pub fn normalize_weights(weights: &mut [Mat]) -> Result<(), FusionError> {
    let Some(first) = weights.first() else {
        return Ok(());
    };
    let mut sum = Mat::new_rows_cols_with_default(
        first.rows(),
        first.cols(),
        core::CV_32FC1,
        Scalar::all(0.0),
    )?;
    for w in weights.iter() {
        let mut s = Mat::default();
        core::add(&sum, w, &mut s, &core::no_array(), -1)?;
        sum = s;
    }
    let sum = sum.data_typed::<f32>()?;
    for w in weights.iter_mut() {
        for (v, s) in w.data_typed_mut::<f32>()?.iter_mut().zip(sum.iter()) {
            if *s != 0.0 {
                *v /= *s;
            }
        }
    }
    Ok(())
}

/// Computes one normalized `CV_32FC1` weight map per `CV_32FC3` image.
///
/// Images are scored in parallel, the maps are returned in input order.
///
/// ```
/// # use libfuser::{prelude::*, opencv::prelude::*, opencv::core};
/// # fn f() -> Result<(),FusionError> {
/// let dark = core::Mat::new_rows_cols_with_default(4, 4, core::CV_32FC3, core::Scalar::all(0.05))?;
/// let grey = core::Mat::new_rows_cols_with_default(4, 4, core::CV_32FC3, core::Scalar::all(0.5))?;
/// let weights = compute_weights(&[dark, grey], QualityMeasures::default())?;
/// assert!(*weights[1].at_2d::<f32>(0, 0)? > 0.99);
/// # Ok(())}
/// # f().unwrap();
/// ```
pub fn compute_weights(images: &[Mat], measures: QualityMeasures) -> Result<Vec<Mat>, FusionError> {
    let images_wr = UnsafeMatsSyncWrapper(images);
    let images_wrmv = &images_wr;
    let mut weights = (0..images.len())
        .into_par_iter()
        .map(move |index| quality_weight(&images_wrmv.0[index], measures))
        .collect::<Result<Vec<Mat>, FusionError>>()?;
    normalize_weights(&mut weights)?;
    Ok(weights)
}
