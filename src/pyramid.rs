// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Multi resolution blending of images with per pixel weights.
//!
//! Each image is decomposed into a Laplacian pyramid and each weight map into a
//! Gaussian pyramid. The weighted Laplacian levels are summed over all images and
//! the summed pyramid is collapsed into the result.
//!
//! Downsampling an odd dimension can not be undone by doubling, so every
//! upsampled level is resized to the exact size of the level it is combined with.

use crate::FusionError;
use crate::utils::UnsafeMatsSyncWrapper;
use opencv::core::{self, Mat, Size, Vector};
use opencv::{imgproc, prelude::*};
use rayon::prelude::*;

/// Pyramid depth used when nothing else is configured
pub const DEFAULT_LEVELS: i32 = 9;

/// Pyramid primitives. Only [`PyramidBuilder::gaussian`] and
/// [`PyramidBuilder::upsample_to`] need an implementation.
pub trait PyramidBuilder: Sync {
    /// `levels` images, level 0 is `img` and every further level is blurred and
    /// downsampled from the previous one.
    fn gaussian(&self, img: &Mat, levels: i32) -> Result<Vec<Mat>, FusionError>;

    /// Upsamples `img` to roughly twice its size and resizes it to exactly `size`.
    fn upsample_to(&self, img: &Mat, size: Size) -> Result<Mat, FusionError>;

    /// `levels` images: `levels - 1` detail levels followed by the coarsest
    /// Gaussian level as base.
    fn laplacian(&self, img: &Mat, levels: i32) -> Result<Vec<Mat>, FusionError> {
        let mut gauss = self.gaussian(img, levels)?;
        let mut pyramid = Vec::with_capacity(gauss.len());
        for k in 0..gauss.len().saturating_sub(1) {
            let up = self.upsample_to(&gauss[k + 1], gauss[k].size()?)?;
            let mut detail = Mat::default();
            core::subtract(&gauss[k], &up, &mut detail, &core::no_array(), -1)?;
            pyramid.push(detail);
        }
        pyramid.extend(gauss.pop());
        Ok(pyramid)
    }

    /// Inverse of [`PyramidBuilder::laplacian`].
    fn collapse(&self, pyramid: &[Mat]) -> Result<Mat, FusionError> {
        let Some((base, details)) = pyramid.split_last() else {
            return Err(FusionError::EmptyBlendOutput);
        };
        let mut current = base.clone();
        for detail in details.iter().rev() {
            let up = self.upsample_to(&current, detail.size()?)?;
            let mut next = Mat::default();
            core::add(detail, &up, &mut next, &core::no_array(), -1)?;
            current = next;
        }
        Ok(current)
    }
}

/// Pyramids built with `build_pyramid()` and `pyr_up()`.
#[derive(Debug, Clone, Copy)]
pub struct OpenCvPyramid {
    /// Border mode of the downsampling blur.
    pub border_type: i32,
}

impl Default for OpenCvPyramid {
    fn default() -> Self {
        Self {
            border_type: core::BORDER_DEFAULT,
        }
    }
}

impl PyramidBuilder for OpenCvPyramid {
    fn gaussian(&self, img: &Mat, levels: i32) -> Result<Vec<Mat>, FusionError> {
        if levels < 1 {
            return Err(FusionError::InvalidParams(format!(
                "a pyramid needs at least one level, got {levels}"
            )));
        }
        let mut pyramid = Vector::<Mat>::new();
        imgproc::build_pyramid(img, &mut pyramid, levels - 1, self.border_type)?;
        Ok(pyramid.to_vec())
    }

    fn upsample_to(&self, img: &Mat, size: Size) -> Result<Mat, FusionError> {
        let mut up = Mat::default();
        // pyr_up() only supports BORDER_DEFAULT
        imgproc::pyr_up(img, &mut up, Size::default(), core::BORDER_DEFAULT)?;
        if up.size()? == size {
            return Ok(up);
        }
        let mut resized = Mat::default();
        imgproc::resize(&up, &mut resized, size, 0.0, 0.0, imgproc::INTER_LINEAR)?;
        Ok(resized)
    }
}

/// The number of pyramid levels an image of `size` supports before its smaller
/// dimension would drop below one pixel.
pub fn supported_levels(size: Size) -> i32 {
    let smaller = size.width.min(size.height).max(1) as u32;
    (u32::BITS - smaller.leading_zeros()) as i32
}

/// Rejects level counts below one.
pub fn check_levels(levels: i32) -> Result<(), FusionError> {
    if levels < 1 {
        return Err(FusionError::InvalidParams(format!(
            "levels must be at least 1, got {levels}"
        )));
    }
    Ok(())
}

/// Multiplies every channel of `level` with the single channel `weight`.
fn weigh(level: &Mat, weight: &Mat) -> Result<Mat, FusionError> {
    let mut planes = Vector::<Mat>::with_capacity(level.channels() as usize);
    for _ in 0..level.channels() {
        planes.push(weight.clone());
    }
    let mut weight_n = Mat::default();
    core::merge(&planes, &mut weight_n)?;
    let mut weighted = Mat::default();
    core::multiply(level, &weight_n, &mut weighted, 1.0, -1)?;
    Ok(weighted)
}

/// [`blend_pyramids`] with custom pyramid primitives.
pub fn blend_pyramids_with<P: PyramidBuilder>(
    builder: &P,
    images: &[Mat],
    weights: &[Mat],
    levels: i32,
) -> Result<Mat, FusionError> {
    check_levels(levels)?;
    if images.len() != weights.len() {
        return Err(FusionError::InvalidParams(format!(
            "{} images but {} weight maps",
            images.len(),
            weights.len()
        )));
    }
    let Some(first) = images.first() else {
        return Err(FusionError::EmptyBlendOutput);
    };
    let size = first.size()?;
    for (index, (img, weight)) in images.iter().zip(weights.iter()).enumerate() {
        if img.size()? != size || weight.size()? != size {
            return Err(FusionError::InvalidParams(format!(
                "image or weight map #{index} does not have the size of the first image"
            )));
        }
    }
    let levels = levels.min(supported_levels(size));

    // Weighted Laplacian pyramids, one per image, built in parallel
    let images_wr = UnsafeMatsSyncWrapper(images);
    let weights_wr = UnsafeMatsSyncWrapper(weights);
    let images_wrmv = &images_wr;
    let weights_wrmv = &weights_wr;
    let weighted = (0..images.len())
        .into_par_iter()
        .map(move |index| -> Result<Vec<Mat>, FusionError> {
            let laplacian = builder.laplacian(&images_wrmv.0[index], levels)?;
            let weight = builder.gaussian(&weights_wrmv.0[index], levels)?;
            laplacian
                .iter()
                .zip(weight.iter())
                .map(|(l, w)| weigh(l, w))
                .collect()
        })
        .collect::<Result<Vec<Vec<Mat>>, FusionError>>()?;

    // Sum in input order so the result does not depend on scheduling
    let mut output: Vec<Mat> = Vec::with_capacity(levels as usize);
    for level in weighted[0].iter() {
        output.push(Mat::zeros(level.rows(), level.cols(), level.typ())?.to_mat()?);
    }
    for pyramid in weighted.iter() {
        for (acc, level) in output.iter_mut().zip(pyramid.iter()) {
            let mut sum = Mat::default();
            core::add(acc, level, &mut sum, &core::no_array(), -1)?;
            *acc = sum;
        }
    }

    let blended = builder.collapse(&output)?;
    if blended.empty() {
        return Err(FusionError::EmptyBlendOutput);
    }
    Ok(blended)
}

/// Blends `CV_32FC3` images with their normalized `CV_32FC1` weight maps using
/// `levels` pyramid levels.
///
/// `levels` is reduced to what the image size supports, see [`supported_levels`].
///
/// ```
/// # use libfuser::{prelude::*, opencv::prelude::*, opencv::core};
/// # fn f() -> Result<(),FusionError> {
/// let img = core::Mat::new_rows_cols_with_default(30, 41, core::CV_32FC3, core::Scalar::all(0.25))?;
/// let weight = core::Mat::new_rows_cols_with_default(30, 41, core::CV_32FC1, core::Scalar::all(1.0))?;
/// let blended = blend_pyramids(&[img], &[weight], 9)?;
/// assert_eq!(blended.size()?, core::Size::new(41, 30));
/// # Ok(())}
/// # f().unwrap();
/// ```
pub fn blend_pyramids(images: &[Mat], weights: &[Mat], levels: i32) -> Result<Mat, FusionError> {
    blend_pyramids_with(&OpenCvPyramid::default(), images, weights, levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, Vec3f};

    fn pattern(rows: i32, cols: i32) -> Mat {
        let mut img =
            Mat::new_rows_cols_with_default(rows, cols, core::CV_32FC3, Scalar::all(0.0)).unwrap();
        let c = cols as usize;
        for (i, px) in img.data_typed_mut::<Vec3f>().unwrap().iter_mut().enumerate() {
            let (x, y) = ((i % c) as f32, (i / c) as f32);
            *px = Vec3f::from_array([
                0.5 + 0.4 * (x * 0.7).sin(),
                0.5 + 0.4 * (y * 0.3).cos(),
                ((x + y) % 5.0) / 5.0,
            ]);
        }
        img
    }

    fn constant(rows: i32, cols: i32, v: f64) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, core::CV_32FC1, Scalar::all(v)).unwrap()
    }

    fn max_difference(a: &Mat, b: &Mat) -> f32 {
        assert_eq!(a.size().unwrap(), b.size().unwrap());
        a.data_typed::<Vec3f>()
            .unwrap()
            .iter()
            .zip(b.data_typed::<Vec3f>().unwrap().iter())
            .map(|(pa, pb)| (0..3).map(|c| (pa[c] - pb[c]).abs()).fold(0.0, f32::max))
            .fold(0.0, f32::max)
    }

    #[test]
    fn supported_levels_stop_at_one_pixel() {
        assert_eq!(supported_levels(Size::new(1, 1)), 1);
        assert_eq!(supported_levels(Size::new(8, 100)), 4);
        assert_eq!(supported_levels(Size::new(640, 480)), 9);
        assert_eq!(supported_levels(Size::new(0, 0)), 1);
    }

    #[test]
    fn gaussian_levels_halve_with_rounding_up() {
        let g = OpenCvPyramid::default()
            .gaussian(&pattern(23, 37), 4)
            .unwrap();
        let sizes: Vec<Size> = g.iter().map(|m| m.size().unwrap()).collect();
        assert_eq!(
            sizes,
            vec![
                Size::new(37, 23),
                Size::new(19, 12),
                Size::new(10, 6),
                Size::new(5, 3)
            ]
        );
    }

    #[test]
    fn upsample_matches_odd_target_sizes() {
        let builder = OpenCvPyramid::default();
        let up = builder.upsample_to(&pattern(3, 5), Size::new(9, 7)).unwrap();
        assert_eq!(up.size().unwrap(), Size::new(9, 7));
    }

    #[test]
    fn collapse_inverts_decomposition() {
        let builder = OpenCvPyramid::default();
        let img = pattern(29, 37);
        let lap = builder.laplacian(&img, 5).unwrap();
        assert_eq!(lap.len(), 5);
        assert_eq!(lap[0].size().unwrap(), img.size().unwrap());
        let back = builder.collapse(&lap).unwrap();
        assert!(max_difference(&img, &back) < 1e-4);
    }

    #[test]
    fn unit_weight_blend_reproduces_the_image() {
        let img = pattern(33, 50);
        let blended = blend_pyramids(&[img.clone()], &[constant(33, 50, 1.0)], 9).unwrap();
        assert!(max_difference(&img, &blended) < 1e-4);
    }

    #[test]
    fn blend_picks_the_weighted_image() {
        let a = pattern(20, 24);
        let b = Mat::new_rows_cols_with_default(20, 24, core::CV_32FC3, Scalar::all(0.1)).unwrap();
        let blended = blend_pyramids(
            &[a.clone(), b],
            &[constant(20, 24, 1.0), constant(20, 24, 0.0)],
            DEFAULT_LEVELS,
        )
        .unwrap();
        assert!(max_difference(&a, &blended) < 1e-4);
    }

    #[test]
    fn tiny_images_are_blended() {
        let img = pattern(1, 3);
        let blended = blend_pyramids(&[img.clone()], &[constant(1, 3, 1.0)], 9).unwrap();
        assert!(max_difference(&img, &blended) < 1e-5);
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        let img = pattern(8, 8);
        assert!(matches!(
            blend_pyramids(&[img.clone()], &[], 9),
            Err(FusionError::InvalidParams(_))
        ));
        assert!(matches!(
            blend_pyramids(&[img.clone()], &[constant(8, 9, 1.0)], 9),
            Err(FusionError::InvalidParams(_))
        ));
        assert!(matches!(
            blend_pyramids(&[img], &[constant(8, 8, 1.0)], 0),
            Err(FusionError::InvalidParams(_))
        ));
        assert!(matches!(
            blend_pyramids(&[], &[], 9),
            Err(FusionError::EmptyBlendOutput)
        ));
    }
}
