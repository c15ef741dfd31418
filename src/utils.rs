// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use super::FusionError;
use opencv::core::{self, AlgorithmHint, Mat, MatTrait, MatTraitConst, Size, Vector};
use opencv::{imgcodecs, imgproc};

/// Extension trait for more ergonomic Mat conversions
pub trait MatExt {
    /// Convert matrix to the given type, `dst = self * alpha + beta`
    ///
    /// # Arguments
    /// * `rtype` - OpenCV type constant (e.g., CV_32FC3, CV_8UC3)
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, FusionError>;
}

impl MatExt for Mat {
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, FusionError> {
        let mut dst = Mat::default();
        self.convert_to(&mut dst, rtype, alpha, beta)?;
        Ok(dst)
    }
}

/// A q&d hack allowing a slice of `opencv::Mat` objects to be `Sync`.
/// Only use this on immutable `Mat` objects.
pub(crate) struct UnsafeMatsSyncWrapper<'a>(pub(crate) &'a [Mat]);
unsafe impl Sync for UnsafeMatsSyncWrapper<'_> {}

/// Typed element write, used by the tests to build small matrices
#[cfg(test)]
pub(crate) trait SetMValue {
    fn set_2d<T: opencv::prelude::DataType>(
        &mut self,
        row: i32,
        col: i32,
        value: T,
    ) -> Result<(), FusionError>;
}

#[cfg(test)]
impl SetMValue for Mat {
    #[inline]
    fn set_2d<T: opencv::prelude::DataType>(
        &mut self,
        row: i32,
        col: i32,
        value: T,
    ) -> Result<(), FusionError> {
        let v = self.at_2d_mut::<T>(row, col)?;
        *v = value;
        Ok(())
    }
}

/// Safe wrapper around OpenCV's `imread` with proper error handling
///
/// OpenCV wants a `&str` path, so paths that are not valid Unicode are
/// rejected with `FusionError::InvalidPathEncoding`.
///
/// Note that OpenCV does not fail on a missing or undecodable file, it returns
/// an empty `Mat`. Use [`read_images`] to get that reported as an error.
///
/// # Example
/// ```no_run
/// # use libfuser::{utils::imread, prelude::*, opencv::prelude::*, opencv::imgcodecs };
/// # use std::path::Path;
/// # fn a() -> Result<(),FusionError> {
/// let img = imread("image.jpg", imgcodecs::IMREAD_UNCHANGED)?;
/// match imread(Path::new("image.png"), imgcodecs::IMREAD_COLOR) {
///     Ok(mat) => /* process image */(),
///     Err(_) => /* handle opencv error */(),
/// }
/// # Ok(()) }
/// ```
#[inline(always)]
pub fn imread<P: AsRef<std::path::Path>>(path: P, flags: i32) -> Result<Mat, FusionError> {
    let path_str = path
        .as_ref()
        .to_str()
        .ok_or_else(|| FusionError::InvalidPathEncoding(path.as_ref().to_path_buf()))?;
    Ok(imgcodecs::imread(path_str, flags)?)
}

/// Writes `img` to `path`, the encoder is picked from the file extension.
///
/// Both an OpenCV error and a `false` return from `imwrite` are reported as
/// `FusionError::SaveFailed`.
pub fn imwrite<P: AsRef<std::path::Path>>(path: P, img: &Mat) -> Result<(), FusionError> {
    let path = path.as_ref();
    let path_str = path
        .to_str()
        .ok_or_else(|| FusionError::InvalidPathEncoding(path.to_path_buf()))?;
    match imgcodecs::imwrite(path_str, img, &Vector::new()) {
        Ok(true) => Ok(()),
        Ok(false) => Err(FusionError::SaveFailed(path.to_path_buf())),
        Err(e) => {
            log::error!("imwrite({path:?}) failed: {e}");
            Err(FusionError::SaveFailed(path.to_path_buf()))
        }
    }
}

/// Reads every file as a 3 channel BGR image, keeping 16 bit samples.
///
/// Greyscale files are expanded to three channels, an alpha channel is dropped
/// and the EXIF orientation of the file is applied.
///
/// Returns `FusionError::ImagesNotRead` if no files were given or if any file
/// could not be decoded.
pub fn read_images<I, P>(files: I) -> Result<Vec<Mat>, FusionError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<std::path::Path>,
{
    let mut images = Vec::new();
    for f in files {
        let img = imread(
            f.as_ref(),
            imgcodecs::IMREAD_COLOR | imgcodecs::IMREAD_ANYDEPTH,
        )?;
        if img.empty() {
            log::error!("Could not decode {:?}", f.as_ref());
            return Err(FusionError::ImagesNotRead);
        }
        images.push(img);
    }
    if images.is_empty() {
        return Err(FusionError::ImagesNotRead);
    }
    Ok(images)
}

/// Checks that there is at least one image, that every image has three channels
/// and that all images have the size of the first one.
///
/// Returns the common image size.
pub fn validate_images(images: &[Mat]) -> Result<Size, FusionError> {
    let first = images.first().ok_or(FusionError::ImagesNotRead)?;
    let size = first.size()?;
    for (index, img) in images.iter().enumerate() {
        if img.empty() {
            return Err(FusionError::ImagesNotRead);
        }
        if img.channels() != 3 {
            return Err(FusionError::ChannelCountMismatch {
                index,
                channels: img.channels(),
            });
        }
        let img_size = img.size()?;
        if img_size != size {
            return Err(FusionError::SizeMismatch {
                index,
                expected: (size.width, size.height),
                found: (img_size.width, img_size.height),
            });
        }
    }
    Ok(size)
}

/// Converts a 3 channel image to `CV_32FC3` with samples in [0,1].
///
/// 8 and 16 bit unsigned samples are scaled by their maximum value,
/// `CV_32F` images are assumed to be normalized already and are copied.
pub fn to_f32(img: &Mat) -> Result<Mat, FusionError> {
    // convert_to() keeps the channel count, only the depth of rtype is used
    match img.depth() {
        core::CV_8U => img.convert(core::CV_32F, 1.0 / 255.0, 0.0),
        core::CV_16U => img.convert(core::CV_32F, 1.0 / 65535.0, 0.0),
        core::CV_32F => Ok(img.clone()),
        depth => Err(FusionError::InvalidParams(format!(
            "unsupported sample depth {depth}, expected 8 bit, 16 bit or 32 bit float"
        ))),
    }
}

/// Converts a normalized floating point image back to 8 bit.
/// Samples are scaled by 255, rounded and saturated to [0,255].
pub fn to_u8(img: &Mat) -> Result<Mat, FusionError> {
    img.convert(core::CV_8U, 255.0, 0.0)
}

/// Converts a `CV_32FC3` BGR image with samples in [0,1] to a 8 bit grey image,
/// the format the feature detectors want.
pub(crate) fn grey_u8(img_f32: &Mat) -> Result<Mat, FusionError> {
    let mut grey = Mat::default();
    imgproc::cvt_color(
        img_f32,
        &mut grey,
        imgproc::COLOR_BGR2GRAY,
        0,
        AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;
    grey.convert(core::CV_8U, 255.0, 0.0)
}

// Helper function to scale an image while maintaining aspect ratio
pub(crate) fn scale_image(img: &Mat, scale_down: f32) -> Result<Mat, FusionError> {
    let size = img.size()?;
    let width = size.width;
    let height = size.height;

    // Calculate scaling factor to make the smaller dimension equal to scale_down
    let scaling_factor = if width < height {
        scale_down as f64 / width as f64
    } else {
        scale_down as f64 / height as f64
    };

    let new_width = ((width as f64 * scaling_factor) as i32).max(1);
    let new_height = ((height as f64 * scaling_factor) as i32).max(1);

    let mut resized = Mat::default();
    imgproc::resize(
        img,
        &mut resized,
        Size::new(new_width, new_height),
        0.0,
        0.0,
        imgproc::INTER_AREA,
    )?;

    Ok(resized)
}

/// Lifts a `CV_64F` homography found between two scaled down images to the full
/// resolution images, `H = S * H_small * S^-1` with `S = diag(sx, sy, 1)`.
pub(crate) fn adjust_homography_for_scale(
    h_small: &Mat,
    small_size: Size,
    orig_size: Size,
) -> Result<Mat, FusionError> {
    let scale_x = orig_size.width as f64 / small_size.width as f64;
    let scale_y = orig_size.height as f64 / small_size.height as f64;

    let mut h_adjusted = h_small.clone();
    *h_adjusted.at_2d_mut::<f64>(0, 1)? *= scale_x / scale_y;
    *h_adjusted.at_2d_mut::<f64>(0, 2)? *= scale_x;
    *h_adjusted.at_2d_mut::<f64>(1, 0)? *= scale_y / scale_x;
    *h_adjusted.at_2d_mut::<f64>(1, 2)? *= scale_y;
    *h_adjusted.at_2d_mut::<f64>(2, 0)? /= scale_x;
    *h_adjusted.at_2d_mut::<f64>(2, 1)? /= scale_y;

    Ok(h_adjusted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, Vec3b};
    use opencv::prelude::*;

    fn solid(rows: i32, cols: i32, typ: i32, v: f64) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, typ, Scalar::all(v)).unwrap()
    }

    #[test]
    fn u8_f32_round_trip_is_identity() {
        // every 8 bit value, in every channel
        let mut img = solid(16, 16, core::CV_8UC3, 0.0);
        for (i, px) in img.data_typed_mut::<Vec3b>().unwrap().iter_mut().enumerate() {
            let v = i as u8;
            *px = Vec3b::from_array([v, 255 - v, v.wrapping_mul(7)]);
        }
        let f = to_f32(&img).unwrap();
        assert_eq!(f.typ(), core::CV_32FC3);
        for px in f.data_typed::<core::Vec3f>().unwrap() {
            for c in 0..3 {
                assert!((0.0..=1.0).contains(&px[c]));
            }
        }
        let back = to_u8(&f).unwrap();
        assert_eq!(back.typ(), core::CV_8UC3);
        let a = img.data_typed::<Vec3b>().unwrap();
        let b = back.data_typed::<Vec3b>().unwrap();
        for (pa, pb) in a.iter().zip(b.iter()) {
            for c in 0..3 {
                assert!((pa[c] as i32 - pb[c] as i32).abs() <= 1);
            }
        }
    }

    #[test]
    fn to_u8_saturates() {
        let f = solid(2, 2, core::CV_32FC3, 1.7);
        let u = to_u8(&f).unwrap();
        assert!(u.data_typed::<Vec3b>().unwrap().iter().all(|p| p[0] == 255));
        let f = solid(2, 2, core::CV_32FC3, -0.3);
        let u = to_u8(&f).unwrap();
        assert!(u.data_typed::<Vec3b>().unwrap().iter().all(|p| p[2] == 0));
    }

    #[test]
    fn sixteen_bit_is_normalized() {
        let img = solid(2, 2, core::CV_16UC3, 65535.0);
        let f = to_f32(&img).unwrap();
        let px = f.data_typed::<core::Vec3f>().unwrap()[0];
        assert!((px[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn validation_reports_the_failing_step() {
        let a = solid(4, 6, core::CV_8UC3, 10.0);
        let b = solid(4, 6, core::CV_8UC3, 20.0);
        assert_eq!(validate_images(&[a.clone(), b]).unwrap(), Size::new(6, 4));

        assert!(matches!(validate_images(&[]), Err(FusionError::ImagesNotRead)));

        let grey = solid(4, 6, core::CV_8UC1, 10.0);
        assert!(matches!(
            validate_images(&[a.clone(), grey]),
            Err(FusionError::ChannelCountMismatch {
                index: 1,
                channels: 1
            })
        ));

        let wide = solid(4, 7, core::CV_8UC3, 10.0);
        assert!(matches!(
            validate_images(&[a, wide]),
            Err(FusionError::SizeMismatch { index: 1, .. })
        ));
    }

    #[test]
    fn homography_scale_adjustment_is_a_conjugation() {
        // A pure translation of (2,3) on a half size image is (4,6) at full size
        let mut h = Mat::eye(3, 3, core::CV_64F).unwrap().to_mat().unwrap();
        h.set_2d::<f64>(0, 2, 2.0).unwrap();
        h.set_2d::<f64>(1, 2, 3.0).unwrap();
        let full = adjust_homography_for_scale(&h, Size::new(50, 40), Size::new(100, 80)).unwrap();
        assert!((*full.at_2d::<f64>(0, 2).unwrap() - 4.0).abs() < 1e-12);
        assert!((*full.at_2d::<f64>(1, 2).unwrap() - 6.0).abs() < 1e-12);
        assert!((*full.at_2d::<f64>(0, 0).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn homography_scale_adjustment_matches_the_matrix_product() {
        let h = Mat::from_slice_2d(&[
            [1.02, 0.05, 3.0],
            [-0.04, 0.97, -2.5],
            [1e-4, -2e-4, 1.0],
        ])
        .unwrap();
        let (small, full) = (Size::new(80, 50), Size::new(320, 100));
        let (sx, sy) = (4.0, 2.0);
        let s = Mat::from_slice_2d(&[[sx, 0.0, 0.0], [0.0, sy, 0.0], [0.0, 0.0, 1.0]]).unwrap();
        let s_inv =
            Mat::from_slice_2d(&[[1.0 / sx, 0.0, 0.0], [0.0, 1.0 / sy, 0.0], [0.0, 0.0, 1.0]])
                .unwrap();
        let mut sh = Mat::default();
        core::gemm(&s, &h, 1.0, &core::no_array(), 0.0, &mut sh, 0).unwrap();
        let mut expected = Mat::default();
        core::gemm(&sh, &s_inv, 1.0, &core::no_array(), 0.0, &mut expected, 0).unwrap();

        let adjusted = adjust_homography_for_scale(&h, small, full).unwrap();
        for r in 0..3 {
            for c in 0..3 {
                let a = *adjusted.at_2d::<f64>(r, c).unwrap();
                let e = *expected.at_2d::<f64>(r, c).unwrap();
                assert!((a - e).abs() < 1e-12, "({r},{c}): {a} != {e}");
            }
        }
    }

    #[test]
    fn read_images_gives_three_channels() {
        let dir = tempfile::tempdir().unwrap();
        let grey_path = dir.path().join("grey.png");
        imwrite(&grey_path, &solid(5, 7, core::CV_8UC1, 90.0)).unwrap();
        let deep_path = dir.path().join("deep.png");
        imwrite(&deep_path, &solid(5, 7, core::CV_16UC3, 40000.0)).unwrap();

        let images = read_images([&grey_path, &deep_path]).unwrap();
        assert_eq!(images[0].typ(), core::CV_8UC3);
        assert_eq!(images[0].data_typed::<Vec3b>().unwrap()[0], Vec3b::all(90));
        assert_eq!(images[1].typ(), core::CV_16UC3);
        assert_eq!(validate_images(&images).unwrap(), Size::new(7, 5));

        assert!(matches!(
            read_images([dir.path().join("missing.png")]),
            Err(FusionError::ImagesNotRead)
        ));
    }

    #[test]
    fn scale_image_keeps_aspect_ratio() {
        let img = solid(200, 400, core::CV_8UC1, 0.0);
        let small = scale_image(&img, 100.0).unwrap();
        assert_eq!(small.size().unwrap(), Size::new(200, 100));
    }
}
