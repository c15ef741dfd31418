// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Registration of a set of images onto the frame of the first (reference) image.
//!
//! The work is split over three capabilities, each behind a trait so another
//! vision library could be plugged in:
//! * [`FeatureDetector`]: keypoints and binary descriptors of a grey image
//! * [`Matcher`]: descriptor correspondences between an image and the reference
//! * [`HomographyEstimator`]: a projective transform from the correspondences
//!
//! [`Aligner`] composes the three. Geometry failures never abort the run: an
//! image without a usable homography is passed through unwarped.

use crate::FusionError;
use crate::utils;
use opencv::core::{self, DMatch, KeyPoint, Mat, Point2f, Size, Vector};
use opencv::{calib3d, features2d, imgproc, prelude::*};
use ordered_float::OrderedFloat;

/// A homography needs at least four point pairs.
const MIN_HOMOGRAPHY_POINTS: usize = 4;

/// Parameters for feature detection, matching and homography estimation.
#[derive(Debug, Clone, Copy)]
pub struct AlignmentParameters {
    /// Maximum number of ORB features detected per image.
    pub max_features: i32,

    /// Only keep matches that are mutual nearest neighbours.
    pub cross_check: bool,

    /// Ratio of best matches to keep after sorting by distance, 1.0 keeps all.
    pub match_keep_ratio: f32,

    /// Method used in `opencv::calib3d::find_homography()`, typically `opencv::calib3d::RANSAC`.
    pub method: i32,

    /// Reprojection threshold for RANSAC in `find_homography()`, in pixels.
    pub ransac_reproj_threshold: f64,

    /// Fewer correspondences than this (and never fewer than 4) leaves the image unaligned.
    pub min_correspondences: usize,

    /// Detect features on copies scaled so that the smaller dimension is this many pixels.
    /// `None` detects at full resolution.
    pub scale_down: Option<f32>,

    /// Border mode used when warping images.
    pub border_mode: i32,

    /// Border value used in warping.
    pub border_value: core::Scalar,
}

impl Default for AlignmentParameters {
    fn default() -> Self {
        Self {
            max_features: 4096,
            cross_check: false,
            match_keep_ratio: 1.0,
            method: calib3d::RANSAC,
            ransac_reproj_threshold: 5.0,
            min_correspondences: MIN_HOMOGRAPHY_POINTS,
            scale_down: None,
            border_mode: core::BORDER_CONSTANT,
            border_value: core::Scalar::default(),
        }
    }
}

/// Keypoints and their descriptors, one descriptor row per keypoint.
#[derive(Default)]
pub struct Features {
    pub keypoints: Vector<KeyPoint>,
    pub descriptors: Mat,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Matched point pairs: `query[i]` in the image being aligned corresponds to
/// `reference[i]` in the reference image.
#[derive(Default)]
pub struct Correspondences {
    pub query: Vector<Point2f>,
    pub reference: Vector<Point2f>,
}

impl Correspondences {
    pub fn len(&self) -> usize {
        self.query.len()
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_empty()
    }

    pub fn push(&mut self, query: Point2f, reference: Point2f) {
        self.query.push(query);
        self.reference.push(reference);
    }
}

/// Finds keypoints and descriptors in a 8 bit grey image.
pub trait FeatureDetector {
    fn detect(&mut self, grey: &Mat) -> Result<Features, FusionError>;
}

/// Pairs every query feature with at most one reference feature.
pub trait Matcher {
    fn match_features(
        &self,
        query: &Features,
        reference: &Features,
    ) -> Result<Correspondences, FusionError>;
}

/// Estimates the transform taking query points onto reference points.
///
/// `Ok(None)` means no usable transform could be found, this is not an error.
pub trait HomographyEstimator {
    fn estimate(&self, correspondences: &Correspondences) -> Result<Option<Mat>, FusionError>;
}

/// ORB detector with a capped feature budget.
pub struct OrbDetector {
    orb: core::Ptr<features2d::ORB>,
}

impl OrbDetector {
    pub fn new(max_features: i32) -> Result<Self, FusionError> {
        if max_features <= 0 {
            return Err(FusionError::InvalidParams(format!(
                "max_features must be positive, got {max_features}"
            )));
        }
        let orb = features2d::ORB::create(
            max_features,
            1.2, // scaleFactor
            8,   // nlevels
            31,  // edgeThreshold
            0,   // firstLevel
            2,   // WTA_K
            features2d::ORB_ScoreType::HARRIS_SCORE,
            31, // patchSize
            20, // fastThreshold
        )?;
        Ok(Self { orb })
    }
}

impl FeatureDetector for OrbDetector {
    fn detect(&mut self, grey: &Mat) -> Result<Features, FusionError> {
        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        self.orb
            .detect_and_compute(grey, &Mat::default(), &mut keypoints, &mut descriptors, false)?;
        Ok(Features {
            keypoints,
            descriptors,
        })
    }
}

/// Brute force nearest neighbour matching under Hamming distance.
#[derive(Debug, Clone, Copy)]
pub struct HammingMatcher {
    pub cross_check: bool,
    pub keep_ratio: f32,
}

impl Default for HammingMatcher {
    fn default() -> Self {
        Self {
            cross_check: false,
            keep_ratio: 1.0,
        }
    }
}

impl Matcher for HammingMatcher {
    fn match_features(
        &self,
        query: &Features,
        reference: &Features,
    ) -> Result<Correspondences, FusionError> {
        let mut rv = Correspondences::default();
        if query.descriptors.empty() || reference.descriptors.empty() {
            return Ok(rv);
        }

        let matcher = features2d::BFMatcher::create(core::NORM_HAMMING, self.cross_check)?;
        let mut matches = Vector::<DMatch>::new();
        // one DMatch per query descriptor, several may share the same train index
        matcher.train_match(
            &query.descriptors,
            &reference.descriptors,
            &mut matches,
            &Mat::default(),
        )?;

        let mut matches = matches.to_vec();
        matches.sort_by_key(|m| OrderedFloat(m.distance));
        let num_to_keep = (matches.len() as f32 * self.keep_ratio.clamp(0.0, 1.0)).round() as usize;
        matches.truncate(num_to_keep);

        for m in matches.iter() {
            rv.push(
                query.keypoints.get(m.query_idx as usize)?.pt(),
                reference.keypoints.get(m.train_idx as usize)?.pt(),
            );
        }
        Ok(rv)
    }
}

/// Outlier robust homography estimation with `find_homography()`.
#[derive(Debug, Clone, Copy)]
pub struct RansacEstimator {
    pub method: i32,
    pub ransac_reproj_threshold: f64,
    pub min_correspondences: usize,
}

impl Default for RansacEstimator {
    fn default() -> Self {
        Self {
            method: calib3d::RANSAC,
            ransac_reproj_threshold: 5.0,
            min_correspondences: MIN_HOMOGRAPHY_POINTS,
        }
    }
}

impl HomographyEstimator for RansacEstimator {
    fn estimate(&self, correspondences: &Correspondences) -> Result<Option<Mat>, FusionError> {
        let needed = self.min_correspondences.max(MIN_HOMOGRAPHY_POINTS);
        if correspondences.len() < needed {
            log::info!(
                "{} correspondences, at least {} are needed for a homography",
                correspondences.len(),
                needed
            );
            return Ok(None);
        }

        let h = match calib3d::find_homography(
            &correspondences.query,
            &correspondences.reference,
            &mut Mat::default(),
            self.method,
            self.ransac_reproj_threshold,
        ) {
            Ok(matrix) => matrix,
            Err(e) => {
                log::info!("find_homography() failed: {e}");
                return Ok(None);
            }
        };

        if h.empty() || h.rows() != 3 || h.cols() != 3 {
            log::info!("find_homography() found no transform");
            return Ok(None);
        }

        if core::determinant(&h)?.abs() < 1e-6 {
            log::info!("homography is degenerate");
            return Ok(None);
        }
        Ok(Some(h))
    }
}

/// Warps images onto the frame of the first image.
pub struct Aligner<D, M, H> {
    detector: D,
    matcher: M,
    estimator: H,
    params: AlignmentParameters,
}

impl Aligner<OrbDetector, HammingMatcher, RansacEstimator> {
    /// The OpenCV backed aligner: ORB, brute force Hamming matching and RANSAC.
    pub fn from_parameters(params: AlignmentParameters) -> Result<Self, FusionError> {
        Ok(Self::new(
            OrbDetector::new(params.max_features)?,
            HammingMatcher {
                cross_check: params.cross_check,
                keep_ratio: params.match_keep_ratio,
            },
            RansacEstimator {
                method: params.method,
                ransac_reproj_threshold: params.ransac_reproj_threshold,
                min_correspondences: params.min_correspondences,
            },
            params,
        ))
    }
}

impl<D, M, H> Aligner<D, M, H>
where
    D: FeatureDetector,
    M: Matcher,
    H: HomographyEstimator,
{
    pub fn new(detector: D, matcher: M, estimator: H, params: AlignmentParameters) -> Self {
        Self {
            detector,
            matcher,
            estimator,
            params,
        }
    }

    fn check_scale(&self, full_size: Size) -> Result<(), FusionError> {
        if let Some(scale_down) = self.params.scale_down {
            let smaller = full_size.width.min(full_size.height);
            if scale_down >= smaller as f32 {
                return Err(FusionError::InvalidParams(format!(
                    "scale_down was larger (or equal) to the smaller image dimension: {}, scale_down:{}",
                    smaller, scale_down
                )));
            }
            if scale_down <= 10.0 {
                return Err(FusionError::InvalidParams(format!(
                    "scale_down was too small scale_down:{}",
                    scale_down
                )));
            }
        }
        Ok(())
    }

    /// Features of a `CV_32FC3` image and the size of the image they were detected on.
    fn features(&mut self, img_f32: &Mat) -> Result<(Features, Size), FusionError> {
        let grey = utils::grey_u8(img_f32)?;
        let grey = match self.params.scale_down {
            Some(scale_down) => utils::scale_image(&grey, scale_down)?,
            None => grey,
        };
        let features = self.detector.detect(&grey)?;
        Ok((features, grey.size()?))
    }

    /// The homography taking `img_f32` onto the reference frame, `None` if there is
    /// no usable one.
    pub fn homography(
        &mut self,
        reference: &Features,
        img_f32: &Mat,
    ) -> Result<Option<Mat>, FusionError> {
        let full_size = img_f32.size()?;
        let (features, feature_size) = self.features(img_f32)?;
        let correspondences = self.matcher.match_features(&features, reference)?;
        log::debug!(
            "{} features, {} correspondences with the reference",
            features.len(),
            correspondences.len()
        );
        match self.estimator.estimate(&correspondences)? {
            Some(h) if feature_size != full_size => Ok(Some(utils::adjust_homography_for_scale(
                &h,
                feature_size,
                full_size,
            )?)),
            h => Ok(h),
        }
    }

    /// Aligns every image to `images[0]`.
    ///
    /// Returns the number of images that could not be aligned (and were passed
    /// through unwarped) together with the aligned images. The reference image is
    /// copied as is. The output always has the length of the input.
    pub fn align(&mut self, images: &[Mat]) -> Result<(usize, Vec<Mat>), FusionError> {
        let Some(reference) = images.first() else {
            return Ok((0, Vec::new()));
        };
        if images.len() == 1 {
            return Ok((0, images.to_vec()));
        }
        let full_size = reference.size()?;
        self.check_scale(full_size)?;

        let (reference_features, _) = self.features(reference)?;
        log::debug!("reference image: {} features", reference_features.len());

        let mut unaligned = 0_usize;
        let mut aligned = Vec::with_capacity(images.len());
        aligned.push(reference.clone());

        for (index, img) in images.iter().enumerate().skip(1) {
            match self.homography(&reference_features, img)? {
                Some(h) => {
                    let mut warped = Mat::default();
                    imgproc::warp_perspective(
                        img,
                        &mut warped,
                        &h,
                        full_size,
                        imgproc::INTER_LINEAR,
                        self.params.border_mode,
                        self.params.border_value,
                    )?;
                    aligned.push(warped);
                }
                None => {
                    log::info!("image #{index} could not be aligned, using it as is");
                    unaligned += 1;
                    aligned.push(img.clone());
                }
            }
        }
        Ok((unaligned, aligned))
    }
}

/// Aligns `CV_32FC3` images to the first one using ORB features and a RANSAC homography.
///
/// Returns the number of images left unaligned and the aligned images.
///
/// ```rust,no_run
/// # use libfuser::{prelude::*, utils, opencv::prelude::*};
/// # fn f() -> Result<(),FusionError> {
/// let images = utils::read_images(["1.jpg", "2.jpg", "3.jpg"])?
///     .iter()
///     .map(utils::to_f32)
///     .collect::<Result<Vec<_>, _>>()?;
/// let (unaligned, aligned) = align_images(&images, AlignmentParameters::default())?;
/// assert_eq!(aligned.len(), 3);
/// # Ok(())}
/// ```
pub fn align_images(
    images: &[Mat],
    params: AlignmentParameters,
) -> Result<(usize, Vec<Mat>), FusionError> {
    Aligner::from_parameters(params)?.align(images)
}
