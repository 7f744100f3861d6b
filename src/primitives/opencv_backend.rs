use anyhow::{ensure, Result};
use opencv::{
    calib3d::FM_RANSAC,
    core::{KeyPoint, Mat, Point2f, Size, TermCriteria, Vector},
    features2d::{ORB_ScoreType, ORB},
    prelude::*,
};

use super::{FeatureDetector, FlowResult, FundamentalEstimate, FundamentalEstimator, OpticalFlow};
use crate::cast::{mat_to_matrix3, points_to_vector, vector_to_points};
use crate::config::{FlowConfig, OrbConfig};
use crate::feature::{retain_strongest, Feature};

/// ORB 特征检测，使用 Harris 响应排序
#[derive(Debug, Clone, Default)]
pub struct OrbDetector {
    pub config: OrbConfig,
}

impl OrbDetector {
    pub fn new(config: OrbConfig) -> Self {
        Self { config }
    }
}

impl FeatureDetector for OrbDetector {
    fn detect(&self, image: &Mat, max_count: usize, mask: Option<&Mat>) -> Result<Vec<Feature>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        // nfeatures 随预算变化，每次调用重新创建
        let mut orb = ORB::create(
            max_count.min(i32::MAX as usize) as i32,
            self.config.scale_factor,
            self.config.n_levels,
            self.config.edge_threshold,
            self.config.first_level,
            self.config.wta_k,
            ORB_ScoreType::HARRIS_SCORE,
            self.config.patch_size,
            self.config.fast_threshold,
        )?;

        let no_mask = Mat::default();
        let mut keypoints = Vector::<KeyPoint>::new();
        let mut descriptors = Mat::default();
        orb.detect_and_compute(
            image,
            mask.unwrap_or(&no_mask),
            &mut keypoints,
            &mut descriptors,
            false,
        )?;

        let width = descriptors.cols().max(0) as usize;
        let bytes: &[u8] = if descriptors.empty() {
            &[]
        } else {
            descriptors.data_bytes()?
        };
        let mut features = keypoints
            .iter()
            .enumerate()
            .map(|(i, kp)| Feature {
                pixel: kp.pt(),
                response: kp.response(),
                octave: kp.octave(),
                descriptor: bytes
                    .get(i * width..(i + 1) * width)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        retain_strongest(&mut features, max_count);
        Ok(features)
    }
}

/// 金字塔 LK 光流
#[derive(Debug, Clone, Default)]
pub struct PyrLkFlow {
    pub config: FlowConfig,
}

impl PyrLkFlow {
    pub fn new(config: FlowConfig) -> Self {
        Self { config }
    }
}

impl OpticalFlow for PyrLkFlow {
    fn track(&self, prev_image: &Mat, cur_image: &Mat, prev_pts: &[Point2f]) -> Result<FlowResult> {
        if prev_pts.is_empty() {
            return Ok(FlowResult::default());
        }
        let prev = points_to_vector(prev_pts);
        let mut cur = Vector::<Point2f>::new();
        let mut status = Vector::<u8>::new();
        let mut err = Vector::<f32>::new();
        let criteria = TermCriteria::new(
            opencv::core::TermCriteria_EPS + opencv::core::TermCriteria_COUNT,
            self.config.max_iterations,
            self.config.epsilon,
        )?;
        opencv::video::calc_optical_flow_pyr_lk(
            prev_image,
            cur_image,
            &prev,
            &mut cur,
            &mut status,
            &mut err,
            Size::new(self.config.win_size, self.config.win_size),
            self.config.max_level,
            criteria,
            0,
            self.config.min_eig_threshold,
        )?;

        Ok(FlowResult {
            positions: vector_to_points(&cur),
            status: status.iter().map(|s| s != 0).collect(),
            errors: err.iter().collect(),
        })
    }
}

/// `FM_RANSAC` 基础矩阵估计
#[derive(Debug, Clone, Copy, Default)]
pub struct RansacFundamental;

impl FundamentalEstimator for RansacFundamental {
    fn estimate(
        &self,
        points_a: &[Point2f],
        points_b: &[Point2f],
        threshold: f64,
        confidence: f64,
    ) -> Result<FundamentalEstimate> {
        ensure!(
            points_a.len() == points_b.len(),
            "point sets differ in length: {} vs {}",
            points_a.len(),
            points_b.len()
        );
        ensure!(
            points_a.len() >= 8,
            "fundamental matrix needs at least 8 point pairs, got {}",
            points_a.len()
        );

        let ll = points_to_vector(points_a);
        let rr = points_to_vector(points_b);
        let mut mask = Vector::<u8>::default();
        let fund_mat = opencv::calib3d::find_fundamental_mat_1(
            &ll,
            &rr,
            FM_RANSAC,
            threshold,
            confidence,
            &mut mask,
        )?;

        // 估计失败时 mask 为空，视为全部外点
        let inliers = (0..points_a.len())
            .map(|i| mask.get(i).map(|m| m != 0).unwrap_or(false))
            .collect();
        Ok(FundamentalEstimate {
            matrix: mat_to_matrix3(&fund_mat)?,
            inliers,
        })
    }
}
