//! 特征跟踪所依赖的数值算子
//!
//! 跟踪器只通过这里的 trait 使用特征检测、光流和基础矩阵估计，
//! 测试时可以替换为确定性的实现。

mod opencv_backend;

pub use opencv_backend::{OrbDetector, PyrLkFlow, RansacFundamental};

use anyhow::Result;
use nalgebra::Matrix3;
use opencv::core::{Mat, Point2f};

use crate::feature::Feature;

/// 特征检测
pub trait FeatureDetector {
    /// 返回至多 `max_count` 个特征点，按响应强度降序排列。
    ///
    /// `mask` 为 `CV_8UC1`，值为 0 的区域内不返回任何特征点。
    fn detect(&self, image: &Mat, max_count: usize, mask: Option<&Mat>) -> Result<Vec<Feature>>;
}

/// 稀疏光流的输出，与输入点逐一对应
#[derive(Debug, Clone, Default)]
pub struct FlowResult {
    pub positions: Vec<Point2f>,
    pub status: Vec<bool>,
    pub errors: Vec<f32>,
}

impl FlowResult {
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// 三个序列长度是否都等于 `n`
    pub fn is_aligned(&self, n: usize) -> bool {
        self.positions.len() == n && self.status.len() == n && self.errors.len() == n
    }
}

/// 稀疏光流
pub trait OpticalFlow {
    fn track(&self, prev_image: &Mat, cur_image: &Mat, prev_pts: &[Point2f]) -> Result<FlowResult>;
}

#[derive(Debug, Clone, Default)]
pub struct FundamentalEstimate {
    /// 估计失败时为 `None`
    pub matrix: Option<Matrix3<f64>>,
    /// 与输入点逐一对应
    pub inliers: Vec<bool>,
}

impl FundamentalEstimate {
    pub fn inlier_count(&self) -> usize {
        self.inliers.iter().filter(|inlier| **inlier).count()
    }
}

/// 鲁棒的基础矩阵估计，至少需要 8 对点
pub trait FundamentalEstimator {
    fn estimate(
        &self,
        points_a: &[Point2f],
        points_b: &[Point2f],
        threshold: f64,
        confidence: f64,
    ) -> Result<FundamentalEstimate>;
}
