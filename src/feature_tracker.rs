//! 特征追踪
//!
//! 光流跟踪上一帧的点集，经过边界、误差和基础矩阵 RANSAC 筛选后，
//! 根据跟踪质量决定重新检测或补充新的特征点。每个点带有一个在跟踪器
//! 生命周期内唯一的 id。

use std::sync::Arc;

use anyhow::{ensure, Result};
use opencv::{
    core::{Mat, Point2f, Point2i, Scalar, CV_8UC1},
    imgproc::LINE_8,
};

use crate::config::{Config, TrackerConfig};
use crate::frame::{Frame, FrameId};
use crate::primitives::{
    FeatureDetector, FundamentalEstimator, OpticalFlow, OrbDetector, PyrLkFlow, RansacFundamental,
};

pub type TrackId = u64;

/// 单次跟踪的结果
///
/// `curr_points`、`track_ids`、`inliers`、`track_lengths`、`velocities` 逐一对应。
/// `prev_points` 只包含从上一帧跟踪过来的点，对应 `curr_points` 的前缀，
/// 重新检测时为空。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingResult {
    pub frame_id: FrameId,
    pub prev_points: Vec<Point2f>,
    pub curr_points: Vec<Point2f>,
    pub track_ids: Vec<TrackId>,
    pub inliers: Vec<bool>,
    /// 每个点被连续观测到的帧数
    pub track_lengths: Vec<u32>,
    /// 像素 / 秒
    pub velocities: Vec<Point2f>,
    pub num_tracked: usize,
    pub num_inliers: usize,
    /// 上一帧点集中成功跟踪的比例，初始化和重新检测时为 1.0
    pub tracking_quality: f32,
    /// 本次是否（重新）初始化了点集
    pub redetected: bool,
}

/// 一次跟踪过程中存活的对应点，各序列逐一对应
#[derive(Debug, Default)]
struct Correspondences {
    prev_pts: Vec<Point2f>,
    cur_pts: Vec<Point2f>,
    ids: Vec<TrackId>,
    track_cnt: Vec<u32>,
}

impl Correspondences {
    fn len(&self) -> usize {
        self.cur_pts.len()
    }

    /// 删除状态为 false 的点。
    fn reduce(self, status: &[bool]) -> Self {
        Self {
            prev_pts: reduce_vector(&self.prev_pts, status),
            cur_pts: reduce_vector(&self.cur_pts, status),
            ids: reduce_vector(&self.ids, status),
            track_cnt: reduce_vector(&self.track_cnt, status),
        }
    }
}

#[inline]
fn reduce_vector<T: Copy>(v: &[T], status: &[bool]) -> Vec<T> {
    status
        .iter()
        .zip(v.iter())
        .filter(|(state, _)| **state)
        .map(|(_, p)| *p)
        .collect()
}

/// 计算两个点之间的欧几里得距离。
#[inline]
fn distance(a: &Point2f, b: &Point2f) -> f32 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    (dx * dx + dy * dy).sqrt()
}

/// 判断点是否在图像内，`0 <= x < width` 且 `0 <= y < height`。
#[inline]
fn in_border(frame: &Frame, pt: &Point2f) -> bool {
    pt.x >= 0.0 && pt.x < frame.width() as f32 && pt.y >= 0.0 && pt.y < frame.height() as f32
}

pub struct FeatureTracker<D = OrbDetector, F = PyrLkFlow, E = RansacFundamental>
where
    D: FeatureDetector,
    F: OpticalFlow,
    E: FundamentalEstimator,
{
    config: TrackerConfig,
    detector: D,
    flow: F,
    estimator: E,

    prev_frame: Option<Arc<Frame>>,
    prev_pts: Vec<Point2f>,
    ids: Vec<TrackId>,
    /// track count: 记录每一个特征点被跟踪的次数。
    track_cnt: Vec<u32>,
    /// 下一个可用的 id
    n_id: TrackId,
}

impl FeatureTracker {
    pub fn new() -> Self {
        Self::with_primitives(
            TrackerConfig::default(),
            OrbDetector::default(),
            PyrLkFlow::default(),
            RansacFundamental,
        )
    }

    pub fn with_config(config: Config) -> Result<Self> {
        config.tracker.validate()?;
        Ok(Self::with_primitives(
            config.tracker,
            OrbDetector::new(config.orb),
            PyrLkFlow::new(config.flow),
            RansacFundamental,
        ))
    }
}

impl Default for FeatureTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, F, E> FeatureTracker<D, F, E>
where
    D: FeatureDetector,
    F: OpticalFlow,
    E: FundamentalEstimator,
{
    pub fn with_primitives(config: TrackerConfig, detector: D, flow: F, estimator: E) -> Self {
        Self {
            config,
            detector,
            flow,
            estimator,
            prev_frame: None,
            prev_pts: Vec::new(),
            ids: Vec::new(),
            track_cnt: Vec::new(),
            n_id: 0,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn previous_frame(&self) -> Option<&Arc<Frame>> {
        self.prev_frame.as_ref()
    }

    /// 当前点集的大小
    pub fn num_active(&self) -> usize {
        self.prev_pts.len()
    }

    pub fn active_points(&self) -> &[Point2f] {
        &self.prev_pts
    }

    pub fn active_ids(&self) -> &[TrackId] {
        &self.ids
    }

    pub fn next_track_id(&self) -> TrackId {
        self.n_id
    }

    pub fn reset(&mut self) {
        self.prev_frame = None;
        self.prev_pts.clear();
        self.ids.clear();
        self.track_cnt.clear();
        self.n_id = 0;
        log::info!("tracker reset");
    }

    #[inline]
    fn mint_id(&mut self) -> TrackId {
        let id = self.n_id;
        self.n_id += 1;
        id
    }

    /// 跟踪一帧图像
    ///
    /// 出错时跟踪器状态保持不变。
    pub fn track(&mut self, frame: Arc<Frame>) -> Result<TrackingResult> {
        let prev_frame = match self.prev_frame.clone() {
            Some(prev_frame) if !self.prev_pts.is_empty() => prev_frame,
            Some(_) => {
                log::warn!("no previous points to track, re-initializing");
                self.prev_frame = None;
                return self.initialize(frame);
            }
            None => return self.initialize(frame),
        };
        let n_prev = self.prev_pts.len();

        // [x] optical flow
        let flow = self
            .flow
            .track(prev_frame.image(), frame.image(), &self.prev_pts)?;
        ensure!(
            flow.is_aligned(n_prev),
            "optical flow returned {} positions / {} status / {} errors for {} points",
            flow.positions.len(),
            flow.status.len(),
            flow.errors.len(),
            n_prev
        );

        // [x] status, error, in_border
        let status = flow
            .status
            .iter()
            .zip(flow.errors.iter())
            .zip(flow.positions.iter())
            .map(|((ok, err), pt)| *ok && *err <= self.config.max_flow_error && in_border(&frame, pt))
            .collect::<Vec<_>>();

        // [x] reverse check
        let status = if self.config.flow_back {
            self.reverse_check(&prev_frame, &frame, &flow.positions, status)?
        } else {
            status
        };

        // [x] reduceVector
        let tracked = Correspondences {
            prev_pts: self.prev_pts.clone(),
            cur_pts: flow.positions,
            ids: self.ids.clone(),
            track_cnt: self.track_cnt.clone(),
        }
        .reduce(&status);
        let n_flow = tracked.len();

        // [x] fundamental matrix RANSAC
        let tracked = self.reject_with_fundamental(tracked)?;

        let tracking_quality = if n_prev == 0 {
            0.0
        } else {
            tracked.len() as f32 / n_prev as f32
        };
        log::debug!(
            "frame {}: tracked {}/{} features, {} after RANSAC (quality: {:.3})",
            frame.id(),
            n_flow,
            n_prev,
            tracked.len(),
            tracking_quality
        );

        if tracking_quality < self.config.min_quality || tracked.len() < self.config.min_features {
            log::info!(
                "tracking quality too low ({:.3}, {} points), re-detecting features",
                tracking_quality,
                tracked.len()
            );
            return self.initialize(frame);
        }

        // 检查是否需要添加新的特征点
        let n_max_cnt = self.config.target_features.saturating_sub(tracked.len());
        let n_pts = if n_max_cnt > 0 {
            self.detect_new_features(&frame, &tracked.cur_pts, n_max_cnt)?
        } else {
            Vec::new()
        };

        // [x] ptsVelocity
        let dt = frame
            .timestamp()
            .saturating_duration_since(prev_frame.timestamp())
            .as_secs_f64();
        let mut velocities = tracked
            .prev_pts
            .iter()
            .zip(tracked.cur_pts.iter())
            .map(|(prev, cur)| {
                if dt > 0.0 {
                    Point2f::new(
                        ((cur.x - prev.x) as f64 / dt) as f32,
                        ((cur.y - prev.y) as f64 / dt) as f32,
                    )
                } else {
                    Point2f::new(0.0, 0.0)
                }
            })
            .collect::<Vec<_>>();

        let Correspondences {
            prev_pts,
            mut cur_pts,
            mut ids,
            track_cnt,
        } = tracked;
        let mut track_cnt = track_cnt.iter().map(|x| x + 1).collect::<Vec<_>>();
        if !n_pts.is_empty() {
            log::debug!(
                "frame {}: added {} new features (total: {})",
                frame.id(),
                n_pts.len(),
                cur_pts.len() + n_pts.len()
            );
        }
        for p in n_pts {
            cur_pts.push(p);
            ids.push(self.mint_id());
            track_cnt.push(1);
            velocities.push(Point2f::new(0.0, 0.0));
        }

        // clone to next
        let n = cur_pts.len();
        self.prev_frame = Some(Arc::clone(&frame));
        self.prev_pts = cur_pts.clone();
        self.ids = ids.clone();
        self.track_cnt = track_cnt.clone();

        Ok(TrackingResult {
            frame_id: frame.id(),
            prev_points: prev_pts,
            curr_points: cur_pts,
            track_ids: ids,
            inliers: vec![true; n],
            track_lengths: track_cnt,
            velocities,
            num_tracked: n,
            num_inliers: n,
            tracking_quality,
            redetected: false,
        })
    }

    /// 在 `frame` 上重新提取特征点，所有点获得新的 id
    fn initialize(&mut self, frame: Arc<Frame>) -> Result<TrackingResult> {
        frame.extract_features_with(&self.detector, self.config.max_features)?;
        let cur_pts = frame.keypoints();
        let ids = cur_pts.iter().map(|_| self.mint_id()).collect::<Vec<_>>();
        let n = cur_pts.len();
        log::info!("frame {}: initialized tracker with {} features", frame.id(), n);

        self.prev_frame = Some(Arc::clone(&frame));
        self.prev_pts = cur_pts.clone();
        self.ids = ids.clone();
        self.track_cnt = vec![1; n];

        Ok(TrackingResult {
            frame_id: frame.id(),
            prev_points: Vec::new(),
            curr_points: cur_pts,
            track_ids: ids,
            inliers: vec![true; n],
            track_lengths: vec![1; n],
            velocities: vec![Point2f::new(0.0, 0.0); n],
            num_tracked: n,
            num_inliers: n,
            tracking_quality: 1.0,
            redetected: true,
        })
    }

    /// 反向光流，往返误差超过阈值的点置为 false
    fn reverse_check(
        &self,
        prev_frame: &Frame,
        frame: &Frame,
        cur_pts: &[Point2f],
        status: Vec<bool>,
    ) -> Result<Vec<bool>> {
        let reverse = self.flow.track(frame.image(), prev_frame.image(), cur_pts)?;
        ensure!(
            reverse.is_aligned(cur_pts.len()),
            "reverse optical flow is not aligned with its {} input points",
            cur_pts.len()
        );
        Ok(status
            .iter()
            .zip(reverse.status.iter())
            .zip(reverse.positions.iter().zip(self.prev_pts.iter()))
            .map(|((s, rs), (back, orig))| {
                *s && *rs && distance(orig, back) <= self.config.flow_back_threshold
            })
            .collect())
    }

    /// 用基础矩阵剔除外点；丢弃过多时保留原点集
    fn reject_with_fundamental(&self, tracked: Correspondences) -> Result<Correspondences> {
        let n = tracked.len();
        if n < self.config.min_ransac_points {
            return Ok(tracked);
        }
        let estimate = match self.estimator.estimate(
            &tracked.prev_pts,
            &tracked.cur_pts,
            self.config.ransac_threshold,
            self.config.ransac_confidence,
        ) {
            Ok(estimate) => estimate,
            Err(e) => {
                log::warn!("fundamental matrix estimation failed, keeping {} points: {:#}", n, e);
                return Ok(tracked);
            }
        };
        ensure!(
            estimate.inliers.len() == n,
            "inlier mask has {} entries for {} points",
            estimate.inliers.len(),
            n
        );

        let discarded = n - estimate.inlier_count();
        if discarded as f32 > self.config.max_ransac_discard * n as f32 {
            log::warn!(
                "RANSAC would discard {}/{} points, keeping all of them",
                discarded,
                n
            );
            return Ok(tracked);
        }
        Ok(tracked.reduce(&estimate.inliers))
    }

    /// 在距离已有点 `min_distance` 以外的区域检测至多 `n_max_cnt` 个新点
    fn detect_new_features(
        &self,
        frame: &Frame,
        cur_pts: &[Point2f],
        n_max_cnt: usize,
    ) -> Result<Vec<Point2f>> {
        let mut mask = Mat::new_rows_cols_with_default(
            frame.height(),
            frame.width(),
            CV_8UC1,
            Scalar::all(255.0),
        )?;
        for pt in cur_pts {
            opencv::imgproc::circle(
                &mut mask,
                Point2i::new(pt.x as i32, pt.y as i32),
                self.config.min_distance,
                Scalar::all(0.0),
                -1,
                LINE_8,
                0,
            )?;
        }
        let features = self.detector.detect(frame.image(), n_max_cnt, Some(&mask))?;
        Ok(features
            .into_iter()
            .take(n_max_cnt)
            .map(|f| f.pixel)
            .collect())
    }
}
