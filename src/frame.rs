//! 图像帧
//!
//! 每一帧持有灰度图像和按需提取的特征点缓存。帧在构造后只读，
//! 跟踪器和调用方可以通过 [Arc](std::sync::Arc) 共同持有同一帧。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use anyhow::{bail, ensure, Result};
use ndarray::ArrayView2;
use opencv::core::{Mat, Point2f, CV_16S, CV_16U, CV_32F, CV_64F, CV_8S, CV_8U};
use opencv::imgproc::{COLOR_BGR2GRAY, COLOR_BGRA2GRAY};
use opencv::prelude::*;

use crate::cast::gray_array_to_mat;
use crate::feature::{Feature, FeatureSet};
use crate::primitives::{FeatureDetector, OrbDetector};

pub type FrameId = u64;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct Frame {
    id: FrameId,
    timestamp: Instant,
    /// 8 位灰度图像
    image: Mat,
    /// 彩色输入时保留原图
    color: Option<Mat>,
    features: RwLock<FeatureSet>,
}

/// 把其他位深的灰度值线性映射到 `[0, 255]`，返回 `convert_to` 的 (alpha, beta)
///
/// 浮点图像假定取值范围为 `[0, 1]`。
fn depth_scale(depth: i32) -> Result<(f64, f64)> {
    Ok(match depth {
        CV_8S => (1.0, 128.0),
        CV_16U => (255.0 / 65535.0, 0.0),
        CV_16S => (255.0 / 65535.0, 32768.0 * 255.0 / 65535.0),
        CV_32F | CV_64F => (255.0, 0.0),
        d => bail!("unsupported image depth {}", d),
    })
}

impl Frame {
    pub fn new(image: &Mat) -> Result<Self> {
        Self::with_timestamp(image, Instant::now())
    }

    /// 接受 1、3 (BGR) 或 4 (BGRA) 通道图像
    pub fn with_timestamp(image: &Mat, timestamp: Instant) -> Result<Self> {
        ensure!(
            !image.empty() && image.rows() > 0 && image.cols() > 0,
            "cannot build a frame from an empty image"
        );

        let (gray, color) = match image.channels() {
            1 => (image.try_clone()?, None),
            3 => {
                let mut gray = Mat::default();
                opencv::imgproc::cvt_color(image, &mut gray, COLOR_BGR2GRAY, 0)?;
                (gray, Some(image.try_clone()?))
            }
            4 => {
                let mut gray = Mat::default();
                opencv::imgproc::cvt_color(image, &mut gray, COLOR_BGRA2GRAY, 0)?;
                (gray, Some(image.try_clone()?))
            }
            n => bail!("unsupported channel count {}", n),
        };
        let gray = if gray.depth() == CV_8U {
            gray
        } else {
            let (alpha, beta) = depth_scale(gray.depth())?;
            let mut converted = Mat::default();
            gray.convert_to(&mut converted, CV_8U, alpha, beta)?;
            converted
        };

        Ok(Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            timestamp,
            image: gray,
            color,
            features: RwLock::new(FeatureSet::default()),
        })
    }

    pub fn from_gray_array(array: ArrayView2<u8>) -> Result<Self> {
        let image = gray_array_to_mat(array)?;
        Self::new(&image)
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// 灰度图像
    pub fn image(&self) -> &Mat {
        &self.image
    }

    pub fn color(&self) -> Option<&Mat> {
        self.color.as_ref()
    }

    pub fn width(&self) -> i32 {
        self.image.cols()
    }

    pub fn height(&self) -> i32 {
        self.image.rows()
    }

    /// 使用默认 ORB 提取特征点，替换已有缓存
    pub fn extract_features(&self, max_count: usize) -> Result<usize> {
        self.extract_features_with(&OrbDetector::default(), max_count)
    }

    pub fn extract_features_with<D>(&self, detector: &D, max_count: usize) -> Result<usize>
    where
        D: FeatureDetector + ?Sized,
    {
        let start = Instant::now();
        let features = detector.detect(&self.image, max_count, None)?;
        let extraction_time = start.elapsed();
        log::debug!(
            "frame {}: extracted {} features in {:.2} ms",
            self.id,
            features.len(),
            extraction_time.as_secs_f64() * 1e3
        );

        let count = features.len();
        *self.features.write().unwrap_or_else(PoisonError::into_inner) = FeatureSet {
            features,
            extraction_time,
        };
        Ok(count)
    }

    pub fn features(&self) -> Vec<Feature> {
        self.feature_set().features
    }

    pub fn feature_set(&self) -> FeatureSet {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn feature_count(&self) -> usize {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn keypoints(&self) -> Vec<Point2f> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keypoints()
    }

    /// 图像和特征点占用的字节数
    pub fn memory_usage(&self) -> usize {
        let plane = |m: &Mat| m.total() * m.elem_size().unwrap_or(0);
        std::mem::size_of::<Self>()
            + plane(&self.image)
            + self.color.as_ref().map(plane).unwrap_or(0)
            + self
                .features
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .memory_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_FEATURES;
    use ndarray::Array2;
    use opencv::core::{Scalar, CV_16SC1, CV_16UC1, CV_32FC1, CV_32SC1, CV_8UC1, CV_8UC3};

    fn squares() -> Array2<u8> {
        Array2::from_shape_fn((240, 320), |(y, x)| {
            if x % 80 >= 30 && x % 80 < 60 && y % 80 >= 30 && y % 80 < 60 {
                230
            } else {
                20
            }
        })
    }

    #[test]
    fn ids_are_monotonic() {
        let image = Mat::new_rows_cols_with_default(10, 10, CV_8UC1, Scalar::all(0.0)).unwrap();
        let a = Frame::new(&image).unwrap();
        let b = Frame::new(&image).unwrap();
        let c = Frame::new(&image).unwrap();
        assert!(a.id() < b.id());
        assert!(b.id() < c.id());
    }

    #[test]
    fn color_image_is_converted_to_gray() {
        let image =
            Mat::new_rows_cols_with_default(20, 30, CV_8UC3, Scalar::new(10.0, 20.0, 30.0, 0.0))
                .unwrap();
        let frame = Frame::new(&image).unwrap();
        assert_eq!(frame.image().channels(), 1);
        assert_eq!(frame.image().typ(), CV_8UC1);
        assert_eq!(frame.width(), 30);
        assert_eq!(frame.height(), 20);
        assert!(frame.color().is_some());
    }

    #[test]
    fn gray_image_is_kept() {
        let image = Mat::new_rows_cols_with_default(20, 30, CV_8UC1, Scalar::all(7.0)).unwrap();
        let frame = Frame::new(&image).unwrap();
        assert!(frame.color().is_none());
        assert_eq!(*frame.image().at_2d::<u8>(5, 5).unwrap(), 7);
    }

    #[test]
    fn deep_image_is_rescaled_to_8bit() {
        // 40000 * 255 / 65535 = 155.6
        let image = Mat::new_rows_cols_with_default(8, 8, CV_16UC1, Scalar::all(40000.0)).unwrap();
        let frame = Frame::new(&image).unwrap();
        assert_eq!(frame.image().typ(), CV_8UC1);
        assert_eq!(*frame.image().at_2d::<u8>(3, 3).unwrap(), 156);

        let image = Mat::new_rows_cols_with_default(8, 8, CV_16SC1, Scalar::all(-32768.0)).unwrap();
        let frame = Frame::new(&image).unwrap();
        assert_eq!(*frame.image().at_2d::<u8>(3, 3).unwrap(), 0);

        let image = Mat::new_rows_cols_with_default(8, 8, CV_32FC1, Scalar::all(0.4)).unwrap();
        let frame = Frame::new(&image).unwrap();
        assert_eq!(frame.image().typ(), CV_8UC1);
        assert_eq!(*frame.image().at_2d::<u8>(3, 3).unwrap(), 102);
    }

    #[test]
    fn unsupported_depth_is_rejected() {
        let image = Mat::new_rows_cols_with_default(8, 8, CV_32SC1, Scalar::all(7.0)).unwrap();
        assert!(Frame::new(&image).is_err());
    }

    #[test]
    fn empty_image_is_rejected() {
        assert!(Frame::new(&Mat::default()).is_err());
        assert!(Frame::from_gray_array(Array2::<u8>::zeros((0, 0)).view()).is_err());
    }

    #[test]
    fn extraction_populates_and_replaces_cache() {
        let frame = Frame::from_gray_array(squares().view()).unwrap();
        assert_eq!(frame.feature_count(), 0);

        let n = frame.extract_features(MAX_FEATURES).unwrap();
        assert!(n > 0);
        assert_eq!(frame.feature_count(), n);
        assert_eq!(frame.keypoints().len(), n);
        assert_eq!(frame.features()[0].descriptor.len(), 32);

        let m = frame.extract_features(5).unwrap();
        assert!(m <= 5);
        assert_eq!(frame.feature_count(), m);
        assert!(frame.memory_usage() >= 240 * 320);
    }

    #[test]
    fn blank_image_yields_no_features() {
        let frame = Frame::from_gray_array(Array2::<u8>::from_elem((240, 320), 128).view()).unwrap();
        assert_eq!(frame.extract_features(MAX_FEATURES).unwrap(), 0);
        assert!(frame.features().is_empty());
    }
}
