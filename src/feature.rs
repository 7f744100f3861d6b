use std::time::Duration;

use opencv::core::Point2f;

/// 单个特征点
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// 图像坐标
    pub pixel: Point2f,
    /// 响应强度
    pub response: f32,
    /// 金字塔层
    pub octave: i32,
    /// 描述子，检测器不计算描述子时为空
    pub descriptor: Vec<u8>,
}

impl Feature {
    pub fn new(pixel: Point2f, response: f32) -> Self {
        Self {
            pixel,
            response,
            octave: 0,
            descriptor: Vec::new(),
        }
    }
}

/// 一帧图像提取出的特征点缓存
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub features: Vec<Feature>,
    /// 提取耗时
    pub extraction_time: Duration,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn keypoints(&self) -> Vec<Point2f> {
        self.features.iter().map(|f| f.pixel).collect()
    }

    pub fn memory_usage(&self) -> usize {
        self.features
            .iter()
            .map(|f| std::mem::size_of::<Feature>() + f.descriptor.len())
            .sum()
    }
}

/// 按响应强度降序排列并截断
pub(crate) fn retain_strongest(features: &mut Vec<Feature>, max_count: usize) {
    features.sort_by(|a, b| b.response.total_cmp(&a.response));
    features.truncate(max_count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_strongest_sorts_and_truncates() {
        let mut features = vec![
            Feature::new(Point2f::new(0.0, 0.0), 0.2),
            Feature::new(Point2f::new(1.0, 0.0), 0.9),
            Feature::new(Point2f::new(2.0, 0.0), 0.5),
        ];
        retain_strongest(&mut features, 2);
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].pixel.x, 1.0);
        assert_eq!(features[1].pixel.x, 2.0);
    }

    #[test]
    fn memory_usage_counts_descriptors() {
        let mut feature = Feature::new(Point2f::new(0.0, 0.0), 1.0);
        feature.descriptor = vec![0; 32];
        let set = FeatureSet {
            features: vec![feature],
            extraction_time: Duration::ZERO,
        };
        assert_eq!(set.memory_usage(), std::mem::size_of::<Feature>() + 32);
        assert_eq!(set.keypoints(), vec![Point2f::new(0.0, 0.0)]);
    }
}
