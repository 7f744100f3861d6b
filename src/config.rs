//! 跟踪参数
//!
//! 常量是默认值，[Config] 可以从 JSON 中覆盖其中一部分。

use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// 初始化 / 重新检测时提取的最大特征点数量
pub const MAX_FEATURES: usize = 1000;
/// 补充特征点的目标数量
pub const TARGET_FEATURES: usize = 500;
/// 少于该数量则重新检测
pub const MIN_FEATURES: usize = 100;
/// 跟踪质量低于该值则重新检测
pub const MIN_QUALITY: f32 = 0.5;
/// 光流误差上限
pub const MAX_FLOW_ERROR: f32 = 30.0;
/// 补充特征点时与已有点的最小距离（像素）
pub const MIN_DIST: i32 = 20;
/// RANSAC 外点阈值（像素）
pub const RANSAC_THRESHOLD: f64 = 3.0;
pub const RANSAC_CONFIDENCE: f64 = 0.99;
/// 基础矩阵估计所需的最少点数
pub const MIN_RANSAC_POINTS: usize = 8;
/// RANSAC 最多允许丢弃的比例，超过则放弃该结果
pub const MAX_RANSAC_DISCARD: f32 = 0.5;
/// 反向光流，然后匹配正向光流，进行特征点筛选。
pub const FLOW_BACK: bool = false;
pub const FLOW_BACK_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub max_features: usize,
    pub target_features: usize,
    pub min_features: usize,
    pub min_quality: f32,
    pub max_flow_error: f32,
    /// 补充特征点时已有点周围的排除半径
    pub min_distance: i32,
    pub ransac_threshold: f64,
    pub ransac_confidence: f64,
    pub min_ransac_points: usize,
    pub max_ransac_discard: f32,
    pub flow_back: bool,
    pub flow_back_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_features: MAX_FEATURES,
            target_features: TARGET_FEATURES,
            min_features: MIN_FEATURES,
            min_quality: MIN_QUALITY,
            max_flow_error: MAX_FLOW_ERROR,
            min_distance: MIN_DIST,
            ransac_threshold: RANSAC_THRESHOLD,
            ransac_confidence: RANSAC_CONFIDENCE,
            min_ransac_points: MIN_RANSAC_POINTS,
            max_ransac_discard: MAX_RANSAC_DISCARD,
            flow_back: FLOW_BACK,
            flow_back_threshold: FLOW_BACK_THRESHOLD,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_features > 0, "max_features must be positive");
        ensure!(
            (0.0..=1.0).contains(&self.min_quality),
            "min_quality must lie in [0, 1], got {}",
            self.min_quality
        );
        ensure!(self.max_flow_error > 0.0, "max_flow_error must be positive");
        ensure!(self.min_distance >= 0, "min_distance must not be negative");
        ensure!(self.ransac_threshold > 0.0, "ransac_threshold must be positive");
        ensure!(
            self.ransac_confidence > 0.0 && self.ransac_confidence < 1.0,
            "ransac_confidence must lie in (0, 1), got {}",
            self.ransac_confidence
        );
        // 八点法
        ensure!(
            self.min_ransac_points >= 8,
            "min_ransac_points must be at least 8"
        );
        ensure!(
            (0.0..=1.0).contains(&self.max_ransac_discard),
            "max_ransac_discard must lie in [0, 1]"
        );
        ensure!(
            self.flow_back_threshold > 0.0,
            "flow_back_threshold must be positive"
        );
        Ok(())
    }
}

/// 金字塔 LK 光流参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub win_size: i32,
    pub max_level: i32,
    pub max_iterations: i32,
    pub epsilon: f64,
    pub min_eig_threshold: f64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            win_size: 21,
            max_level: 3,
            max_iterations: 30,
            epsilon: 0.01,
            min_eig_threshold: 1e-4,
        }
    }
}

/// ORB 参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbConfig {
    pub scale_factor: f32,
    pub n_levels: i32,
    pub edge_threshold: i32,
    pub first_level: i32,
    pub wta_k: i32,
    pub patch_size: i32,
    pub fast_threshold: i32,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.2,
            n_levels: 8,
            edge_threshold: 31,
            first_level: 0,
            wta_k: 2,
            patch_size: 31,
            fast_threshold: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub flow: FlowConfig,
    pub orb: OrbConfig,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid tracker config")?;
        config.tracker.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.tracker.validate().unwrap();
        assert_eq!(config.tracker.max_features, 1000);
        assert_eq!(config.tracker.target_features, 500);
        assert_eq!(config.tracker.min_features, 100);
        assert_eq!(config.flow.win_size, 21);
        assert_eq!(config.flow.max_level, 3);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let config =
            Config::from_json_str(r#"{ "tracker": { "target_features": 300 }, "flow": { "max_level": 2 } }"#)
                .unwrap();
        assert_eq!(config.tracker.target_features, 300);
        assert_eq!(config.tracker.max_features, MAX_FEATURES);
        assert_eq!(config.flow.max_level, 2);
        assert_eq!(config.flow.win_size, 21);
        assert_eq!(config.orb, OrbConfig::default());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(Config::from_json_str(r#"{ "tracker": { "min_quality": 1.5 } }"#).is_err());
        assert!(Config::from_json_str(r#"{ "tracker": { "max_features": 0 } }"#).is_err());
        assert!(Config::from_json_str(r#"{ "tracker": { "min_ransac_points": 4 } }"#).is_err());
        assert!(Config::from_json_str("not json").is_err());
    }

    #[test]
    fn read_from_json_file() {
        let path = std::env::temp_dir().join(format!("ar_frontend_config_{}.json", std::process::id()));
        let config = Config {
            tracker: TrackerConfig {
                flow_back: true,
                ..Default::default()
            },
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        let read = Config::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(read, config);

        assert!(Config::from_json_file("/nonexistent/ar_frontend.json").is_err());
    }
}
