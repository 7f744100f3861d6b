//! AR 前端的稀疏特征跟踪
//!
//! - [frame]: 图像帧与特征点缓存
//! - [feature_tracker]: 光流跟踪、RANSAC 筛选、重新检测与补充
//! - [primitives]: 特征检测、光流、基础矩阵估计

pub mod cast;
pub mod config;
pub mod feature;
pub mod feature_tracker;
pub mod frame;
pub mod primitives;

pub use config::{Config, FlowConfig, OrbConfig, TrackerConfig};
pub use feature::{Feature, FeatureSet};
pub use feature_tracker::{FeatureTracker, TrackId, TrackingResult};
pub use frame::{Frame, FrameId};
pub use primitives::{
    FeatureDetector, FlowResult, FundamentalEstimate, FundamentalEstimator, OpticalFlow,
    OrbDetector, PyrLkFlow, RansacFundamental,
};
