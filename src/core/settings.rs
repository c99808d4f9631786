use crate::core::error::Result;
use crate::core::types::ReferenceTime;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 呈现器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenterSettings {
    /// 表面池大小
    pub surface_count: usize,
    /// 以下一次垂直同步的时钟值计算同步偏移
    pub vsync_internal: bool,
    /// 锁定帧率后修正时间戳
    pub frame_time_correction: bool,
    /// 标称帧时长（100ns），0 表示由样本时长决定
    pub nominal_time_per_frame: ReferenceTime,
    /// 工作线程退出的宽限期（毫秒）
    pub grace_period_ms: u64,
    /// 刷新率（Hz），没有光栅信息时使用
    pub display_refresh_rate: f64,
    /// 屏幕扫描线数
    pub display_height: u32,
}

impl Default for PresenterSettings {
    fn default() -> Self {
        Self {
            surface_count: 5,
            vsync_internal: false,
            frame_time_correction: true,
            nominal_time_per_frame: 0,
            grace_period_ms: 1000,
            display_refresh_rate: 60.0,
            display_height: 1080,
        }
    }
}

impl PresenterSettings {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// 参数集解析选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseOptions {
    /// 去除 AVC/HEVC 负载中的防竞争字节（00 00 03）
    pub strip_emulation_prevention: bool,
    /// AVC 高度 1088 按 1080 处理
    pub coerce_1088_to_1080: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            strip_emulation_prevention: true,
            coerce_1088_to_1080: true,
        }
    }
}
