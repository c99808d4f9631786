//! 呈现器依赖的外部能力：上游帧来源、绘制后端、显示光栅

use crate::core::{perf_counter, ReferenceTime, Result, SurfaceIndex, UNITS};

/// 上游写入表面后的时间信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    pub time: Option<ReferenceTime>,
    pub duration: ReferenceTime,
}

/// 上游（混合器）：把下一帧写入指定表面
pub trait FrameSource: Send {
    /// 暂无数据时返回 `None`
    fn produce(&mut self, surface: SurfaceIndex) -> Option<DecodedFrame>;
}

/// 绘制后端
pub trait PresentBackend: Send + Sync {
    /// 立即呈现一块表面
    fn paint(&self, surface: SurfaceIndex, time: Option<ReferenceTime>) -> Result<()>;

    /// 表面池已重新分配
    fn surfaces_reallocated(&self, count: usize, width: u32, height: u32);
}

/// 显示光栅状态
pub trait DisplayRaster: Send + Sync {
    /// 当前扫描线，读取失败时返回 `None`
    fn scan_line(&self) -> Option<u32>;

    /// 屏幕扫描线总数
    fn height(&self) -> u32;

    /// 标称刷新率（Hz）
    fn refresh_rate(&self) -> f64;

    /// 期望呈现时光栅所在的扫描线
    fn vblank_line(&self) -> i32 {
        0
    }
}

/// 按固定刷新率由 `perf_counter()` 推算扫描线的光栅
pub struct SimulatedRaster {
    refresh_rate: f64,
    height: u32,
    epoch: ReferenceTime,
}

impl SimulatedRaster {
    pub fn new(refresh_rate: f64, height: u32) -> Self {
        Self {
            refresh_rate,
            height,
            epoch: perf_counter(),
        }
    }
}

impl DisplayRaster for SimulatedRaster {
    fn scan_line(&self) -> Option<u32> {
        let line_time = UNITS as f64 / self.refresh_rate / self.height as f64;
        let elapsed = (perf_counter() - self.epoch) as f64;
        Some(((elapsed / line_time) as u64 % self.height as u64) as u32)
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn refresh_rate(&self) -> f64 {
        self.refresh_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_raster_stays_on_screen() {
        let raster = SimulatedRaster::new(60.0, 1125);
        for _ in 0..100 {
            let line = raster.scan_line().unwrap();
            assert!(line < 1125);
        }
        assert_eq!(raster.height(), 1125);
    }
}
