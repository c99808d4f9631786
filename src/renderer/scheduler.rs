//! 单个样本的呈现决策：丢弃 / 绘制 / 等待

use crate::core::ReferenceTime;
use crate::renderer::vsync::VSyncMode;

/// 调度余量下限（1.5ms）
pub const MIN_FRAME_TIME: ReferenceTime = 15_000;
/// 帧时长抖动计入余量的上限（2ms）
const MAX_STD_DEV_MARGIN: ReferenceTime = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// 已经太晚，且后面还有样本
    Drop,
    Paint,
    /// 等待若干毫秒后重试
    Wait(u32),
}

/// 调度余量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Margins {
    pub margin: ReferenceTime,
    /// 丢帧判定用的半余量
    pub low: ReferenceTime,
    /// 绘制判定阈值，随相位模式偏移
    pub high: ReferenceTime,
}

impl Margins {
    pub fn new(time_per_frame: ReferenceTime, frame_time_std_dev: f64, correction_active: bool, mode: VSyncMode) -> Self {
        let min_margin = if correction_active {
            MIN_FRAME_TIME + (frame_time_std_dev as ReferenceTime).min(MAX_STD_DEV_MARGIN)
        } else {
            MIN_FRAME_TIME
        };
        let lo = time_per_frame * 2 / 100;
        let hi = time_per_frame * 11 / 100;
        let margin = min_margin.max(lo).min(hi.max(lo));
        let high = match mode {
            VSyncMode::Normal => 0,
            VSyncMode::ShiftEarly => -margin,
            VSyncMode::ShiftLate => margin,
        };
        Self {
            margin,
            low: margin / 2,
            high,
        }
    }
}

/// 决策输入
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    /// 样本时间 - 时钟（或下一次 vsync 时的时钟）
    pub sync_offset: ReferenceTime,
    pub time_per_frame: ReferenceTime,
    pub margins: Margins,
    /// 距下一次 vsync 的时长，未启用 vsync 校正时为 `None`
    pub time_to_next_vsync: Option<ReferenceTime>,
    /// 队列中排在它后面的样本数
    pub samples_left: usize,
}

pub fn decide(slot: &FrameSlot) -> Decision {
    let m = slot.margins;
    if slot.sync_offset < -(slot.time_per_frame + m.low - m.high) && slot.samples_left > 0 {
        return Decision::Drop;
    }
    if slot.sync_offset < m.high {
        return Decision::Paint;
    }

    let wait = match slot.time_to_next_vsync {
        Some(t) if slot.sync_offset > 0 => t / 10_000 - 2,
        _ => slot.sync_offset / 10_000 - 2,
    };
    let wait = if wait * 10_000 > slot.time_per_frame {
        1
    } else {
        wait.max(0)
    };
    Decision::Wait(wait as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NTSC_FRAME: ReferenceTime = 333_667;

    fn slot(sync_offset: ReferenceTime, time_per_frame: ReferenceTime, samples_left: usize) -> FrameSlot {
        FrameSlot {
            sync_offset,
            time_per_frame,
            margins: Margins::new(time_per_frame, 0.0, false, VSyncMode::Normal),
            time_to_next_vsync: None,
            samples_left,
        }
    }

    #[test]
    fn test_margin_clamped_to_frame_fraction() {
        let m = Margins::new(33_367, 0.0, false, VSyncMode::Normal);
        assert_eq!(m.margin, 3_670);
        assert_eq!(m.low, 1_835);
        assert_eq!(m.high, 0);

        let m = Margins::new(NTSC_FRAME, 50_000.0, true, VSyncMode::ShiftLate);
        assert_eq!(m.margin, 35_000);
        assert_eq!(m.high, 35_000);
        let m = Margins::new(NTSC_FRAME, 0.0, false, VSyncMode::ShiftEarly);
        assert_eq!(m.margin, 15_000);
        assert_eq!(m.high, -15_000);
    }

    #[test]
    fn test_drop_paint_boundary() {
        // -(33367 + 1835) = -35202
        assert_eq!(decide(&slot(-35_203, 33_367, 1)), Decision::Drop);
        assert_eq!(decide(&slot(-35_202, 33_367, 1)), Decision::Paint);
        assert_eq!(decide(&slot(-35_203, 33_367, 0)), Decision::Paint);
        assert_eq!(decide(&slot(-1, 33_367, 3)), Decision::Paint);
    }

    #[test]
    fn test_wait_durations() {
        assert_eq!(decide(&slot(0, NTSC_FRAME, 0)), Decision::Wait(0));
        assert_eq!(decide(&slot(150_000, NTSC_FRAME, 0)), Decision::Wait(13));
        // 超过一帧时改为短睡眠
        assert_eq!(decide(&slot(5_000_000, NTSC_FRAME, 0)), Decision::Wait(1));

        let mut s = slot(150_000, NTSC_FRAME, 0);
        s.time_to_next_vsync = Some(80_000);
        assert_eq!(decide(&s), Decision::Wait(6));
    }
}
