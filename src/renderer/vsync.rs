//! 垂直同步：刷新率/扫描线测量、相位预测、呈现相位模式
//!
//! 测量由 vsync 线程完成，渲染线程只读取 `RefreshEstimate` 快照。

use crate::core::{ReferenceTime, UNITS};
use crate::renderer::moderator::moderate_float;

const REFRESH_HISTORY: usize = 100;
/// 测量次数不足时使用标称刷新率
const MIN_MEASUREMENTS: u32 = 20;
const REFRESH_SMOOTHING: f64 = 1.5;
const MODE_HISTORY: usize = 5;

/// 刷新率估计快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshEstimate {
    /// 一帧的时长（秒）
    pub refresh_time: f64,
    pub scanlines_per_frame: f64,
    /// 一条扫描线的时长（秒）
    pub scanline_time: f64,
    /// 最近一次测量结束时的扫描线与 perf 计数
    pub anchor_line: f64,
    pub anchor_time: ReferenceTime,
}

impl RefreshEstimate {
    /// 由标称刷新率和屏幕高度构造
    pub fn nominal(refresh_rate: f64, height: u32) -> Self {
        let refresh_time = 1.0 / refresh_rate;
        Self {
            refresh_time,
            scanlines_per_frame: height as f64,
            scanline_time: refresh_time / height as f64,
            anchor_line: 0.0,
            anchor_time: 0,
        }
    }

    /// 一帧的时长（100ns）
    pub fn vsync_time(&self) -> ReferenceTime {
        (self.refresh_time * UNITS as f64) as ReferenceTime
    }

    /// 从 `now` 到光栅到达 `target_line` 的时长（秒）
    pub fn time_until_line(&self, target_line: f64, now: ReferenceTime) -> f64 {
        let lines = self.scanlines_per_frame;
        let lines_per_second = 1.0 / self.scanline_time;
        let elapsed = (now - self.anchor_time) as f64 / UNITS as f64;
        let current = (self.anchor_line + lines_per_second * elapsed).rem_euclid(lines);
        let target = target_line.rem_euclid(lines);
        let until = if target > current {
            target - current
        } else {
            lines - current + target
        };
        until * self.scanline_time
    }
}

/// 刷新率检测（三点扫描线计时 + 100 次平均 + 平滑）
pub struct RefreshDetector {
    refresh_samples: [f64; REFRESH_HISTORY],
    scanline_samples: [f64; REFRESH_HISTORY],
    measurements: u32,
    refresh_time: f64,
    refresh_velocity: f64,
    scanline_time: f64,
    scanline_velocity: f64,
    scanlines_per_frame: f64,
    refresh_rate: f64,
    anchor_line: f64,
    anchor_time: ReferenceTime,
}

impl RefreshDetector {
    pub fn new() -> Self {
        Self {
            refresh_samples: [0.0; REFRESH_HISTORY],
            scanline_samples: [0.0; REFRESH_HISTORY],
            measurements: 0,
            refresh_time: 0.0,
            refresh_velocity: 0.0,
            scanline_time: 0.0,
            scanline_velocity: 0.0,
            scanlines_per_frame: 0.0,
            refresh_rate: 0.0,
            anchor_line: 0.0,
            anchor_time: 0,
        }
    }

    /// 显示模式变化后从头测量
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn refresh_rate(&self) -> f64 {
        self.refresh_rate
    }

    pub fn measurements(&self) -> u32 {
        self.measurements
    }

    /// 测量次数够了用测量值，否则用标称值
    pub fn estimate(&self, nominal_rate: f64, height: u32) -> RefreshEstimate {
        if self.measurements < MIN_MEASUREMENTS || self.refresh_time == 0.0 || self.scanlines_per_frame == 0.0 {
            return RefreshEstimate::nominal(nominal_rate, height);
        }
        RefreshEstimate {
            refresh_time: self.refresh_time,
            scanlines_per_frame: self.scanlines_per_frame,
            scanline_time: self.scanline_time,
            anchor_line: self.anchor_line,
            anchor_time: self.anchor_time,
        }
    }

    /// 喂入一次三点测量：光栅依次经过 `lines` 三条扫描线的 perf 时刻为 `times`
    ///
    /// 第一、三条扫描线相同（隔一整帧），返回是否采纳。
    pub fn measure(&mut self, lines: [u32; 3], times: [ReferenceTime; 3]) -> bool {
        let [line_start, line_middle, line_end] = lines;
        let [time_start, time_middle, time_end] = times;

        let mut seconds = (time_end - time_start) as f64 / UNITS as f64;
        let diff_middle = (time_middle - time_start) as f64;
        let diff_end = (time_end - time_middle) as f64;
        let symmetry = if diff_end > diff_middle {
            diff_end / diff_middle
        } else {
            diff_middle / diff_end
        };
        if !(seconds > 0.003 && symmetry < 1.3) {
            return false;
        }

        let (span_seconds, span_lines) = if line_middle > line_end {
            (diff_middle / UNITS as f64, line_middle as f64 - line_start as f64)
        } else {
            (diff_end / UNITS as f64, line_end as f64 - line_middle as f64)
        };
        let scanline_time = span_seconds / span_lines;

        let pos = self.measurements as usize % REFRESH_HISTORY;
        self.scanline_samples[pos] = scanline_time;
        if self.scanline_time != 0.0 && line_start != line_end {
            seconds -= (line_end as f64 - line_start as f64) * self.scanline_time;
        }
        self.refresh_samples[pos] = seconds;

        let n = (pos + 1).min(REFRESH_HISTORY);
        let average = self.refresh_samples[..n].iter().sum::<f64>() / n as f64;
        let average_scanline = self.scanline_samples[..n].iter().sum::<f64>() / n as f64;
        if !(average > 0.0 && average_scanline > 0.0) {
            return false;
        }

        self.measurements += 1;
        if self.refresh_time == 0.0 || !(0.99..=1.01).contains(&(self.refresh_time / average)) {
            self.refresh_time = average;
            self.refresh_velocity = 0.0;
        }
        if self.refresh_time.is_nan() {
            self.refresh_time = 0.0;
        }
        if self.refresh_velocity.is_nan() {
            self.refresh_velocity = 0.0;
        }
        moderate_float(&mut self.refresh_time, average, &mut self.refresh_velocity, REFRESH_SMOOTHING);
        self.refresh_rate = if self.refresh_time > 0.0 { 1.0 / self.refresh_time } else { 0.0 };

        if self.scanline_time == 0.0 || !(0.99..=1.01).contains(&(self.scanline_time / average_scanline)) {
            self.scanline_time = average_scanline;
            self.scanline_velocity = 0.0;
        }
        moderate_float(&mut self.scanline_time, average_scanline, &mut self.scanline_velocity, REFRESH_SMOOTHING);
        self.scanlines_per_frame = if self.scanline_time > 0.0 {
            self.refresh_time / self.scanline_time
        } else {
            0.0
        };

        self.anchor_line = line_end as f64;
        self.anchor_time = time_end;
        true
    }
}

impl Default for RefreshDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// 呈现相位模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VSyncMode {
    #[default]
    Normal,
    /// 提前一个余量呈现
    ShiftEarly,
    /// 推迟一个余量呈现
    ShiftLate,
}

/// 根据最近 5 次绘制偏移切换相位模式
#[derive(Debug, Clone, Default)]
pub struct VSyncModeSelector {
    history: [ReferenceTime; MODE_HISTORY],
    pos: usize,
    mode: VSyncMode,
}

impl VSyncModeSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> VSyncMode {
        self.mode
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// `offset` 为本次绘制距下一次 vsync 的提前量，`vsync_time` 为一帧刷新时长
    pub fn update(&mut self, offset: ReferenceTime, margin: ReferenceTime, vsync_time: ReferenceTime) -> VSyncMode {
        let min = self.history.iter().copied().min().unwrap_or(0);
        let max = self.history.iter().copied().max().unwrap_or(0);

        self.history[self.pos] = offset;
        self.pos = (self.pos + 1) % MODE_HISTORY;

        self.mode = match self.mode {
            VSyncMode::Normal if offset < margin && max > vsync_time - margin => VSyncMode::ShiftLate,
            VSyncMode::Normal if offset > vsync_time - margin && min < margin => VSyncMode::ShiftEarly,
            VSyncMode::ShiftLate if min > margin => VSyncMode::Normal,
            VSyncMode::ShiftEarly if max < vsync_time - margin => VSyncMode::Normal,
            mode => mode,
        };
        self.mode
    }
}
