//! 同步偏移 / 帧间隔统计（固定长度环形缓冲）

use crate::core::{QualityStats, ReferenceTime, UNITS};

/// 环形缓冲长度
pub const JITTER_LEN: usize = 126;

/// 环形缓冲上的均值、标准差、极值
#[derive(Debug, Clone)]
pub struct RingStats {
    values: [ReferenceTime; JITTER_LEN],
    next: usize,
    mean: f64,
    std_dev: f64,
    min: ReferenceTime,
    max: ReferenceTime,
}

impl RingStats {
    pub fn new() -> Self {
        Self {
            values: [0; JITTER_LEN],
            next: 0,
            mean: 0.0,
            std_dev: 0.0,
            min: 0,
            max: 0,
        }
    }

    /// 写入一个值并重新计算（未写满的槽位按 0 计入）
    pub fn push(&mut self, value: ReferenceTime) {
        self.next = (self.next + 1) % JITTER_LEN;
        self.values[self.next] = value;

        let mut sum: ReferenceTime = 0;
        let mut min = ReferenceTime::MAX;
        let mut max = ReferenceTime::MIN;
        for &v in &self.values {
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        let mean = sum as f64 / JITTER_LEN as f64;
        let variance = self
            .values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / JITTER_LEN as f64;

        self.mean = mean;
        self.std_dev = variance.sqrt();
        self.min = min;
        self.max = max;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        self.std_dev
    }

    pub fn min(&self) -> ReferenceTime {
        self.min
    }

    pub fn max(&self) -> ReferenceTime {
        self.max
    }
}

impl Default for RingStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 呈现质量计数与统计
#[derive(Debug, Clone, Default)]
pub struct QualityCounters {
    pub frames_dropped: u32,
    pub frames_drawn: u32,
    pub sync_offsets: RingStats,
    pub paint_intervals: RingStats,
    last_paint: Option<ReferenceTime>,
}

impl QualityCounters {
    /// 清零计数（开始推流时）
    pub fn reset(&mut self) {
        self.frames_dropped = 0;
        self.frames_drawn = 0;
    }

    /// 记录一次实际绘制的时刻（perf 计数）
    pub fn record_paint(&mut self, perf: ReferenceTime) {
        if let Some(last) = self.last_paint {
            self.paint_intervals.push(perf - last);
        }
        self.last_paint = Some(perf);
    }

    pub fn snapshot(&self) -> QualityStats {
        let to_ms = |v: f64| (v / 10_000.0 + 0.5) as i32;
        let avg_interval = self.paint_intervals.mean();
        let avg_fps = if avg_interval > 0.0 {
            UNITS as f64 / avg_interval
        } else {
            0.0
        };
        QualityStats {
            frames_dropped: self.frames_dropped,
            frames_drawn: self.frames_drawn,
            avg_frame_rate: (avg_fps * 100.0) as i32,
            jitter: to_ms(self.paint_intervals.std_dev()),
            avg_sync_offset: to_ms(self.sync_offsets.mean()),
            dev_sync_offset: to_ms(self.sync_offsets.std_dev()),
        }
    }
}
