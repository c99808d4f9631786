//! 帧率检测与时间戳修正
//!
//! 统计相邻样本的时间差，吸附到常见帧率并投票；锁定后把偏离预测值过多的时间戳拉回。

use crate::core::{ReferenceTime, UNITS};
use std::collections::BTreeMap;

const DELTA_WINDOW: usize = 60;
const VOTE_HISTORY: usize = 500;
/// 窗口内至少这么多条时间差才开始统计
const MIN_DELTAS: u32 = 10;
/// 吸附容差（0.03%）
const SNAP_TOLERANCE: f64 = 0.0003;
/// 锁定需要的票数下限（严格大于）
const MIN_VOTES: u32 = 5;
/// 偏离预测超过 1.5ms 才修正
const CORRECTION_THRESHOLD: f64 = 0.0015;
/// 修正后的若干帧内放宽调度余量
const CORRECTION_HOLD_FRAMES: u32 = 30;
/// 超过这么多个标称帧的跳变视为 seek
const SEEK_FRAMES: ReferenceTime = 8;

/// 可吸附的标准帧率
pub const SNAP_RATES: [f64; 10] = [
    60.0,
    60.0 / 1.001,
    50.0,
    48.0,
    48.0 / 1.001,
    30.0,
    30.0 / 1.001,
    25.0,
    24.0,
    24.0 / 1.001,
];

/// 一次入队的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retiming {
    /// 入队使用的时间戳（可能已修正）
    pub time: ReferenceTime,
    /// 修正后的时长，未修正时为 `None`
    pub duration: Option<ReferenceTime>,
    /// 检测到 seek
    pub seek: bool,
}

/// 帧率检测器
pub struct FrameRateDetector {
    deltas: [ReferenceTime; DELTA_WINDOW],
    delta_pos: u32,
    votes: Vec<f64>,
    std_dev: f64,
    detected_rate: f64,
    detected_frame_time: f64, // 秒
    locked: bool,
    last_uncorrected: Option<ReferenceTime>,
    last_time_secs: f64,
    correction_hold: u32,
}

impl FrameRateDetector {
    pub fn new() -> Self {
        Self {
            deltas: [0; DELTA_WINDOW],
            delta_pos: 0,
            votes: vec![0.0; VOTE_HISTORY],
            std_dev: 0.0,
            detected_rate: 0.0,
            detected_frame_time: 0.0,
            locked: false,
            last_uncorrected: None,
            last_time_secs: 0.0,
            correction_hold: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn detected_rate(&self) -> f64 {
        self.detected_rate
    }

    /// 帧时长标准差（100ns）
    pub fn frame_time_std_dev(&self) -> f64 {
        self.std_dev
    }

    /// 最近发生过时间戳修正
    pub fn correction_active(&self) -> bool {
        self.correction_hold > 0
    }

    /// 当前帧时长（秒）：锁定时用检测值，否则用标称值
    pub fn frame_time(&self, nominal: ReferenceTime) -> f64 {
        if self.locked {
            self.detected_frame_time
        } else {
            nominal as f64 / UNITS as f64
        }
    }

    /// 新样本入队前调用
    pub fn on_sample(&mut self, time: ReferenceTime, nominal: ReferenceTime, correction_enabled: bool) -> Retiming {
        let prev = self.last_uncorrected;
        self.last_uncorrected = Some(time);

        let mut out = Retiming {
            time,
            duration: None,
            seek: false,
        };
        let prev_time = prev.unwrap_or(-1);
        let diff = prev.map_or(0, |p| (time - p).abs());
        let diff_to_fp = (prev_time - (self.last_time_secs * UNITS as f64) as ReferenceTime).abs();

        if nominal != 0 && diff < nominal * SEEK_FRAMES && diff_to_fp < nominal * SEEK_FRAMES {
            let delta = prev.map_or(0, |p| time - p);
            self.deltas[self.delta_pos as usize % DELTA_WINDOW] = delta;
            self.delta_pos += 1;

            if self.delta_pos >= MIN_DELTAS {
                self.vote();
            }

            if self.detected_frame_time != 0.0 && self.locked && correction_enabled {
                let current = time as f64 / UNITS as f64;
                let predicted = self.last_time_secs + self.detected_frame_time;
                if (predicted - current).abs() > CORRECTION_THRESHOLD {
                    out.time = (predicted * UNITS as f64) as ReferenceTime;
                    out.duration = Some((self.detected_frame_time * UNITS as f64) as ReferenceTime);
                    self.correction_hold = CORRECTION_HOLD_FRAMES;
                    self.last_time_secs = predicted;
                } else {
                    self.last_time_secs = current;
                }
            } else {
                self.last_time_secs = time as f64 / UNITS as f64;
            }
        } else {
            self.last_time_secs = time as f64 / UNITS as f64;
            if nominal != 0 && diff > nominal * SEEK_FRAMES {
                self.delta_pos = 0;
                self.locked = false;
                out.seek = true;
            }
        }

        if out.duration.is_none() && self.correction_hold > 0 {
            self.correction_hold -= 1;
        }
        out
    }

    fn vote(&mut self) {
        let n = (self.delta_pos as usize).min(DELTA_WINDOW);
        let window = &self.deltas[..n];
        let sum: ReferenceTime = window.iter().sum();
        let mean = sum as f64 / n as f64;
        let variance = window.iter().map(|&d| (d as f64 - mean).powi(2)).sum::<f64>() / n as f64;
        self.std_dev = variance.sqrt();

        let mut rate = 1.0 / (sum as f64 / (n as f64 * UNITS as f64));
        if let Some(&snapped) = SNAP_RATES.iter().find(|&&r| (1.0 - rate / r).abs() < SNAP_TOLERANCE) {
            rate = snapped;
        }
        self.votes[self.delta_pos as usize % VOTE_HISTORY] = rate;

        // f64 正数的位模式与数值同序
        let mut tally: BTreeMap<u64, u32> = BTreeMap::new();
        for v in &self.votes {
            *tally.entry(v.to_bits()).or_default() += 1;
        }

        // 票数必须严格多于其它所有候选，平票不锁定
        let mut best = 0.0;
        let mut best_votes = MIN_VOTES;
        let mut tied = false;
        for (&bits, &count) in &tally {
            let value = f64::from_bits(bits);
            if value == 0.0 {
                continue;
            }
            if count > best_votes {
                best_votes = count;
                best = value;
                tied = false;
            } else if count == best_votes && best != 0.0 {
                tied = true;
            }
        }
        if tied {
            best = 0.0;
        }

        self.locked = SNAP_RATES.contains(&best);
        if best != 0.0 {
            self.detected_rate = best;
            self.detected_frame_time = 1.0 / best;
        }
    }
}

impl Default for FrameRateDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILM: ReferenceTime = 417_083;

    fn film_time(i: i64) -> ReferenceTime {
        i * UNITS * 1001 / 24000
    }

    #[test]
    fn test_locks_on_film_rate_after_70_samples() {
        let mut d = FrameRateDetector::new();
        for i in 0..70 {
            let r = d.on_sample(film_time(i), FILM, true);
            assert_eq!(r.time, film_time(i));
            assert!(!r.seek);
        }
        assert!(d.is_locked());
        assert_eq!(d.detected_rate(), 24.0 / 1.001);
        assert!((d.frame_time(0) - 1001.0 / 24000.0).abs() < 1e-12);
    }

    #[test]
    fn test_not_locked_before_enough_votes() {
        let mut d = FrameRateDetector::new();
        for i in 0..40 {
            d.on_sample(film_time(i), FILM, true);
        }
        assert!(!d.is_locked());
        assert_eq!(d.frame_time(FILM), FILM as f64 / UNITS as f64);
    }

    #[test]
    fn test_corrects_jittered_timestamp_when_locked() {
        let mut d = FrameRateDetector::new();
        for i in 0..70 {
            d.on_sample(film_time(i), FILM, true);
        }
        let jittered = film_time(70) + 30_000; // 3ms
        let r = d.on_sample(jittered, FILM, true);
        assert!((r.time - film_time(70)).abs() <= 1);
        assert_eq!(r.duration, Some(FILM));
        assert!(d.correction_active());

        let r = d.on_sample(film_time(71), FILM, true);
        assert_eq!(r.duration, None);
    }

    #[test]
    fn test_correction_disabled_keeps_timestamp() {
        let mut d = FrameRateDetector::new();
        for i in 0..70 {
            d.on_sample(film_time(i), FILM, false);
        }
        let jittered = film_time(70) + 30_000;
        assert_eq!(d.on_sample(jittered, FILM, false).time, jittered);
    }

    #[test]
    fn test_seek_resets_lock() {
        let mut d = FrameRateDetector::new();
        for i in 0..70 {
            d.on_sample(film_time(i), FILM, true);
        }
        let r = d.on_sample(film_time(500), FILM, true);
        assert!(r.seek);
        assert!(!d.is_locked());
        assert_eq!(r.time, film_time(500));
    }

    #[test]
    fn test_tied_votes_do_not_lock() {
        let mut d = FrameRateDetector::new();
        d.deltas[..11].fill(400_000);
        d.delta_pos = 10;
        d.votes[100..106].fill(24.0);
        d.votes[200..205].fill(25.0);

        // 第 6 张 25fps 票与 24fps 打平
        d.vote();
        assert!(!d.is_locked());

        d.delta_pos = 11;
        d.vote();
        assert!(d.is_locked());
        assert_eq!(d.detected_rate(), 25.0);
    }

    #[test]
    fn test_unknown_nominal_never_detects() {
        let mut d = FrameRateDetector::new();
        for i in 0..100 {
            let r = d.on_sample(film_time(i), 0, true);
            assert!(!r.seek);
        }
        assert!(!d.is_locked());
    }
}
