//! 参考时钟平滑
//!
//! 参考时钟的读数会抖动，这里按墙钟估计时钟速率，并用临界阻尼的方式逐步逼近。

use crate::core::{ClockState, ReferenceClock, ReferenceTime, UNITS};

const HISTORY_LEN: usize = 100;
/// 至少积累这么多条记录才开始估计速率
const HISTORY_WARMUP: usize = 50;

/// 二阶平滑：`velocity += -k·velocity - k²/4·(value - target)`，然后 `value += velocity`
pub fn moderate_float(value: &mut f64, target: f64, velocity: &mut f64, change_speed: f64) {
    let accel = -change_speed * *velocity - (*value - target) * change_speed * change_speed * 0.25;
    *velocity += accel;
    *value += *velocity;
}

/// 时钟平滑器
pub struct ClockModerator {
    speed: f64,
    speed_velocity: f64,
    last_perf: Option<ReferenceTime>,
    last_state: Option<ClockState>,
    wall_history: [f64; HISTORY_LEN],
    clock_history: [f64; HISTORY_LEN],
    history_pos: usize,
}

impl ClockModerator {
    pub fn new() -> Self {
        Self {
            speed: 1.0,
            speed_velocity: 0.0,
            last_perf: None,
            last_state: None,
            wall_history: [0.0; HISTORY_LEN],
            clock_history: [0.0; HISTORY_LEN],
            history_pos: 0,
        }
    }

    /// 下一次查询时重置历史（时钟启动/停止/暂停时调用）
    pub fn reset(&mut self) {
        self.last_perf = None;
    }

    /// 当前估计的时钟速率
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// 读取参考时钟，返回 `perf_now` 时刻的平滑时钟值
    pub fn clock_time(&mut self, clock: &dyn ReferenceClock, perf_now: ReferenceTime) -> ReferenceTime {
        let (mut clock_time, counter) = clock.correlated_time();
        let frequency = clock.frequency();
        if frequency != UNITS as u64 && frequency != 0 {
            clock_time = (clock_time as i128 * UNITS as i128 / frequency as i128) as i64;
        }
        self.moderate(clock_time, counter, clock.state(), perf_now)
    }

    /// `clock_time` 为 `counter` 时刻的时钟值（100ns）
    pub fn moderate(
        &mut self,
        clock_time: ReferenceTime,
        counter: ReferenceTime,
        state: ClockState,
        perf_now: ReferenceTime,
    ) -> ReferenceTime {
        let target = clock_time as f64 + (perf_now - counter) as f64 * self.speed;

        let reset = self.last_perf.is_none() || self.last_state != Some(state);
        let time_change = match self.last_perf {
            Some(last) if !reset => perf_now - last,
            _ => 0,
        };
        self.last_perf = Some(perf_now);
        self.last_state = Some(state);

        if reset {
            self.speed = 1.0;
            self.speed_velocity = 0.0;
            self.wall_history = [0.0; HISTORY_LEN];
            self.clock_history = [0.0; HISTORY_LEN];
            self.history_pos = 0;
        }

        if time_change != 0 {
            let pos = self.history_pos % HISTORY_LEN;
            let filled = self.history_pos.min(HISTORY_LEN);
            self.history_pos += 1;
            if filled > HISTORY_WARMUP {
                let oldest = if filled < HISTORY_LEN { 0 } else { pos };
                let wall_change = perf_now as f64 - self.wall_history[oldest];
                let clock_change = clock_time as f64 - self.clock_history[oldest];
                let speed_target = clock_change / wall_change;

                let ratio = if speed_target > self.speed {
                    speed_target / self.speed
                } else {
                    self.speed / speed_target
                };
                let change_speed = if ratio > 0.1 { 0.1 } else { 0.01 };
                moderate_float(&mut self.speed, speed_target, &mut self.speed_velocity, change_speed);
            }
            self.wall_history[pos] = perf_now as f64;
            self.clock_history[pos] = clock_time as f64;
        }

        target as ReferenceTime
    }
}

impl Default for ClockModerator {
    fn default() -> Self {
        Self::new()
    }
}
