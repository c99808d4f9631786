use crate::core::types::{ReferenceTime, UNITS};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// 单调递增的高精度计数器（100ns），进程内共享同一个起点
pub fn perf_counter() -> ReferenceTime {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    (epoch.elapsed().as_nanos() / 100) as ReferenceTime
}

/// 参考时钟状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockState {
    Invalid,
    Running,
    Stopped,
    Paused,
}

/// 参考时钟（呈现时间的来源）
pub trait ReferenceClock: Send + Sync {
    /// 返回 (时钟 tick, 取样时刻的 `perf_counter()`)
    fn correlated_time(&self) -> (i64, ReferenceTime);

    /// 时钟频率（Hz），10MHz 时无需换算
    fn frequency(&self) -> u64 {
        UNITS as u64
    }

    fn state(&self) -> ClockState;
}

/// 系统参考时钟 - 以 `perf_counter()` 为基准，支持暂停和变速
#[derive(Clone)]
pub struct SystemClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    base_time: ReferenceTime, // 基准时钟时间（100ns）
    base_perf: ReferenceTime, // 基准计数器时刻
    rate: f64,                // 速率（1.0 = 正常）
    state: ClockState,
    paused_at: ReferenceTime, // 暂停时的位置
}

impl ClockInner {
    fn time_at(&self, perf: ReferenceTime) -> ReferenceTime {
        match self.state {
            ClockState::Running => {
                self.base_time + ((perf - self.base_perf) as f64 * self.rate) as ReferenceTime
            }
            _ => self.paused_at,
        }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                base_time: 0,
                base_perf: perf_counter(),
                rate: 1.0,
                state: ClockState::Stopped,
                paused_at: 0,
            })),
        }
    }

    /// 当前时钟时间（100ns）
    pub fn now(&self) -> ReferenceTime {
        self.inner.lock().time_at(perf_counter())
    }

    /// 设置位置
    pub fn set_time(&self, time: ReferenceTime) {
        let mut inner = self.inner.lock();
        inner.base_time = time;
        inner.base_perf = perf_counter();
        inner.paused_at = time;
    }

    /// 开始走时
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ClockState::Running {
            inner.base_time = inner.paused_at;
            inner.base_perf = perf_counter();
            inner.state = ClockState::Running;
        }
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ClockState::Running {
            inner.paused_at = inner.time_at(perf_counter());
            inner.state = ClockState::Paused;
        }
    }

    /// 停止并回到 0
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.state = ClockState::Stopped;
        inner.paused_at = 0;
        inner.base_time = 0;
    }

    pub fn set_rate(&self, rate: f64) {
        let mut inner = self.inner.lock();
        if inner.state == ClockState::Running {
            let now = perf_counter();
            inner.base_time = inner.time_at(now);
            inner.base_perf = now;
        }
        inner.rate = rate;
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().state == ClockState::Running
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceClock for SystemClock {
    fn correlated_time(&self) -> (i64, ReferenceTime) {
        let inner = self.inner.lock();
        let perf = perf_counter();
        (inner.time_at(perf), perf)
    }

    fn state(&self) -> ClockState {
        self.inner.lock().state
    }
}
