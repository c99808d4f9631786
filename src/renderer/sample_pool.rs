//! 表面池：空闲队列 + 已调度队列
//!
//! 所有表面都以 `SurfaceIndex` 标识，任一时刻只处于空闲、已调度、使用中三者之一。

use crate::core::{PresenterError, Result, Sample};
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Default)]
struct PoolInner {
    free: VecDeque<Sample>,
    scheduled: VecDeque<Sample>,
    /// 已取出、尚未归还的表面数
    in_use: usize,
    /// 收到流结束，等所有表面归还后发出完成
    pending_complete: bool,
    /// 每次 reinit 加一
    generation: u32,
}

impl PoolInner {
    fn is_stale(&self, sample: &Sample) -> bool {
        sample.generation != self.generation
    }

    /// 归还一个表面，返回是否应当发出播放完成
    fn release(&mut self, sample: Sample, back: bool) -> bool {
        if self.is_stale(&sample) {
            debug!("丢弃旧表面池的样本: surface {} gen {}", sample.surface, sample.generation);
            return false;
        }
        self.in_use = self.in_use.saturating_sub(1);
        let complete = self.pending_complete && self.in_use == 0;
        if complete {
            self.pending_complete = false;
        }
        if back {
            self.free.push_back(sample);
        } else {
            self.free.push_front(sample);
        }
        complete
    }
}

#[derive(Default)]
pub struct SamplePool {
    inner: Mutex<PoolInner>,
}

impl SamplePool {
    pub fn new(count: usize) -> Self {
        let pool = Self::default();
        pool.reinit(count);
        pool
    }

    /// 丢弃全部样本，重新分配 `count` 块表面
    ///
    /// 此前取出、尚未归还的样本随之作废，之后的归还 / 调度会被忽略。
    pub fn reinit(&self, count: usize) {
        let mut inner = self.inner.lock();
        inner.generation = inner.generation.wrapping_add(1);
        let generation = inner.generation;
        inner.scheduled.clear();
        inner.free = (0..count)
            .map(|surface| Sample {
                generation,
                ..Sample::new(surface)
            })
            .collect();
        inner.in_use = 0;
    }

    /// 取一块空闲表面（最后一块可能正在显示，不会交出）
    pub fn acquire_free(&self) -> Result<Sample> {
        let mut inner = self.inner.lock();
        if inner.free.len() > 1 {
            inner.in_use += 1;
            inner.free.pop_front().ok_or(PresenterError::SampleAllocatorEmpty)
        } else {
            Err(PresenterError::SampleAllocatorEmpty)
        }
    }

    /// 归还表面，返回是否应当发出播放完成
    pub fn release(&self, sample: Sample, back: bool) -> bool {
        self.inner.lock().release(sample, back)
    }

    /// 追加到调度队列尾部
    pub fn schedule(&self, sample: Sample) {
        let mut inner = self.inner.lock();
        if !inner.is_stale(&sample) {
            inner.scheduled.push_back(sample);
        }
    }

    /// 放回调度队列头部（还没到呈现时间）
    pub fn requeue(&self, sample: Sample) {
        let mut inner = self.inner.lock();
        if !inner.is_stale(&sample) {
            inner.scheduled.push_front(sample);
        }
    }

    /// 取出队首样本及其后剩余的数量
    pub fn pop_scheduled(&self) -> Option<(Sample, usize)> {
        let mut inner = self.inner.lock();
        let sample = inner.scheduled.pop_front()?;
        Some((sample, inner.scheduled.len()))
    }

    /// 已调度样本全部归还空闲队列，返回是否应当发出播放完成
    pub fn flush(&self) -> bool {
        let mut inner = self.inner.lock();
        let mut complete = false;
        while let Some(sample) = inner.scheduled.pop_front() {
            complete |= inner.release(sample, true);
        }
        complete
    }

    /// 标记流结束；没有表面在外时返回 `true`（应立即发出播放完成）
    pub fn mark_end_of_stream(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.in_use == 0 {
            inner.pending_complete = false;
            true
        } else {
            inner.pending_complete = true;
            false
        }
    }

    pub fn scheduled_len(&self) -> usize {
        self.inner.lock().scheduled.len()
    }

    pub fn free_len(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_last_free_surface_is_kept() {
        let pool = SamplePool::new(3);
        assert!(pool.acquire_free().is_ok());
        assert!(pool.acquire_free().is_ok());
        assert!(matches!(pool.acquire_free(), Err(PresenterError::SampleAllocatorEmpty)));
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn test_schedule_order_and_requeue() {
        let pool = SamplePool::new(4);
        let a = pool.acquire_free().unwrap();
        let b = pool.acquire_free().unwrap();
        pool.schedule(a);
        pool.schedule(b);
        let (first, left) = pool.pop_scheduled().unwrap();
        assert_eq!(first.surface, a.surface);
        assert_eq!(left, 1);
        pool.requeue(first);
        assert_eq!(pool.pop_scheduled().unwrap().0.surface, a.surface);
    }

    #[test]
    fn test_pending_complete_fires_when_all_returned() {
        let pool = SamplePool::new(4);
        let a = pool.acquire_free().unwrap();
        let b = pool.acquire_free().unwrap();
        pool.schedule(b);
        assert!(!pool.mark_end_of_stream());
        assert!(!pool.release(a, true));
        assert!(pool.flush());
        assert_eq!(pool.free_len(), 4);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_reinit_discards_outstanding_samples() {
        let pool = SamplePool::new(5);
        let held = pool.acquire_free().unwrap();
        let queued = pool.acquire_free().unwrap();
        pool.schedule(queued);
        let (popped, _) = pool.pop_scheduled().unwrap();

        pool.reinit(5);
        assert!(!pool.release(popped, true));
        pool.requeue(held);
        pool.schedule(held);
        assert_eq!(pool.free_len(), 5);
        assert_eq!(pool.scheduled_len(), 0);
        assert_eq!(pool.in_use(), 0);

        // 新一代样本照常流转
        let fresh = pool.acquire_free().unwrap();
        assert_ne!(fresh.generation, held.generation);
        pool.schedule(fresh);
        assert_eq!(pool.scheduled_len(), 1);
        assert!(!pool.release(pool.pop_scheduled().unwrap().0, true));
        assert_eq!(pool.free_len(), 5);
    }

    #[test]
    fn test_flush_is_atomic_under_concurrent_enqueue() {
        const SURFACES: usize = 8;
        let pool = Arc::new(SamplePool::new(SURFACES));
        let stop = Arc::new(AtomicBool::new(false));

        let producer = {
            let pool = pool.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Ok(sample) = pool.acquire_free() {
                        pool.schedule(sample);
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        for _ in 0..200 {
            pool.flush();
            let inner = pool.inner.lock();
            assert_eq!(inner.free.len() + inner.in_use, SURFACES);
            assert!(inner.scheduled.len() <= inner.in_use);
        }
        stop.store(true, Ordering::Relaxed);
        producer.join().unwrap();

        pool.flush();
        assert_eq!(pool.scheduled_len(), 0);
        assert_eq!(pool.free_len(), SURFACES);
        assert_eq!(pool.in_use(), 0);
    }
}
