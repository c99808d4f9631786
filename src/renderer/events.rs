use crate::core::ReferenceTime;
use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};

/// 呈现器向宿主发出的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenterEvent {
    /// 落后时钟超过 1 秒且队列为空
    Starvation,
    StreamSizeChanged { width: u32, height: u32 },
    /// 流结束后最后一块表面已归还
    PlaybackComplete,
    /// 从上游取一帧耗时（100ns）
    ProcessingLatency(ReferenceTime),
    StepComplete { cancelled: bool },
    DisplayChanged,
}

/// 事件接收端（由宿主实现，可跨线程调用）
pub trait EventSink: Send + Sync {
    fn notify(&self, event: PresenterEvent);
}

/// 无锁队列实现，宿主按需取走
#[derive(Default)]
pub struct QueueEventSink {
    queue: SegQueue<PresenterEvent>,
}

impl QueueEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<PresenterEvent> {
        let mut events = Vec::with_capacity(self.queue.len());
        while let Some(event) = self.queue.pop() {
            events.push(event);
        }
        events
    }
}

impl EventSink for QueueEventSink {
    fn notify(&self, event: PresenterEvent) {
        self.queue.push(event);
    }
}
