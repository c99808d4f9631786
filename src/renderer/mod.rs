// 呈现调度模块

pub mod backend;     // 上游 / 绘制后端 / 光栅接口
pub mod events;
pub mod frame_rate;  // 帧率锁定与时间戳修正
pub mod moderator;   // 参考时钟平滑
pub mod presenter;
pub mod sample_pool;
pub mod scheduler;   // 丢弃 / 绘制 / 等待决策
pub mod sync_stats;
pub mod vsync;

pub use backend::{DecodedFrame, DisplayRaster, FrameSource, PresentBackend, SimulatedRaster};
pub use events::{EventSink, PresenterEvent, QueueEventSink};
pub use presenter::{ClockStateSink, MediaFormat, Presenter, PresenterControl, PresenterMessage};
