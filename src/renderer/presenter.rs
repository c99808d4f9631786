use crate::core::{
    perf_counter, Fraction, PresenterError, PresenterSettings, QualityStats, ReferenceClock, ReferenceTime,
    RenderState, ReportedState, Result, Sample, UNITS,
};
use crate::renderer::backend::{DecodedFrame, DisplayRaster, FrameSource, PresentBackend};
use crate::renderer::events::{EventSink, PresenterEvent};
use crate::renderer::frame_rate::FrameRateDetector;
use crate::renderer::moderator::ClockModerator;
use crate::renderer::sample_pool::SamplePool;
use crate::renderer::scheduler::{decide, Decision, FrameSlot, Margins};
use crate::renderer::sync_stats::QualityCounters;
use crate::renderer::vsync::{RefreshDetector, RefreshEstimate, VSyncModeSelector};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 混合器 / vsync 线程的轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(1);
/// 落后超过 1 秒视为饥饿
const STARVATION_THRESHOLD: ReferenceTime = UNITS;
/// 等待光栅到达某条扫描线的最长时间
const RASTER_WAIT: Duration = Duration::from_millis(100);
/// 光栅落在目标行之后这么多行以内都算到达
const RASTER_WINDOW: u32 = 5;

/// 参考时钟的状态通知
pub trait ClockStateSink {
    fn on_clock_start(&self, system_time: ReferenceTime, start_offset: ReferenceTime) -> Result<()>;
    fn on_clock_stop(&self, system_time: ReferenceTime) -> Result<()>;
    fn on_clock_pause(&self, system_time: ReferenceTime) -> Result<()>;
    fn on_clock_restart(&self, system_time: ReferenceTime) -> Result<()>;

    fn on_clock_set_rate(&self, _system_time: ReferenceTime, _rate: f32) -> Result<()> {
        Err(PresenterError::NotImplemented("on_clock_set_rate"))
    }
}

/// 宿主发给呈现器的消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterMessage {
    /// 停止 → 暂停，清零统计
    BeginStreaming,
    EndStreaming,
    /// 所有输入结束，最后一块表面归还后发出播放完成
    EndOfStream,
    /// 丢弃所有待呈现样本（同步完成）
    Flush,
    /// 逐帧前进 N 帧；负数表示丢弃下一帧
    Step(i32),
    CancelStep,
    ProcessInputNotify,
}

/// 呈现器控制接口
pub trait PresenterControl {
    fn process_message(&self, message: PresenterMessage) -> Result<()>;
    fn set_vsync_internal(&self, enabled: bool);
    fn set_frame_time_correction(&self, enabled: bool);
    fn quality_stats(&self) -> QualityStats;
    fn reported_state(&self) -> Result<ReportedState>;
}

/// 协商后的视频格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Fraction,
}

/// 渲染线程命令
enum RenderCommand {
    Flush(Sender<()>),
    Quit,
}

/// 与呈现时机相关的状态（同一把锁）
struct Timing {
    detector: FrameRateDetector,
    moderator: ClockModerator,
    vsync_mode: VSyncModeSelector,
    starving: bool,
    /// 饥饿期间冻结的时钟值
    starvation_clock: ReferenceTime,
    last_sample_offset: Option<ReferenceTime>,
    step_count: i32,
}

/// 渲染循环的局部状态
struct RenderLoop {
    force_paint: bool,
    next_sleep: i64,
}

impl RenderLoop {
    fn new() -> Self {
        Self {
            force_paint: true,
            next_sleep: 1,
        }
    }

    fn timeout(&self) -> Duration {
        let ms = if self.next_sleep < 0 { 1 } else { self.next_sleep };
        Duration::from_millis(ms as u64)
    }

    /// 醒来后：长睡眠只用一次，0 之后回到 1ms 轮询
    fn after_wake(&mut self) {
        if self.next_sleep > 1 {
            self.next_sleep = 0;
        } else if self.next_sleep == 0 {
            self.next_sleep = -1;
        }
    }
}

struct Shared {
    settings: PresenterSettings,
    vsync_internal: AtomicBool,
    frame_time_correction: AtomicBool,
    state: Mutex<RenderState>,
    pool: SamplePool,
    timing: Mutex<Timing>,
    refresh: Mutex<RefreshDetector>,
    quality: Mutex<QualityCounters>,
    media: Mutex<Option<MediaFormat>>,
    nominal_time_per_frame: AtomicI64,
    stream_changed: AtomicBool,
    display_changed: AtomicBool,
    quit: AtomicBool,
    clock: Arc<dyn ReferenceClock>,
    backend: Arc<dyn PresentBackend>,
    sink: Arc<dyn EventSink>,
    raster: Option<Arc<dyn DisplayRaster>>,
}

impl Shared {
    fn nominal(&self) -> ReferenceTime {
        self.nominal_time_per_frame.load(Ordering::Relaxed)
    }

    fn state(&self) -> RenderState {
        *self.state.lock()
    }

    fn nominal_refresh_rate(&self) -> f64 {
        self.raster
            .as_ref()
            .map_or(self.settings.display_refresh_rate, |r| r.refresh_rate())
    }

    fn refresh_estimate(&self) -> RefreshEstimate {
        let height = self.raster.as_ref().map_or(self.settings.display_height, |r| r.height());
        self.refresh.lock().estimate(self.nominal_refresh_rate(), height)
    }

    /// 饥饿期间时钟冻结在进入饥饿时的值
    fn moderated_clock(&self, timing: &mut Timing, perf: ReferenceTime) -> ReferenceTime {
        if timing.starving {
            return timing.starvation_clock;
        }
        let now = timing.moderator.clock_time(&*self.clock, perf);
        timing.starvation_clock = now;
        now
    }

    fn complete_step(timing: &mut Timing, cancel: bool) -> Option<PresenterEvent> {
        if timing.step_count <= 0 {
            return None;
        }
        if cancel || timing.step_count == 1 {
            timing.step_count = 0;
            Some(PresenterEvent::StepComplete { cancelled: cancel })
        } else {
            timing.step_count -= 1;
            None
        }
    }

    fn release(&self, sample: Sample, back: bool) {
        if self.pool.release(sample, back) {
            info!("{} 🏁 最后一块表面已归还，播放完成", log_ctx());
            self.sink.notify(PresenterEvent::PlaybackComplete);
        }
    }

    /// 重新打时间戳后放入调度队列
    fn schedule(&self, mut sample: Sample) {
        if let Some(time) = sample.time {
            let correction = self.frame_time_correction.load(Ordering::Relaxed);
            let retimed = {
                let mut timing = self.timing.lock();
                let retimed = timing.detector.on_sample(time, self.nominal(), correction);
                if retimed.seek {
                    timing.starving = false;
                }
                retimed
            };
            if retimed.seek {
                debug!("{} ⏩ 检测到时间跳变（seek），帧率锁定已重置", log_ctx());
            }
            sample.time = Some(retimed.time);
            if let Some(duration) = retimed.duration {
                sample.duration = duration;
            }
        }
        self.pool.schedule(sample);
    }

    /// 从上游拉取帧直到没有空闲表面或上游暂无数据
    fn pull_from_source(&self, source: &mut dyn FrameSource) -> bool {
        let mut done_something = false;
        while let Ok(mut sample) = self.pool.acquire_free() {
            let before = perf_counter();
            let frame = source.produce(sample.surface);
            let after = perf_counter();

            let Some(frame) = frame else {
                self.release(sample, false);
                break;
            };
            self.sink.notify(PresenterEvent::ProcessingLatency(after - before));

            sample.time = frame.time;
            sample.duration = frame.duration;
            self.schedule(sample);
            done_something = true;

            if self.nominal() == 0 {
                break;
            }
        }
        done_something
    }

    fn flush_samples(&self) {
        if self.pool.flush() {
            self.sink.notify(PresenterEvent::PlaybackComplete);
        }
        let mut timing = self.timing.lock();
        timing.last_sample_offset = None;
        timing.starving = false;
        timing.vsync_mode.reset();
    }

    fn check_starvation(&self) {
        let mut timing = self.timing.lock();
        let behind = matches!(timing.last_sample_offset, Some(offset) if offset < -STARVATION_THRESHOLD);
        if behind && !timing.starving && self.state() == RenderState::Started {
            timing.starving = true;
            drop(timing);
            warn!("{} ⚠ 呈现饥饿：落后时钟超过 1 秒且队列为空", log_ctx());
            self.sink.notify(PresenterEvent::Starvation);
        }
    }

    /// 每次绘制后更新同步偏移统计
    fn record_paint(&self, sample: &Sample, perf: ReferenceTime) {
        self.quality.lock().record_paint(perf);
        if sample.duration < 0 || self.nominal() == 0 {
            return;
        }
        let clock_time = {
            let mut timing = self.timing.lock();
            self.moderated_clock(&mut timing, perf)
        };
        let sample_time = sample.time.unwrap_or(clock_time);
        self.quality.lock().sync_offsets.push(sample_time - clock_time);
    }

    /// 渲染线程的一次调度
    fn render_tick(&self, lp: &mut RenderLoop) {
        let Some((sample, samples_left)) = self.pool.pop_scheduled() else {
            self.check_starvation();
            return;
        };

        let state = self.state();
        let perf = perf_counter();
        let force_paint_now = matches!(sample.time, None | Some(0));
        let mut step_forward = false;
        let mut paint = false;
        let mut drawn = false;
        let mut dropped = false;
        let mut events = Vec::new();

        {
            let mut timing = self.timing.lock();
            if timing.step_count < 0 {
                dropped = true;
                step_forward = true;
                timing.step_count = 0;
            } else if state == RenderState::Started {
                let clock_time = self.moderated_clock(&mut timing, perf);
                if force_paint_now {
                    step_forward = true;
                    paint = true;
                } else {
                    let time = sample.time.unwrap_or(clock_time);
                    let locked = timing.detector.is_locked();
                    let mut time_per_frame =
                        (timing.detector.frame_time(self.nominal()) * UNITS as f64) as ReferenceTime;

                    let vsync_internal = self.vsync_internal.load(Ordering::Relaxed);
                    let (sync_offset, time_to_next_vsync, mut vsync_time) = if vsync_internal {
                        let estimate = self.refresh_estimate();
                        let target = self.raster.as_ref().map_or(0, |r| r.vblank_line()) as f64;
                        let until = estimate.time_until_line(target, perf) * UNITS as f64;
                        let clock_at_vsync = clock_time + (until * timing.moderator.speed()) as ReferenceTime;
                        (time - clock_at_vsync, Some(until as ReferenceTime), estimate.vsync_time())
                    } else {
                        (time - clock_time, None, 0)
                    };

                    if sample.duration > 1 && !locked {
                        time_per_frame = sample.duration;
                    }
                    let margins = Margins::new(
                        time_per_frame,
                        timing.detector.frame_time_std_dev(),
                        timing.detector.correction_active(),
                        timing.vsync_mode.mode(),
                    );
                    if locked && time_per_frame < vsync_time {
                        vsync_time = time_per_frame;
                    }
                    timing.last_sample_offset = Some(sync_offset);

                    let slot = FrameSlot {
                        sync_offset,
                        time_per_frame,
                        margins,
                        time_to_next_vsync,
                        samples_left,
                    };
                    match decide(&slot) {
                        Decision::Drop => {
                            debug!("{} 🗑 丢帧: 同步偏移 {}", log_ctx(), sync_offset);
                            dropped = true;
                            step_forward = true;
                            lp.next_sleep = 0;
                        }
                        Decision::Paint => {
                            if vsync_internal {
                                timing.vsync_mode.update(-sync_offset, margins.margin, vsync_time);
                            }
                            events.extend(Self::complete_step(&mut timing, false));
                            step_forward = true;
                            paint = true;
                            drawn = true;
                            lp.next_sleep = 0;
                        }
                        Decision::Wait(ms) => {
                            lp.next_sleep = ms as i64;
                        }
                    }
                }
            } else if state == RenderState::Paused {
                if lp.force_paint {
                    step_forward = true;
                    paint = true;
                }
                lp.next_sleep = sample.duration / 10_000 - 2;
            }
        }

        if paint {
            if let Err(e) = self.backend.paint(sample.surface, sample.time) {
                error!("{} ❌ 绘制表面 {} 失败: {}", log_ctx(), sample.surface, e);
            }
            self.record_paint(&sample, perf);
        }
        {
            let mut quality = self.quality.lock();
            if dropped {
                quality.frames_dropped += 1;
            }
            if drawn {
                quality.frames_drawn += 1;
            }
        }

        if step_forward {
            self.release(sample, true);
        } else {
            self.pool.requeue(sample);
        }
        lp.force_paint = false;

        for event in events {
            self.sink.notify(event);
        }
    }

    /// 等待光栅进入 `[line, line + RASTER_WINDOW)`，返回到达时的 perf 计数
    fn wait_for_line(&self, raster: &dyn DisplayRaster, line: u32) -> Option<ReferenceTime> {
        let deadline = Instant::now() + RASTER_WAIT;
        loop {
            if self.quit.load(Ordering::Relaxed) || Instant::now() >= deadline {
                return None;
            }
            if let Some(current) = raster.scan_line() {
                if current >= line && current < line + RASTER_WINDOW {
                    return Some(perf_counter());
                }
            }
            thread::yield_now();
        }
    }

    /// 三点测量：起始行 → 半屏 → 一整帧后回到起始行
    fn measure_refresh(&self, raster: &dyn DisplayRaster) -> Option<([u32; 3], [ReferenceTime; 3])> {
        let height = raster.height() as i64;
        if height == 0 {
            return None;
        }
        let wait_range = (height / 40).max(5);
        let min_range = ((0.003 * height as f64 * raster.refresh_rate() + 0.5) as i64).clamp(5, (height / 3).max(5));
        let vsync_pos = (raster.vblank_line() as i64 + min_range + wait_range).rem_euclid(height);
        let line = (vsync_pos + 1).rem_euclid(height) as u32;
        let middle = (line as i64 + height / 2).rem_euclid(height) as u32;

        let t_start = self.wait_for_line(raster, line)?;
        let t_middle = self.wait_for_line(raster, middle)?;
        let t_end = self.wait_for_line(raster, line)?;
        Some(([line, middle, line], [t_start, t_middle, t_end]))
    }
}

/// 基于垂直同步的呈现器
///
/// 三个工作线程：
/// - 混合器线程：每 1ms 从上游拉帧放入空闲表面
/// - 渲染线程：按时钟决定丢弃 / 绘制 / 等待
/// - vsync 线程：测量刷新率和扫描线时长
pub struct Presenter {
    shared: Arc<Shared>,
    command_tx: Sender<RenderCommand>,
    command_rx: Receiver<RenderCommand>,
    render_thread: Option<JoinHandle<()>>,
    mixer_thread: Option<JoinHandle<()>>,
    vsync_thread: Option<JoinHandle<()>>,
}

impl Presenter {
    pub fn new(
        settings: PresenterSettings,
        clock: Arc<dyn ReferenceClock>,
        backend: Arc<dyn PresentBackend>,
        sink: Arc<dyn EventSink>,
        raster: Option<Arc<dyn DisplayRaster>>,
    ) -> Self {
        let (command_tx, command_rx) = unbounded::<RenderCommand>();
        let shared = Shared {
            vsync_internal: AtomicBool::new(settings.vsync_internal),
            frame_time_correction: AtomicBool::new(settings.frame_time_correction),
            state: Mutex::new(RenderState::Stopped),
            pool: SamplePool::new(settings.surface_count),
            timing: Mutex::new(Timing {
                detector: FrameRateDetector::new(),
                moderator: ClockModerator::new(),
                vsync_mode: VSyncModeSelector::new(),
                starving: false,
                starvation_clock: 0,
                last_sample_offset: None,
                step_count: 0,
            }),
            refresh: Mutex::new(RefreshDetector::new()),
            quality: Mutex::new(QualityCounters::default()),
            media: Mutex::new(None),
            nominal_time_per_frame: AtomicI64::new(settings.nominal_time_per_frame),
            stream_changed: AtomicBool::new(true),
            display_changed: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            settings,
            clock,
            backend,
            sink,
            raster,
        };
        Self {
            shared: Arc::new(shared),
            command_tx,
            command_rx,
            render_thread: None,
            mixer_thread: None,
            vsync_thread: None,
        }
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.shared.state() == RenderState::Shutdown {
            Err(PresenterError::Shutdown)
        } else {
            Ok(())
        }
    }

    pub fn render_state(&self) -> RenderState {
        self.shared.state()
    }

    /// 启动混合器、渲染、vsync 三个线程
    pub fn start_worker_threads(&mut self, source: Box<dyn FrameSource>) -> Result<()> {
        self.check_shutdown()?;
        if self.render_thread.is_some() {
            return Ok(());
        }

        let shared = self.shared.clone();
        let commands = self.command_rx.clone();
        self.render_thread = Some(thread::spawn(move || Self::render_loop(shared, commands)));

        let shared = self.shared.clone();
        self.mixer_thread = Some(thread::spawn(move || Self::mixer_loop(shared, source)));

        let shared = self.shared.clone();
        self.vsync_thread = Some(thread::spawn(move || Self::vsync_loop(shared)));

        info!("{} 🚀 呈现器工作线程已启动", log_ctx());
        Ok(())
    }

    fn render_loop(shared: Arc<Shared>, commands: Receiver<RenderCommand>) {
        info!("{} 🎬 渲染线程启动", log_ctx());
        let mut lp = RenderLoop::new();

        loop {
            let command = commands.recv_timeout(lp.timeout());
            lp.after_wake();
            match command {
                Ok(RenderCommand::Quit) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(RenderCommand::Flush(ack)) => {
                    shared.flush_samples();
                    lp.force_paint = true;
                    let _ = ack.send(());
                    debug!("{} 🧹 刷新完成", log_ctx());
                }
                Err(RecvTimeoutError::Timeout) => shared.render_tick(&mut lp),
            }
            if shared.quit.load(Ordering::Relaxed) {
                break;
            }
        }

        info!("{} 🛑 渲染线程退出", log_ctx());
    }

    fn mixer_loop(shared: Arc<Shared>, mut source: Box<dyn FrameSource>) {
        info!("{} 🎞 混合器线程启动", log_ctx());
        let mut pulled: usize = 0;

        while !shared.quit.load(Ordering::Relaxed) {
            thread::sleep(POLL_INTERVAL);
            if shared.state() == RenderState::Stopped {
                continue;
            }
            if shared.pull_from_source(&mut *source) {
                pulled += 1;
            }
        }

        info!("{} 🛑 混合器线程退出（{} 次取到新帧）", log_ctx(), pulled);
    }

    fn vsync_loop(shared: Arc<Shared>) {
        info!("{} 📺 vsync 线程启动", log_ctx());

        while !shared.quit.load(Ordering::Relaxed) {
            thread::sleep(POLL_INTERVAL);
            if shared.display_changed.swap(false, Ordering::Relaxed) {
                shared.refresh.lock().reset();
            }
            let Some(raster) = shared.raster.as_deref() else {
                continue;
            };
            if !shared.vsync_internal.load(Ordering::Relaxed) || shared.state() != RenderState::Started {
                continue;
            }
            if let Some((lines, times)) = shared.measure_refresh(raster) {
                shared.refresh.lock().measure(lines, times);
            }
        }

        info!("{} 🛑 vsync 线程退出", log_ctx());
    }

    /// 停止工作线程并进入终态，之后所有操作都返回 `Shutdown`
    pub fn shutdown(&mut self) {
        if self.shared.state() == RenderState::Shutdown {
            return;
        }
        info!("{} 🛑 Presenter::shutdown() called", log_ctx());
        self.shared.quit.store(true, Ordering::Relaxed);
        let _ = self.command_tx.send(RenderCommand::Quit);

        let grace = Duration::from_millis(self.shared.settings.grace_period_ms);
        for (name, handle) in [
            ("渲染", self.render_thread.take()),
            ("混合器", self.mixer_thread.take()),
            ("vsync", self.vsync_thread.take()),
        ] {
            if let Some(handle) = handle {
                join_with_grace(name, handle, grace);
            }
        }

        *self.shared.state.lock() = RenderState::Shutdown;
    }

    /// 设置视频格式；尺寸变化或新流开始时重新分配表面池
    pub fn initialize_device(&self, format: MediaFormat) -> Result<()> {
        self.check_shutdown()?;

        let size_changed = {
            let mut media = self.shared.media.lock();
            let changed = media.map_or(true, |m| m.width != format.width || m.height != format.height);
            *media = Some(format);
            changed
        };

        if self.shared.settings.nominal_time_per_frame == 0 && format.frame_rate.is_valid() {
            let per_frame = UNITS * format.frame_rate.den as ReferenceTime / format.frame_rate.num as ReferenceTime;
            self.shared.nominal_time_per_frame.store(per_frame, Ordering::Relaxed);
        }

        let stream_changed = self.shared.stream_changed.swap(false, Ordering::Relaxed);
        if size_changed || stream_changed {
            let count = self.shared.settings.surface_count;
            self.shared.pool.reinit(count);
            self.shared.backend.surfaces_reallocated(count, format.width, format.height);
            info!("{} 🖼 表面池重新分配: {} x {}x{}", log_ctx(), count, format.width, format.height);
            self.shared.sink.notify(PresenterEvent::StreamSizeChanged {
                width: format.width,
                height: format.height,
            });
        }
        Ok(())
    }

    /// 上游直接交付一帧（不经混合器线程）
    pub fn deliver(&self, frame: DecodedFrame) -> Result<()> {
        self.check_shutdown()?;
        let mut sample = self.shared.pool.acquire_free()?;
        sample.time = frame.time;
        sample.duration = frame.duration;
        self.shared.schedule(sample);
        Ok(())
    }

    /// 同步刷新：返回时所有已调度样本都已归还
    pub fn flush(&self) -> Result<()> {
        self.check_shutdown()?;
        if self.render_thread.is_none() {
            self.shared.flush_samples();
            return Ok(());
        }

        let (ack_tx, ack_rx) = bounded(1);
        self.command_tx
            .send(RenderCommand::Flush(ack_tx))
            .map_err(|e| PresenterError::Backend(format!("发送刷新命令失败: {}", e)))?;
        let grace = Duration::from_millis(self.shared.settings.grace_period_ms);
        if ack_rx.recv_timeout(grace).is_err() {
            warn!("{} ⚠ 渲染线程未确认刷新，直接在调用线程刷新", log_ctx());
            self.shared.flush_samples();
        }
        Ok(())
    }

    /// 显示模式变化，重新测量刷新率
    pub fn display_changed(&self) {
        self.shared.display_changed.store(true, Ordering::Relaxed);
        self.shared.sink.notify(PresenterEvent::DisplayChanged);
    }

    /// 当前测得（或标称）的刷新率
    pub fn refresh_rate(&self) -> f64 {
        1.0 / self.shared.refresh_estimate().refresh_time
    }

    /// 不抽帧时的最大速率 = 刷新率 / 帧率
    fn max_rate(&self, thin: bool) -> f32 {
        if thin {
            return f32::MAX;
        }
        let Some(format) = *self.shared.media.lock() else {
            return f32::MAX;
        };
        let refresh = self.shared.nominal_refresh_rate().round() as u64;
        if !format.frame_rate.is_valid() || refresh == 0 {
            return f32::MAX;
        }
        let (num, den) = (format.frame_rate.num as u64, format.frame_rate.den as u64);
        ((refresh * den + num / 2) / num) as f32
    }

    pub fn slowest_rate(&self) -> Result<f32> {
        self.check_shutdown()?;
        Ok(0.0)
    }

    pub fn fastest_rate(&self, reverse: bool, thin: bool) -> Result<f32> {
        self.check_shutdown()?;
        let max = self.max_rate(thin);
        Ok(if reverse { -max } else { max })
    }

    /// 支持时返回 `rate` 本身，否则返回最接近的支持速率
    pub fn is_rate_supported(&self, thin: bool, rate: f32) -> Result<f32> {
        self.check_shutdown()?;
        let max = self.max_rate(thin);
        if rate.abs() > max {
            let nearest = if rate < 0.0 { -max } else { max };
            return Err(PresenterError::UnsupportedRate { nearest });
        }
        Ok(rate)
    }

    fn set_state(&self, state: RenderState) -> Result<()> {
        self.check_shutdown()?;
        *self.shared.state.lock() = state;
        self.shared.timing.lock().moderator.reset();
        Ok(())
    }
}

impl ClockStateSink for Presenter {
    fn on_clock_start(&self, system_time: ReferenceTime, start_offset: ReferenceTime) -> Result<()> {
        debug!("{} ▶ 时钟启动 system={} offset={}", log_ctx(), system_time, start_offset);
        self.set_state(RenderState::Started)
    }

    fn on_clock_stop(&self, system_time: ReferenceTime) -> Result<()> {
        debug!("{} ⏹ 时钟停止 system={}", log_ctx(), system_time);
        self.set_state(RenderState::Stopped)
    }

    fn on_clock_pause(&self, system_time: ReferenceTime) -> Result<()> {
        debug!("{} ⏸ 时钟暂停 system={}", log_ctx(), system_time);
        self.check_shutdown()?;
        let mut timing = self.shared.timing.lock();
        if !timing.starving {
            *self.shared.state.lock() = RenderState::Paused;
        }
        timing.moderator.reset();
        Ok(())
    }

    fn on_clock_restart(&self, system_time: ReferenceTime) -> Result<()> {
        debug!("{} ▶ 时钟恢复 system={}", log_ctx(), system_time);
        self.set_state(RenderState::Started)
    }
}

impl PresenterControl for Presenter {
    fn process_message(&self, message: PresenterMessage) -> Result<()> {
        self.check_shutdown()?;
        match message {
            PresenterMessage::BeginStreaming => {
                info!("{} 🎬 开始推流", log_ctx());
                *self.shared.state.lock() = RenderState::Paused;
                self.shared.quality.lock().reset();
                self.shared.stream_changed.store(true, Ordering::Relaxed);
            }
            PresenterMessage::EndStreaming => {
                info!("{} 🛑 结束推流", log_ctx());
            }
            PresenterMessage::EndOfStream => {
                info!("{} 📄 输入流结束", log_ctx());
                self.shared.stream_changed.store(true, Ordering::Relaxed);
                if self.shared.pool.mark_end_of_stream() {
                    self.shared.sink.notify(PresenterEvent::PlaybackComplete);
                }
            }
            PresenterMessage::Flush => self.flush()?,
            PresenterMessage::Step(count) => {
                self.shared.timing.lock().step_count = count;
            }
            PresenterMessage::CancelStep => {
                let event = Shared::complete_step(&mut self.shared.timing.lock(), true);
                if let Some(event) = event {
                    self.shared.sink.notify(event);
                }
            }
            PresenterMessage::ProcessInputNotify => {}
        }
        Ok(())
    }

    fn set_vsync_internal(&self, enabled: bool) {
        self.shared.vsync_internal.store(enabled, Ordering::Relaxed);
    }

    fn set_frame_time_correction(&self, enabled: bool) {
        self.shared.frame_time_correction.store(enabled, Ordering::Relaxed);
    }

    fn quality_stats(&self) -> QualityStats {
        self.shared.quality.lock().snapshot()
    }

    /// 饥饿期间，队列补足且偏移回到两帧以内之前一直报告中间态
    fn reported_state(&self) -> Result<ReportedState> {
        self.check_shutdown()?;
        {
            let mut timing = self.shared.timing.lock();
            if timing.starving {
                let needed = (self.shared.settings.surface_count / 2).max(1);
                let nominal = self.shared.nominal();
                let behind = matches!(timing.last_sample_offset, Some(offset) if offset < -nominal * 2);
                if self.shared.pool.scheduled_len() < needed || behind {
                    return Ok(ReportedState::PausedIntermediate);
                }
                timing.starving = false;
            }
        }
        Ok(match self.shared.state() {
            RenderState::Started => ReportedState::Running,
            RenderState::Paused => ReportedState::Paused,
            RenderState::Stopped | RenderState::Shutdown => ReportedState::Stopped,
        })
    }
}

impl Drop for Presenter {
    fn drop(&mut self) {
        if self.shared.state() != RenderState::Shutdown {
            if self.render_thread.is_some() {
                warn!("{} ⚠ Presenter 被 drop，但未调用 shutdown()，正在尝试优雅停止", log_ctx());
            }
            self.shutdown();
        }
    }
}

/// 在宽限期内等待线程退出；超时只记录错误，不强杀
fn join_with_grace(name: &str, handle: JoinHandle<()>, grace: Duration) {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            error!("{} ❌ {}线程未在 {:?} 内退出，放弃等待", log_ctx(), name, grace);
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
    if handle.join().is_err() {
        error!("{} ❌ {}线程异常退出", log_ctx(), name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ClockState, SurfaceIndex};
    use crate::renderer::backend::SimulatedRaster;
    use crate::renderer::events::QueueEventSink;

    const FRAME: ReferenceTime = 400_000;

    struct ManualClock {
        time: Mutex<ReferenceTime>,
    }

    impl ManualClock {
        fn at(time: ReferenceTime) -> Arc<Self> {
            Arc::new(Self { time: Mutex::new(time) })
        }

        fn set(&self, time: ReferenceTime) {
            *self.time.lock() = time;
        }
    }

    impl ReferenceClock for ManualClock {
        fn correlated_time(&self) -> (i64, ReferenceTime) {
            (*self.time.lock(), perf_counter())
        }

        fn state(&self) -> ClockState {
            ClockState::Running
        }
    }

    #[derive(Default)]
    struct RecordingBackend {
        painted: Mutex<Vec<(SurfaceIndex, Option<ReferenceTime>)>>,
        reallocations: Mutex<Vec<(usize, u32, u32)>>,
    }

    impl PresentBackend for RecordingBackend {
        fn paint(&self, surface: SurfaceIndex, time: Option<ReferenceTime>) -> Result<()> {
            self.painted.lock().push((surface, time));
            Ok(())
        }

        fn surfaces_reallocated(&self, count: usize, width: u32, height: u32) {
            self.reallocations.lock().push((count, width, height));
        }
    }

    struct Fixture {
        presenter: Presenter,
        backend: Arc<RecordingBackend>,
        sink: Arc<QueueEventSink>,
    }

    fn fixture_with(settings: PresenterSettings, clock: Arc<dyn ReferenceClock>) -> Fixture {
        let backend = Arc::new(RecordingBackend::default());
        let sink = Arc::new(QueueEventSink::new());
        let presenter = Presenter::new(settings, clock, backend.clone(), sink.clone(), None);
        Fixture {
            presenter,
            backend,
            sink,
        }
    }

    fn fixture(clock_time: ReferenceTime) -> Fixture {
        let settings = PresenterSettings {
            nominal_time_per_frame: FRAME,
            frame_time_correction: false,
            ..Default::default()
        };
        fixture_with(settings, ManualClock::at(clock_time))
    }

    fn frame(time: ReferenceTime) -> DecodedFrame {
        DecodedFrame {
            time: Some(time),
            duration: FRAME,
        }
    }

    fn tick(f: &Fixture, lp: &mut RenderLoop) {
        f.presenter.shared.render_tick(lp);
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let mut f = fixture(0);
        f.presenter.shutdown();
        assert_eq!(f.presenter.render_state(), RenderState::Shutdown);
        assert!(matches!(f.presenter.deliver(frame(0)), Err(PresenterError::Shutdown)));
        assert!(matches!(f.presenter.on_clock_start(0, 0), Err(PresenterError::Shutdown)));
        assert!(matches!(
            f.presenter.process_message(PresenterMessage::Flush),
            Err(PresenterError::Shutdown)
        ));
        assert!(matches!(f.presenter.reported_state(), Err(PresenterError::Shutdown)));
        assert!(matches!(f.presenter.fastest_rate(false, false), Err(PresenterError::Shutdown)));
    }

    #[test]
    fn test_drop_paint_wait() {
        let clock = 10 * UNITS;
        let f = fixture(clock);
        f.presenter.on_clock_start(0, 0).unwrap();
        f.presenter.deliver(frame(clock - 2 * FRAME)).unwrap();
        f.presenter.deliver(frame(clock - 10_000)).unwrap();
        f.presenter.deliver(frame(clock + 4_000_000)).unwrap();

        let mut lp = RenderLoop::new();
        tick(&f, &mut lp);
        assert_eq!(f.presenter.quality_stats().frames_dropped, 1);
        assert!(f.backend.painted.lock().is_empty());

        tick(&f, &mut lp);
        assert_eq!(f.backend.painted.lock().as_slice(), &[(1, Some(clock - 10_000))]);
        assert_eq!(f.presenter.quality_stats().frames_drawn, 1);

        tick(&f, &mut lp);
        assert_eq!(lp.next_sleep, 1);
        assert_eq!(f.backend.painted.lock().len(), 1);
        assert_eq!(f.presenter.shared.pool.scheduled_len(), 1);
    }

    #[test]
    fn test_missing_or_zero_timestamp_paints_immediately() {
        let f = fixture(10 * UNITS);
        f.presenter.on_clock_start(0, 0).unwrap();
        f.presenter
            .deliver(DecodedFrame {
                time: None,
                duration: 0,
            })
            .unwrap();
        f.presenter.deliver(frame(0)).unwrap();

        let mut lp = RenderLoop::new();
        tick(&f, &mut lp);
        tick(&f, &mut lp);
        assert_eq!(f.backend.painted.lock().len(), 2);
        // 立即绘制不计入 frames_drawn
        assert_eq!(f.presenter.quality_stats().frames_drawn, 0);
    }

    #[test]
    fn test_paused_paints_once_when_forced() {
        let f = fixture(0);
        f.presenter.process_message(PresenterMessage::BeginStreaming).unwrap();
        assert_eq!(f.presenter.render_state(), RenderState::Paused);
        f.presenter.deliver(frame(5 * UNITS)).unwrap();
        f.presenter.deliver(frame(5 * UNITS + FRAME)).unwrap();

        let mut lp = RenderLoop::new();
        tick(&f, &mut lp);
        assert_eq!(f.backend.painted.lock().len(), 1);
        assert_eq!(lp.next_sleep, FRAME / 10_000 - 2);

        tick(&f, &mut lp);
        assert_eq!(f.backend.painted.lock().len(), 1);
        assert_eq!(f.presenter.shared.pool.scheduled_len(), 1);
    }

    #[test]
    fn test_starvation_reporting() {
        let clock = 10 * UNITS;
        let f = fixture(clock);
        f.presenter.on_clock_start(0, 0).unwrap();
        f.presenter.deliver(frame(clock - 2 * UNITS)).unwrap();

        let mut lp = RenderLoop::new();
        tick(&f, &mut lp);
        assert_eq!(f.backend.painted.lock().len(), 1);
        tick(&f, &mut lp);
        tick(&f, &mut lp);
        let starvations = f
            .sink
            .drain()
            .into_iter()
            .filter(|e| *e == PresenterEvent::Starvation)
            .count();
        assert_eq!(starvations, 1);

        assert_eq!(f.presenter.reported_state().unwrap(), ReportedState::PausedIntermediate);
        f.presenter.on_clock_pause(0).unwrap();
        assert_eq!(f.presenter.render_state(), RenderState::Started);

        f.presenter.flush().unwrap();
        assert_eq!(f.presenter.reported_state().unwrap(), ReportedState::Running);
    }

    #[test]
    fn test_end_of_stream_completion() {
        let clock = 10 * UNITS;
        let f = fixture(clock);
        f.presenter.process_message(PresenterMessage::EndOfStream).unwrap();
        assert_eq!(f.sink.drain(), vec![PresenterEvent::PlaybackComplete]);

        f.presenter.on_clock_start(0, 0).unwrap();
        f.presenter.deliver(frame(clock - 10_000)).unwrap();
        f.presenter.process_message(PresenterMessage::EndOfStream).unwrap();
        assert!(f.sink.drain().is_empty());

        tick(&f, &mut RenderLoop::new());
        assert_eq!(f.sink.drain(), vec![PresenterEvent::PlaybackComplete]);
    }

    #[test]
    fn test_step_and_cancel_step() {
        let clock = 10 * UNITS;
        let f = fixture(clock);
        f.presenter.on_clock_start(0, 0).unwrap();
        f.presenter.process_message(PresenterMessage::Step(2)).unwrap();
        f.presenter.deliver(frame(clock - 20_000)).unwrap();
        f.presenter.deliver(frame(clock - 10_000)).unwrap();

        let mut lp = RenderLoop::new();
        tick(&f, &mut lp);
        assert!(f.sink.drain().is_empty());
        tick(&f, &mut lp);
        assert_eq!(f.sink.drain(), vec![PresenterEvent::StepComplete { cancelled: false }]);

        f.presenter.process_message(PresenterMessage::Step(3)).unwrap();
        f.presenter.process_message(PresenterMessage::CancelStep).unwrap();
        assert_eq!(f.sink.drain(), vec![PresenterEvent::StepComplete { cancelled: true }]);
    }

    #[test]
    fn test_negative_step_drops_next_sample() {
        let clock = 10 * UNITS;
        let f = fixture(clock);
        f.presenter.on_clock_start(0, 0).unwrap();
        f.presenter.process_message(PresenterMessage::Step(-1)).unwrap();
        f.presenter.deliver(frame(clock - 10_000)).unwrap();
        tick(&f, &mut RenderLoop::new());
        assert!(f.backend.painted.lock().is_empty());
        assert_eq!(f.presenter.quality_stats().frames_dropped, 1);
    }

    #[test]
    fn test_rate_support() {
        let f = fixture(0);
        f.presenter
            .initialize_device(MediaFormat {
                width: 1920,
                height: 1080,
                frame_rate: Fraction::new(24000, 1001),
            })
            .unwrap();
        assert_eq!(f.presenter.fastest_rate(false, false).unwrap(), 3.0);
        assert_eq!(f.presenter.fastest_rate(true, false).unwrap(), -3.0);
        assert_eq!(f.presenter.fastest_rate(false, true).unwrap(), f32::MAX);
        assert_eq!(f.presenter.slowest_rate().unwrap(), 0.0);
        assert_eq!(f.presenter.is_rate_supported(false, 2.0).unwrap(), 2.0);
        assert!(matches!(
            f.presenter.is_rate_supported(false, -4.0),
            Err(PresenterError::UnsupportedRate { nearest }) if nearest == -3.0
        ));
        assert!(matches!(f.presenter.on_clock_set_rate(0, 2.0), Err(PresenterError::NotImplemented(_))));
    }

    #[test]
    fn test_initialize_device_reallocates_on_size_change() {
        let f = fixture(0);
        let hd = MediaFormat {
            width: 1920,
            height: 1080,
            frame_rate: Fraction::new(25, 1),
        };
        f.presenter.initialize_device(hd).unwrap();
        f.presenter.initialize_device(hd).unwrap();
        f.presenter
            .initialize_device(MediaFormat {
                width: 1280,
                height: 720,
                ..hd
            })
            .unwrap();
        assert_eq!(
            f.backend.reallocations.lock().as_slice(),
            &[(5, 1920, 1080), (5, 1280, 720)]
        );
        assert_eq!(
            f.sink.drain(),
            vec![
                PresenterEvent::StreamSizeChanged { width: 1920, height: 1080 },
                PresenterEvent::StreamSizeChanged { width: 1280, height: 720 },
            ]
        );
    }

    #[test]
    fn test_nominal_frame_time_from_media_format() {
        let f = fixture_with(PresenterSettings::default(), ManualClock::at(0));
        f.presenter
            .initialize_device(MediaFormat {
                width: 720,
                height: 576,
                frame_rate: Fraction::new(25, 1),
            })
            .unwrap();
        assert_eq!(f.presenter.shared.nominal(), FRAME);
    }

    struct ListSource {
        times: Vec<ReferenceTime>,
        next: usize,
    }

    impl FrameSource for ListSource {
        fn produce(&mut self, _surface: SurfaceIndex) -> Option<DecodedFrame> {
            let time = *self.times.get(self.next)?;
            self.next += 1;
            Some(frame(time))
        }
    }

    /// 等待渲染线程处理完 `count` 帧
    fn wait_handled(f: &Fixture, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(30);
        while Instant::now() < deadline {
            let stats = f.presenter.quality_stats();
            if (stats.frames_drawn + stats.frames_dropped) as usize >= count {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_worker_threads_present_in_order() {
        const FRAMES: usize = 10;
        let clock = ManualClock::at(0);
        let settings = PresenterSettings {
            nominal_time_per_frame: FRAME,
            ..Default::default()
        };
        let mut f = fixture_with(settings, clock.clone());
        let times: Vec<ReferenceTime> = (0..FRAMES as ReferenceTime).map(|i| 100_000 + i * FRAME).collect();
        let source = ListSource {
            times: times.clone(),
            next: 0,
        };
        f.presenter.start_worker_threads(Box::new(source)).unwrap();
        f.presenter.on_clock_start(0, 0).unwrap();

        // 时钟每次只走到第 i 帧之后半帧：第 i 帧绘制，第 i+1 帧仍在等待
        for (i, &time) in times.iter().enumerate() {
            clock.set(time + FRAME / 2);
            wait_handled(&f, i + 1);
        }

        let stats = f.presenter.quality_stats();
        assert_eq!(stats.frames_drawn as usize, FRAMES);
        assert_eq!(stats.frames_dropped, 0);
        let painted = f.backend.painted.lock().clone();
        assert_eq!(painted.iter().map(|p| p.1).collect::<Vec<_>>(), times.iter().map(|&t| Some(t)).collect::<Vec<_>>());
        assert!(f
            .sink
            .drain()
            .iter()
            .any(|e| matches!(e, PresenterEvent::ProcessingLatency(_))));

        f.presenter.process_message(PresenterMessage::Flush).unwrap();
        assert_eq!(f.presenter.shared.pool.scheduled_len(), 0);
        f.presenter.shutdown();
        assert_eq!(f.presenter.render_state(), RenderState::Shutdown);
    }

    #[test]
    fn test_measure_refresh_with_simulated_raster() {
        let raster = SimulatedRaster::new(60.0, 1125);
        let f = fixture(0);
        let mut detector = RefreshDetector::new();
        for _ in 0..20 {
            if let Some((lines, times)) = f.presenter.shared.measure_refresh(&raster) {
                detector.measure(lines, times);
            }
            if detector.measurements() > 0 {
                break;
            }
        }
        assert!(detector.measurements() > 0);
        assert!((detector.refresh_rate() - 60.0).abs() < 3.0, "rate = {}", detector.refresh_rate());
    }
}
