use anyhow::{bail, Context, Result};
use log::info;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vsync_presenter::core::{
    Fraction, ParseOptions, PresenterSettings, ReferenceTime, SurfaceIndex, SystemClock, VideoCodec, UNITS,
};
use vsync_presenter::parser::{parse_parameter_set, strip_nal_header};
use vsync_presenter::renderer::{
    ClockStateSink, DecodedFrame, FrameSource, MediaFormat, PresentBackend, Presenter, PresenterControl,
    PresenterEvent, PresenterMessage, QueueEventSink, SimulatedRaster,
};

const USAGE: &str = "用法:
  vsync-presenter probe <codec> <file>
  vsync-presenter simulate <fps> <frames> [settings.json]

codec: dirac | avc | avcc | hevc | hevc-vps | hvcc | av1 | avs3";

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("probe") if args.len() == 3 => probe(&args[1], &args[2]),
        Some("simulate") if args.len() >= 3 => {
            let fps: f64 = args[1].parse().context("fps 不是数字")?;
            let frames: usize = args[2].parse().context("frames 不是整数")?;
            let settings = match args.get(3) {
                Some(path) => PresenterSettings::load(path).with_context(|| format!("读取配置失败: {}", path))?,
                None => PresenterSettings::default(),
            };
            simulate(fps, frames, settings)
        }
        _ => {
            eprintln!("{}", USAGE);
            bail!("参数错误");
        }
    }
}

/// 解析一个参数集文件并输出 JSON
fn probe(codec: &str, path: &str) -> Result<()> {
    let codec = VideoCodec::from_name(codec).with_context(|| format!("未知的编码: {}", codec))?;
    let bytes = std::fs::read(path).with_context(|| format!("读取文件失败: {}", path))?;
    info!("🔍 解析 {} 参数集: {} ({} 字节)", codec.as_str(), path, bytes.len());

    let payload = strip_nal_header(codec, &bytes);
    let params = parse_parameter_set(codec, payload, &ParseOptions::default())
        .with_context(|| format!("{} 参数集解析失败", codec.as_str()))?;
    println!("{}", serde_json::to_string_pretty(&params)?);
    Ok(())
}

/// 按固定帧率产生时间戳
struct SyntheticSource {
    fps: f64,
    next: usize,
    total: usize,
}

impl FrameSource for SyntheticSource {
    fn produce(&mut self, _surface: SurfaceIndex) -> Option<DecodedFrame> {
        if self.next >= self.total {
            return None;
        }
        let frame_time = UNITS as f64 / self.fps;
        // 从 10ms 开始，避免 0 时间戳被当作立即绘制
        let time = 100_000 + (self.next as f64 * frame_time) as ReferenceTime;
        self.next += 1;
        Some(DecodedFrame {
            time: Some(time),
            duration: frame_time as ReferenceTime,
        })
    }
}

/// 只记录绘制次数
#[derive(Default)]
struct CountingBackend {
    painted: Mutex<usize>,
}

impl PresentBackend for CountingBackend {
    fn paint(&self, _surface: SurfaceIndex, _time: Option<ReferenceTime>) -> vsync_presenter::core::Result<()> {
        *self.painted.lock() += 1;
        Ok(())
    }

    fn surfaces_reallocated(&self, count: usize, width: u32, height: u32) {
        info!("🖼 表面池: {} 块 {}x{}", count, width, height);
    }
}

/// 用合成时钟和光栅驱动呈现器，输出统计
fn simulate(fps: f64, frames: usize, settings: PresenterSettings) -> Result<()> {
    if !(fps > 0.0) {
        bail!("fps 必须大于 0");
    }
    info!("🎬 模拟播放 {} 帧 @ {} fps", frames, fps);

    let clock = Arc::new(SystemClock::new());
    let backend = Arc::new(CountingBackend::default());
    let sink = Arc::new(QueueEventSink::new());
    let raster = Arc::new(SimulatedRaster::new(settings.display_refresh_rate, settings.display_height));

    let mut presenter = Presenter::new(settings, clock.clone(), backend.clone(), sink.clone(), Some(raster));
    presenter.initialize_device(MediaFormat {
        width: 1920,
        height: 1080,
        frame_rate: Fraction::new((fps * 1000.0).round() as u32, 1000).reduced(),
    })?;
    presenter.start_worker_threads(Box::new(SyntheticSource {
        fps,
        next: 0,
        total: frames,
    }))?;
    presenter.process_message(PresenterMessage::BeginStreaming)?;

    clock.set_time(0);
    clock.start();
    presenter.on_clock_start(0, 0)?;

    let budget = Duration::from_secs_f64(frames as f64 / fps + 2.0);
    let deadline = Instant::now() + budget;
    let mut events = Vec::new();
    while Instant::now() < deadline {
        events.extend(sink.drain());
        let handled = *backend.painted.lock() + presenter.quality_stats().frames_dropped as usize;
        if handled >= frames {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    presenter.process_message(PresenterMessage::EndOfStream)?;

    let stats = presenter.quality_stats();
    let refresh_rate = presenter.refresh_rate();
    presenter.shutdown();
    events.extend(sink.drain());

    let count = |f: fn(&PresenterEvent) -> bool| events.iter().filter(|e| f(e)).count();
    let report = serde_json::json!({
        "frames": frames,
        "painted": *backend.painted.lock(),
        "quality": stats,
        "refresh_rate": refresh_rate,
        "starvations": count(|e| matches!(e, PresenterEvent::Starvation)),
        "completed": count(|e| matches!(e, PresenterEvent::PlaybackComplete)) > 0,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
