use serde::{Deserialize, Serialize};

/// 时间单位：100ns（1 秒 = 10_000_000）
pub type ReferenceTime = i64;

/// 每秒的 100ns 单位数
pub const UNITS: ReferenceTime = 10_000_000;

/// 视频编码类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Dirac,
    Avc,
    /// AVCDecoderConfigurationRecord (avcC)
    AvcConfig,
    HevcSps,
    HevcVps,
    /// HEVCDecoderConfigurationRecord (hvcC)
    HevcConfig,
    Av1,
    Avs3,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::Dirac => "dirac",
            VideoCodec::Avc => "avc",
            VideoCodec::AvcConfig => "avcc",
            VideoCodec::HevcSps => "hevc-sps",
            VideoCodec::HevcVps => "hevc-vps",
            VideoCodec::HevcConfig => "hvcc",
            VideoCodec::Av1 => "av1",
            VideoCodec::Avs3 => "avs3",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let codec = match name.to_ascii_lowercase().as_str() {
            "dirac" => VideoCodec::Dirac,
            "avc" | "h264" => VideoCodec::Avc,
            "avcc" => VideoCodec::AvcConfig,
            "hevc" | "hevc-sps" | "h265" => VideoCodec::HevcSps,
            "hevc-vps" => VideoCodec::HevcVps,
            "hvcc" => VideoCodec::HevcConfig,
            "av1" => VideoCodec::Av1,
            "avs3" => VideoCodec::Avs3,
            _ => return None,
        };
        Some(codec)
    }
}

/// 分数（宽高比、帧率）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

impl Fraction {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    /// 约分到最简形式；分子或分母为 0 时原样返回
    pub fn reduced(self) -> Self {
        if !self.is_valid() {
            return self;
        }
        let g = gcd(self.num, self.den);
        Self::new(self.num / g, self.den / g)
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// VUI / VPS 中的时间信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimingInfo {
    pub num_units_in_tick: u32,
    pub time_scale: u32,
}

/// HEVC 短期参考图像集
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShortTermRps {
    pub num_negative_pics: u32,
    pub delta_poc: Vec<i32>,
    pub used: Vec<bool>,
}

impl ShortTermRps {
    pub fn num_delta_pocs(&self) -> usize {
        self.delta_poc.len()
    }

    pub fn num_positive_pics(&self) -> u32 {
        self.delta_poc.len() as u32 - self.num_negative_pics
    }
}

/// 参数集解析结果
///
/// 解析失败时调用方拿到的是 `Default`（全零，即"未知"）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VideoStreamParameters {
    pub width: u32,
    pub height: u32,
    /// 采样宽高比（已约分）
    pub sar: Fraction,
    pub profile: u32,
    pub level: u32,
    /// 平均帧时长（100ns）
    pub avg_time_per_frame: ReferenceTime,
    pub interlaced: bool,
    /// AVC/HEVC 长度前缀字节数（1..=4），其它编码为 0
    pub nal_length_size: u8,
    pub vui_timing: TimingInfo,
    pub vps_timing: TimingInfo,
    /// 位深，未知时为 0
    pub bit_depth: u8,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub short_term_rps: Vec<ShortTermRps>,
}

impl VideoStreamParameters {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// 帧率（fps），未知时为 0
    pub fn frame_rate(&self) -> f64 {
        if self.avg_time_per_frame > 0 {
            UNITS as f64 / self.avg_time_per_frame as f64
        } else {
            0.0
        }
    }
}

/// 呈现器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderState {
    Stopped,
    Paused,
    Started,
    Shutdown,
}

/// 上报给宿主的过滤器状态（饥饿时为中间态 Paused）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedState {
    Stopped,
    Paused,
    /// 饥饿中，队列尚未恢复
    PausedIntermediate,
    Running,
}

/// 表面池中的索引
pub type SurfaceIndex = usize;

/// 一个已解码样本（对应一块可呈现表面）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub surface: SurfaceIndex,
    /// 所属表面池的分配代数，重新分配后旧样本作废
    pub generation: u32,
    /// 呈现时间，`None` 表示没有时间戳（立即呈现）
    pub time: Option<ReferenceTime>,
    pub duration: ReferenceTime,
}

impl Sample {
    pub fn new(surface: SurfaceIndex) -> Self {
        Self {
            surface,
            generation: 0,
            time: None,
            duration: 0,
        }
    }
}

/// 统计属性（丢帧、绘制、抖动、同步偏移）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityStats {
    pub frames_dropped: u32,
    pub frames_drawn: u32,
    /// 平均帧率（fps × 100）
    pub avg_frame_rate: i32,
    /// 抖动（ms）
    pub jitter: i32,
    /// 同步偏移均值（ms）
    pub avg_sync_offset: i32,
    /// 同步偏移标准差（ms）
    pub dev_sync_offset: i32,
}
