//! Dirac 序列头解析

use crate::core::{Fraction, ParseError, ParseResult, VideoStreamParameters, UNITS};
use crate::parser::bit_cursor::BitCursor;
use crate::parser::tables::STD_FRAME_RATES;

/// 预设视频格式中解析需要的字段
#[derive(Debug, Clone, Copy)]
struct SourcePreset {
    width: u32,
    height: u32,
    /// 0: 444  1: 422  2: 420
    chroma_format: u32,
    interlaced: u32,
    frame_rate_index: u32,
}

const fn preset(width: u32, height: u32, chroma_format: u32, interlaced: u32, frame_rate_index: u32) -> SourcePreset {
    SourcePreset {
        width,
        height,
        chroma_format,
        interlaced,
        frame_rate_index,
    }
}

const VIDEO_FORMAT_PRESETS: [SourcePreset; 21] = [
    preset(640, 480, 2, 0, 1),
    preset(176, 120, 2, 0, 9),
    preset(176, 144, 2, 0, 10),
    preset(352, 240, 2, 0, 9),
    preset(352, 288, 2, 0, 10),
    preset(704, 480, 2, 0, 9),
    preset(704, 576, 2, 0, 10),
    preset(720, 480, 1, 1, 4),
    preset(720, 576, 1, 1, 3),
    preset(1280, 720, 1, 0, 7),
    preset(1280, 720, 1, 0, 6),
    preset(1920, 1080, 1, 1, 4),
    preset(1920, 1080, 1, 1, 3),
    preset(1920, 1080, 1, 0, 7),
    preset(1920, 1080, 1, 0, 6),
    preset(2048, 1080, 0, 0, 2),
    preset(4096, 2160, 0, 0, 2),
    preset(3840, 2160, 1, 0, 7),
    preset(3840, 2160, 1, 0, 6),
    preset(7680, 4320, 1, 0, 7),
    preset(7680, 4320, 1, 0, 6),
];

const DIRAC_FRAME_RATES: [Fraction; 2] = [Fraction::new(15000, 1001), Fraction::new(25, 2)];

/// 解析 Dirac 序列头（parse_info 之后的数据）
pub fn parse_sequence_header(data: &[u8]) -> ParseResult<VideoStreamParameters> {
    let mut bc = BitCursor::new(data);

    let version_major = bc.read_ue()?;
    if version_major < 2 {
        return Err(ParseError::OutOfRange {
            field: "version_major",
            value: version_major as u64,
        });
    }
    bc.read_ue()?; // version_minor
    let profile = bc.read_ue()?;
    let level = bc.read_ue()?;
    let video_format = bc.read_ue()?;

    let mut source = *VIDEO_FORMAT_PRESETS
        .get(video_format as usize)
        .ok_or(ParseError::OutOfRange {
            field: "video_format",
            value: video_format as u64,
        })?;

    if bc.read_bit()? {
        source.width = bc.read_ue()?;
        source.height = bc.read_ue()?;
    }
    if source.width == 0 || source.height == 0 {
        return Err(ParseError::Malformed("Dirac 尺寸为 0"));
    }

    if bc.read_bit()? {
        source.chroma_format = bc.read_ue()?;
    }
    if source.chroma_format > 2 {
        return Err(ParseError::OutOfRange {
            field: "chroma_format",
            value: source.chroma_format as u64,
        });
    }

    if bc.read_bit()? {
        source.interlaced = bc.read_ue()?;
    }
    if source.interlaced > 1 {
        return Err(ParseError::OutOfRange {
            field: "interlaced",
            value: source.interlaced as u64,
        });
    }

    let mut frame_rate = Fraction::default();
    if bc.read_bit()? {
        source.frame_rate_index = bc.read_ue()?;
        if source.frame_rate_index > 10 {
            return Err(ParseError::OutOfRange {
                field: "frame_rate_index",
                value: source.frame_rate_index as u64,
            });
        }
        if source.frame_rate_index == 0 {
            frame_rate.num = bc.read_ue()?;
            frame_rate.den = bc.read_ue()?;
        }
    }
    match source.frame_rate_index {
        0 => {}
        i @ 1..=8 => frame_rate = STD_FRAME_RATES[i as usize],
        i => frame_rate = DIRAC_FRAME_RATES[(i - 9) as usize],
    }
    if !frame_rate.is_valid() {
        return Err(ParseError::Malformed("Dirac 帧率为 0"));
    }

    Ok(VideoStreamParameters {
        width: source.width,
        height: source.height,
        profile,
        level,
        interlaced: source.interlaced == 1,
        avg_time_per_frame: (UNITS as f64 * frame_rate.den as f64 / frame_rate.num as f64) as i64,
        ..Default::default()
    })
}
