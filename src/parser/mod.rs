// 码流参数集解析

pub mod av1;
pub mod avc;
pub mod avs3;
pub mod bit_cursor;
pub mod config_record;
pub mod dirac;
pub mod hevc;
pub mod tables;

pub use bit_cursor::{unescape_rbsp, BitCursor};

use crate::core::{ParseOptions, ParseResult, VideoCodec, VideoStreamParameters};
use log::debug;

/// 解析一个参数集，统一输出 `VideoStreamParameters`
///
/// AVC / HEVC 的输入为去掉 NAL 头之后的负载，可用 [`strip_nal_header`] 处理 Annex-B 数据。
pub fn parse_parameter_set(codec: VideoCodec, data: &[u8], options: &ParseOptions) -> ParseResult<VideoStreamParameters> {
    match codec {
        VideoCodec::Dirac => dirac::parse_sequence_header(data),
        VideoCodec::Avc => avc::parse_sequence_parameter_set(data, options),
        VideoCodec::AvcConfig => config_record::parse_avc_config(data, true, options),
        VideoCodec::HevcSps => hevc::parse_sequence_parameter_set(data, options),
        VideoCodec::HevcVps => hevc::parse_video_parameter_set(data, options),
        VideoCodec::HevcConfig => config_record::parse_hevc_config(data, true, options),
        VideoCodec::Av1 => av1::parse_obus(data).map(|(seq, _)| VideoStreamParameters::from(&seq)),
        VideoCodec::Avs3 => avs3::parse_sequence_header(data).map(|seq| VideoStreamParameters::from(&seq)),
    }
}

/// 失败时返回 `(false, 清空的记录)`
pub fn parse_or_cleared(codec: VideoCodec, data: &[u8], options: &ParseOptions) -> (bool, VideoStreamParameters) {
    match parse_parameter_set(codec, data, options) {
        Ok(params) => (true, params),
        Err(e) => {
            debug!("{} 参数集解析失败: {}", codec.as_str(), e);
            (false, VideoStreamParameters::default())
        }
    }
}

/// 去掉 Annex-B 起始码与 NAL 头（AVC 1 字节，HEVC 2 字节）
pub fn strip_nal_header(codec: VideoCodec, data: &[u8]) -> &[u8] {
    let header_len = match codec {
        VideoCodec::Avc => 1,
        VideoCodec::HevcSps | VideoCodec::HevcVps => 2,
        _ => return data,
    };
    let body = if data.starts_with(&[0, 0, 0, 1]) {
        &data[4..]
    } else if data.starts_with(&[0, 0, 1]) {
        &data[3..]
    } else {
        return data;
    };
    body.get(header_len..).unwrap_or(&[])
}
