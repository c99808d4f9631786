//! AV1 OBU 与序列头解析

use crate::core::{ParseError, ParseResult, VideoStreamParameters};
use crate::parser::bit_cursor::BitCursor;
use serde::{Deserialize, Serialize};

pub const OBU_SEQUENCE_HEADER: u8 = 1;
pub const OBU_FRAME_HEADER: u8 = 3;
pub const OBU_FRAME: u8 = 6;

/// OBU 头（含扩展与 leb128 长度）的最大字节数
const MAX_OBU_HEADER_SIZE: usize = 10;

const PROFILE_MAIN: u8 = 0;
const PROFILE_HIGH: u8 = 1;
const PROFILE_PROFESSIONAL: u8 = 2;

const COLOR_PRIMARIES_BT709: u8 = 1;
const TRANSFER_SRGB: u8 = 13;
const MATRIX_IDENTITY: u8 = 0;
const UNSPECIFIED: u8 = 2;

/// AV1 序列头
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Av1SequenceHeader {
    pub profile: u8,
    pub level: u8,
    pub tier: u8,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub monochrome: bool,
    pub color_description_present: bool,
    pub color_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
    pub color_range: bool,
    pub chroma_subsampling_x: bool,
    pub chroma_subsampling_y: bool,
    pub chroma_sample_position: u8,
}

impl From<&Av1SequenceHeader> for VideoStreamParameters {
    fn from(seq: &Av1SequenceHeader) -> Self {
        VideoStreamParameters {
            width: seq.width,
            height: seq.height,
            profile: seq.profile as u32,
            level: seq.level as u32,
            bit_depth: seq.bit_depth,
            sar: crate::core::Fraction::new(1, 1),
            ..Default::default()
        }
    }
}

/// 已定位的 OBU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObuHeader {
    pub obu_type: u8,
    /// 头部字节数（负载起点）
    pub header_size: usize,
    /// 负载字节数
    pub payload_size: usize,
}

impl ObuHeader {
    pub fn total_size(&self) -> usize {
        self.header_size + self.payload_size
    }
}

fn read_leb128(bc: &mut BitCursor) -> ParseResult<u64> {
    let mut value = 0u64;
    for i in 0..8 {
        let byte = bc.read_u8()?;
        value |= ((byte & 0x7f) as u64) << (i * 7);
        if byte & 0x80 == 0 {
            break;
        }
    }
    Ok(value)
}

/// 解析 OBU 头；禁止位为 1 或没有 has_size_field 时失败
pub fn parse_obu_header(data: &[u8]) -> ParseResult<ObuHeader> {
    let mut bc = BitCursor::new(&data[..data.len().min(MAX_OBU_HEADER_SIZE)]);
    if bc.read_bit()? {
        return Err(ParseError::Malformed("obu_forbidden_bit 为 1"));
    }
    let obu_type = bc.read_bits(4)? as u8;
    let extension = bc.read_bit()?;
    if !bc.read_bit()? {
        return Err(ParseError::Malformed("OBU 缺少 obu_has_size_field"));
    }
    bc.read_bit()?; // obu_reserved_1bit
    if extension {
        bc.read_bits(3)?; // temporal_id
        bc.read_bits(2)?; // spatial_id
        bc.read_bits(3)?; // extension_header_reserved_3bits
    }
    let payload_size = read_leb128(&mut bc)?;
    Ok(ObuHeader {
        obu_type,
        header_size: bc.byte_position(),
        payload_size: usize::try_from(payload_size).map_err(|_| ParseError::OutOfRange {
            field: "obu_size",
            value: payload_size,
        })?,
    })
}

/// 解析 sequence_header_obu 负载
pub fn parse_sequence_header(data: &[u8]) -> ParseResult<Av1SequenceHeader> {
    let mut bc = BitCursor::new(data);
    let mut seq = Av1SequenceHeader {
        profile: bc.read_bits(3)? as u8,
        ..Default::default()
    };
    bc.read_bit()?; // still_picture
    let reduced_still_picture_header = bc.read_bit()?;

    if reduced_still_picture_header {
        seq.level = bc.read_bits(5)? as u8;
    } else {
        let mut buffer_delay_length_minus1 = 0;
        let mut decoder_model_info_present = false;

        if bc.read_bit()? {
            bc.read_bits(32)?; // num_units_in_display_tick
            bc.read_bits(32)?; // time_scale
            if bc.read_bit()? {
                bc.read_uvlc()?; // num_ticks_per_picture_minus_1
            }
            decoder_model_info_present = bc.read_bit()?;
            if decoder_model_info_present {
                buffer_delay_length_minus1 = bc.read_bits(5)?;
                bc.read_bits(32)?; // num_units_in_decoding_tick
                bc.read_bits(10)?; // buffer_removal_time_length_minus_1, frame_presentation_time_length_minus_1
            }
        }

        let initial_display_delay_present = bc.read_bit()?;
        let operating_points_cnt_minus1 = bc.read_bits(5)?;
        for i in 0..=operating_points_cnt_minus1 {
            bc.read_bits(12)?; // operating_point_idc
            let seq_level_idx = bc.read_bits(5)? as u8;
            let seq_tier = if seq_level_idx > 7 { bc.read_bits(1)? as u8 } else { 0 };

            if decoder_model_info_present && bc.read_bit()? {
                bc.read_bits(buffer_delay_length_minus1 + 1)?; // decoder_buffer_delay
                bc.read_bits(buffer_delay_length_minus1 + 1)?; // encoder_buffer_delay
                bc.read_bit()?; // low_delay_mode_flag
            }
            if initial_display_delay_present && bc.read_bit()? {
                bc.read_bits(4)?; // initial_display_delay_minus_1
            }
            if i == 0 {
                seq.level = seq_level_idx;
                seq.tier = seq_tier;
            }
        }
    }

    let width_bits_minus1 = bc.read_bits(4)?;
    let height_bits_minus1 = bc.read_bits(4)?;
    seq.width = (bc.read_bits(width_bits_minus1 + 1)? as u64 + 1).min(u32::MAX as u64) as u32;
    seq.height = (bc.read_bits(height_bits_minus1 + 1)? as u64 + 1).min(u32::MAX as u64) as u32;

    if !reduced_still_picture_header && bc.read_bit()? {
        bc.read_bits(7)?; // delta_frame_id_length_minus_2, additional_frame_id_length_minus_1
    }

    bc.read_bits(3)?; // use_128x128_superblock, enable_filter_intra, enable_intra_edge_filter

    if !reduced_still_picture_header {
        bc.read_bits(4)?; // interintra / masked / warped / dual_filter
        let enable_order_hint = bc.read_bit()?;
        if enable_order_hint {
            bc.read_bits(2)?; // enable_jnt_comp, enable_ref_frame_mvs
        }
        // seq_choose_screen_content_tools ? SELECT : seq_force_screen_content_tools
        let screen_content_tools = if bc.read_bit()? { 2 } else { bc.read_bits(1)? };
        if screen_content_tools > 0 && !bc.read_bit()? {
            bc.read_bit()?; // seq_force_integer_mv
        }
        if enable_order_hint {
            bc.read_bits(3)?; // order_hint_bits_minus_1
        }
    }

    bc.read_bits(3)?; // enable_superres, enable_cdef, enable_restoration

    parse_color_config(&mut bc, &mut seq)?;

    bc.read_bit()?; // film_grain_params_present
    Ok(seq)
}

fn parse_color_config(bc: &mut BitCursor, seq: &mut Av1SequenceHeader) -> ParseResult<()> {
    let high_bitdepth = bc.read_bit()?;
    let twelve_bit = seq.profile == PROFILE_PROFESSIONAL && high_bitdepth && bc.read_bit()?;
    seq.bit_depth = 8 + (high_bitdepth as u8) * 2 + (twelve_bit as u8) * 2;

    if seq.profile != PROFILE_HIGH {
        seq.monochrome = bc.read_bit()?;
    }

    seq.color_description_present = bc.read_bit()?;
    if seq.color_description_present {
        seq.color_primaries = bc.read_u8()?;
        seq.transfer_characteristics = bc.read_u8()?;
        seq.matrix_coefficients = bc.read_u8()?;
    } else {
        seq.color_primaries = UNSPECIFIED;
        seq.transfer_characteristics = UNSPECIFIED;
        seq.matrix_coefficients = UNSPECIFIED;
    }

    if seq.monochrome {
        seq.color_range = bc.read_bit()?;
        seq.chroma_subsampling_x = true;
        seq.chroma_subsampling_y = true;
        seq.chroma_sample_position = 0;
        return Ok(());
    }

    let srgb = seq.color_primaries == COLOR_PRIMARIES_BT709
        && seq.transfer_characteristics == TRANSFER_SRGB
        && seq.matrix_coefficients == MATRIX_IDENTITY;
    if !srgb {
        seq.color_range = bc.read_bit()?;
        match seq.profile {
            PROFILE_MAIN => {
                seq.chroma_subsampling_x = true;
                seq.chroma_subsampling_y = true;
            }
            PROFILE_HIGH => {
                seq.chroma_subsampling_x = false;
                seq.chroma_subsampling_y = false;
            }
            _ if twelve_bit => {
                seq.chroma_subsampling_x = bc.read_bit()?;
                seq.chroma_subsampling_y = seq.chroma_subsampling_x && bc.read_bit()?;
            }
            _ => {
                seq.chroma_subsampling_x = true;
                seq.chroma_subsampling_y = false;
            }
        }
        if seq.chroma_subsampling_x && seq.chroma_subsampling_y {
            seq.chroma_sample_position = bc.read_bits(2)? as u8;
        }
    }

    bc.read_bit()?; // separate_uv_delta_q
    Ok(())
}

/// 扫描 OBU 序列：需要同时找到序列头与帧（头）OBU
///
/// 返回解析结果和完整的 sequence header OBU 字节（含 OBU 头）
pub fn parse_obus(data: &[u8]) -> ParseResult<(Av1SequenceHeader, Vec<u8>)> {
    let mut sequence_obu: Option<(&[u8], ObuHeader)> = None;
    let mut frame_found = false;

    let mut buf = data;
    while !buf.is_empty() {
        let Ok(obu) = parse_obu_header(buf) else {
            break;
        };
        if obu.total_size() > buf.len() {
            break;
        }

        match obu.obu_type {
            OBU_SEQUENCE_HEADER => sequence_obu = Some((buf, obu)),
            OBU_FRAME_HEADER | OBU_FRAME => frame_found = true,
            _ => {}
        }
        if sequence_obu.is_some() && frame_found {
            break;
        }
        buf = &buf[obu.total_size()..];
    }

    match sequence_obu {
        Some((buf, obu)) if frame_found => {
            let payload = &buf[obu.header_size..obu.total_size()];
            let seq = parse_sequence_header(payload)?;
            Ok((seq, buf[..obu.total_size()].to_vec()))
        }
        Some(_) => Err(ParseError::MissingLandmark("AV1 帧 OBU")),
        None => Err(ParseError::MissingLandmark("AV1 序列头 OBU")),
    }
}
