//! H.265/HEVC VPS / SPS 解析
//!
//! 输入均为去掉 2 字节 NAL 头之后的负载。

use crate::core::{Fraction, ParseError, ParseOptions, ParseResult, ShortTermRps, VideoStreamParameters};
use crate::parser::bit_cursor::{unescape_rbsp, BitCursor};
use crate::parser::tables::{ASPECT_RATIO_EXTENDED_SAR, PIXEL_ASPECT};
use std::borrow::Cow;

const MAX_SUB_LAYERS: u32 = 6;
const MAX_VPS_COUNT: u32 = 16;
const MAX_SPS_COUNT: u32 = 32;
const MAX_REFS: u32 = 16;
const MAX_DPB_SIZE: u32 = 16;
const MAX_SHORT_TERM_RPS_COUNT: u32 = 64;
/// 单个 RPS 最多保存的 delta POC 数
const MAX_RPS_ENTRIES: usize = 32;
const MAX_DELTA_POC_MINUS1: u32 = 32767;

pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;

fn out_of_range(field: &'static str, value: impl Into<u64>) -> ParseError {
    ParseError::OutOfRange {
        field,
        value: value.into(),
    }
}

fn rbsp<'a>(data: &'a [u8], options: &ParseOptions) -> Cow<'a, [u8]> {
    if options.strip_emulation_prevention {
        unescape_rbsp(data)
    } else {
        Cow::Borrowed(data)
    }
}

/// profile_tier_level(1, max_sub_layers_minus1)
pub fn parse_profile_tier_level(
    bc: &mut BitCursor,
    max_sub_layers_minus1: u32,
    params: &mut VideoStreamParameters,
) -> ParseResult<()> {
    bc.read_bits(2)?; // general_profile_space
    bc.read_bit()?; // general_tier_flag
    params.profile = bc.read_bits(5)?;
    bc.read_bits(32)?; // general_profile_compatibility_flag[32]
    bc.read_bits(4)?; // progressive / interlaced / non_packed / frame_only
    bc.skip_bits(44)?; // general_reserved_zero_44bits
    params.level = bc.read_bits(8)?;

    let n = max_sub_layers_minus1 as usize;
    let mut profile_present = [false; 8];
    let mut level_present = [false; 8];
    for i in 0..n {
        profile_present[i] = bc.read_bit()?;
        level_present[i] = bc.read_bit()?;
    }
    if n > 0 {
        for _ in n..8 {
            bc.read_bits(2)?; // reserved_zero_2bits
        }
    }
    for i in 0..n {
        if profile_present[i] {
            bc.read_bits(8)?; // profile_space, tier_flag, profile_idc
            bc.read_bits(32)?;
            bc.read_bits(4)?;
            bc.skip_bits(44)?;
        }
        if level_present[i] {
            bc.read_bits(8)?; // sub_layer_level_idc
        }
    }
    Ok(())
}

/// st_ref_pic_set(idx)，只允许从前一个集合预测
pub fn parse_short_term_rps(bc: &mut BitCursor, previous: Option<&ShortTermRps>) -> ParseResult<ShortTermRps> {
    let predict = match previous {
        Some(_) => bc.read_bit()?,
        None => false,
    };

    match previous {
        Some(reference) if predict => parse_predicted_rps(bc, reference),
        _ => parse_explicit_rps(bc),
    }
}

fn parse_predicted_rps(bc: &mut BitCursor, reference: &ShortTermRps) -> ParseResult<ShortTermRps> {
    let sign = bc.read_bit()?;
    let abs_delta_rps = bc.read_ue()? as u64 + 1;
    if !(1..=32768).contains(&abs_delta_rps) {
        return Err(out_of_range("abs_delta_rps", abs_delta_rps));
    }
    let delta_rps = if sign { -(abs_delta_rps as i32) } else { abs_delta_rps as i32 };

    let mut rps = ShortTermRps::default();
    let n = reference.num_delta_pocs();
    for i in 0..=n {
        let used = bc.read_bit()?;
        let use_delta = if used { false } else { bc.read_bit()? };
        if !(used || use_delta) {
            continue;
        }
        if rps.delta_poc.len() >= MAX_RPS_ENTRIES {
            return Err(out_of_range("num_delta_pocs", rps.delta_poc.len() as u64 + 1));
        }
        let delta_poc = if i < n {
            delta_rps
                .checked_add(reference.delta_poc[i])
                .ok_or_else(|| out_of_range("delta_poc", abs_delta_rps))?
        } else {
            delta_rps
        };
        if delta_poc < 0 {
            rps.num_negative_pics += 1;
        }
        rps.delta_poc.push(delta_poc);
        rps.used.push(used);
    }

    // 升序插入排序，used 标志跟随移动
    for i in 1..rps.delta_poc.len() {
        let mut k = i;
        while k > 0 && rps.delta_poc[k] < rps.delta_poc[k - 1] {
            rps.delta_poc.swap(k, k - 1);
            rps.used.swap(k, k - 1);
            k -= 1;
        }
    }

    // 负值部分翻转为由近到远
    let neg = rps.num_negative_pics as usize;
    rps.delta_poc[..neg].reverse();
    rps.used[..neg].reverse();

    Ok(rps)
}

fn parse_explicit_rps(bc: &mut BitCursor) -> ParseResult<ShortTermRps> {
    let num_negative = bc.read_ue()?;
    let num_positive = bc.read_ue()?;
    if num_negative >= MAX_REFS || num_positive >= MAX_REFS {
        return Err(out_of_range("num_delta_pocs", num_negative.max(num_positive)));
    }

    let mut rps = ShortTermRps {
        num_negative_pics: num_negative,
        ..Default::default()
    };
    let mut prev = 0i32;
    for _ in 0..num_negative {
        prev -= read_delta_poc_minus1(bc, "delta_poc_s0_minus1")? + 1;
        rps.delta_poc.push(prev);
        rps.used.push(bc.read_bit()?);
    }
    prev = 0;
    for _ in 0..num_positive {
        prev += read_delta_poc_minus1(bc, "delta_poc_s1_minus1")? + 1;
        rps.delta_poc.push(prev);
        rps.used.push(bc.read_bit()?);
    }
    Ok(rps)
}

/// delta_poc_s0/s1_minus1 取值 0..=32767
fn read_delta_poc_minus1(bc: &mut BitCursor, field: &'static str) -> ParseResult<i32> {
    let value = bc.read_ue()?;
    if value > MAX_DELTA_POC_MINUS1 {
        return Err(out_of_range(field, value));
    }
    Ok(value as i32)
}

fn skip_scaling_list_data(bc: &mut BitCursor) -> ParseResult<()> {
    for size_id in 0..4u32 {
        let step = if size_id == 3 { 3 } else { 1 };
        let mut matrix_id = 0u32;
        while matrix_id < 6 {
            if !bc.read_bit()? {
                let delta = bc.read_ue()?;
                if matrix_id < delta {
                    return Err(out_of_range("scaling_list_pred_matrix_id_delta", delta));
                }
            } else {
                let coef_num = 64.min(1u32 << (4 + (size_id << 1)));
                if size_id > 1 {
                    bc.read_se()?; // scaling_list_dc_coef_minus8
                }
                for _ in 0..coef_num {
                    bc.read_se()?;
                }
            }
            matrix_id += step;
        }
    }
    Ok(())
}

/// 解析 SPS
pub fn parse_sequence_parameter_set(data: &[u8], options: &ParseOptions) -> ParseResult<VideoStreamParameters> {
    if data.len() < 20 {
        return Err(ParseError::BufferExhausted);
    }
    let data = rbsp(data, options);
    let mut bc = BitCursor::new(&data);
    let mut params = VideoStreamParameters::default();

    let vps_id = bc.read_bits(4)?;
    if vps_id >= MAX_VPS_COUNT {
        return Err(out_of_range("sps_video_parameter_set_id", vps_id));
    }
    let max_sub_layers_minus1 = bc.read_bits(3)?;
    if max_sub_layers_minus1 > MAX_SUB_LAYERS {
        return Err(out_of_range("sps_max_sub_layers_minus1", max_sub_layers_minus1));
    }
    bc.read_bit()?; // sps_temporal_id_nesting_flag

    parse_profile_tier_level(&mut bc, max_sub_layers_minus1, &mut params)?;
    if bc.is_at_end() {
        return Err(ParseError::BufferExhausted);
    }

    let sps_id = bc.read_ue()?;
    if sps_id > MAX_SPS_COUNT {
        return Err(out_of_range("sps_seq_parameter_set_id", sps_id));
    }
    let chroma_format_idc = bc.read_ue()?;
    if !(1..=3).contains(&chroma_format_idc) {
        return Err(out_of_range("chroma_format_idc", chroma_format_idc));
    }
    if chroma_format_idc == 3 {
        bc.read_bit()?; // separate_colour_plane_flag
    }

    let width = bc.read_ue()? as i64;
    let height = bc.read_ue()? as i64;
    let (mut left, mut right, mut top, mut bottom) = (0i64, 0i64, 0i64, 0i64);
    if bc.read_bit()? {
        let vert_mult = 1 + (chroma_format_idc < 2) as i64;
        let horiz_mult = 1 + (chroma_format_idc < 3) as i64;
        left = bc.read_ue()? as i64 * horiz_mult;
        right = bc.read_ue()? as i64 * horiz_mult;
        top = bc.read_ue()? as i64 * vert_mult;
        bottom = bc.read_ue()? as i64 * vert_mult;
    }
    let (mut w, mut h) = (width - left - right, height - top - bottom);
    if w <= 0 || h <= 0 {
        w = width;
        h = height;
    }
    if w == 0 || h == 0 {
        return Err(ParseError::Malformed("HEVC 尺寸为 0"));
    }
    params.width = w as u32;
    params.height = h as u32;

    let bit_depth_luma_minus8 = bc.read_ue()?;
    let bit_depth_chroma_minus8 = bc.read_ue()?;
    if bit_depth_luma_minus8 != bit_depth_chroma_minus8 {
        return Err(ParseError::Malformed("亮度与色度位深不一致"));
    }
    params.bit_depth = (bit_depth_luma_minus8 + 8).min(u8::MAX as u32) as u8;

    let log2_max_poc_lsb = bc.read_ue()? as u64 + 4;
    if log2_max_poc_lsb > 16 {
        return Err(out_of_range("log2_max_pic_order_cnt_lsb", log2_max_poc_lsb));
    }

    let start = if bc.read_bit()? { 0 } else { max_sub_layers_minus1 };
    for _ in start..=max_sub_layers_minus1 {
        let max_dec_pic_buffering_minus1 = bc.read_ue()?;
        if max_dec_pic_buffering_minus1 >= MAX_DPB_SIZE {
            return Err(out_of_range("max_dec_pic_buffering_minus1", max_dec_pic_buffering_minus1));
        }
        let num_reorder_pics = bc.read_ue()?;
        if num_reorder_pics >= MAX_DPB_SIZE {
            return Err(out_of_range("num_reorder_pics", num_reorder_pics));
        }
        bc.read_ue()?; // max_latency_increase_plus1
    }
    if bc.is_at_end() {
        return Err(ParseError::BufferExhausted);
    }

    let log2_min_cb_size = bc.read_ue()? as u64 + 3;
    bc.read_ue()?; // log2_diff_max_min_coding_block_size
    let log2_min_tb_size = bc.read_ue()? as u64 + 2;
    bc.read_ue()?; // log2_diff_max_min_transform_block_size
    if log2_min_tb_size >= log2_min_cb_size {
        return Err(ParseError::Malformed("log2_min_tb_size 不小于 log2_min_cb_size"));
    }
    bc.read_ue()?; // max_transform_hierarchy_depth_inter
    bc.read_ue()?; // max_transform_hierarchy_depth_intra

    if bc.read_bit()? && bc.read_bit()? {
        skip_scaling_list_data(&mut bc)?;
    }
    if bc.is_at_end() {
        return Err(ParseError::BufferExhausted);
    }

    bc.read_bit()?; // amp_enabled_flag
    bc.read_bit()?; // sample_adaptive_offset_enabled_flag
    if bc.read_bit()? {
        let pcm_bit_depth_minus1 = bc.read_bits(4)?;
        bc.read_bits(4)?; // pcm_sample_bit_depth_chroma_minus1
        bc.read_ue()?; // log2_min_pcm_luma_coding_block_size_minus3
        bc.read_ue()?; // log2_diff_max_min_pcm_luma_coding_block_size
        if pcm_bit_depth_minus1 + 1 > bit_depth_luma_minus8 + 8 {
            return Err(out_of_range("pcm_sample_bit_depth_luma", pcm_bit_depth_minus1 + 1));
        }
        bc.read_bit()?; // pcm_loop_filter_disabled_flag
    }

    let num_short_term_rps = bc.read_ue()?;
    if num_short_term_rps > MAX_SHORT_TERM_RPS_COUNT {
        return Err(out_of_range("num_short_term_ref_pic_sets", num_short_term_rps));
    }
    let mut sets: Vec<ShortTermRps> = Vec::with_capacity(num_short_term_rps as usize);
    for _ in 0..num_short_term_rps {
        let rps = parse_short_term_rps(&mut bc, sets.last())?;
        sets.push(rps);
    }
    params.short_term_rps = sets;
    if bc.is_at_end() {
        return Err(ParseError::BufferExhausted);
    }

    if bc.read_bit()? {
        let num_long_term = bc.read_ue()?;
        if num_long_term > 31 {
            return Err(out_of_range("num_long_term_ref_pics_sps", num_long_term));
        }
        for _ in 0..num_long_term {
            bc.read_bits(log2_max_poc_lsb as u32)?; // lt_ref_pic_poc_lsb_sps
            bc.read_bit()?; // used_by_curr_pic_lt_sps_flag
        }
    }

    bc.read_bit()?; // sps_temporal_mvp_enabled_flag
    bc.read_bit()?; // strong_intra_smoothing_enabled_flag

    if bc.read_bit()? {
        parse_vui(&mut bc, &mut params)?;
    }

    params.sar = if params.sar.is_valid() {
        params.sar.reduced()
    } else {
        Fraction::new(1, 1)
    };
    Ok(params)
}

fn parse_vui(bc: &mut BitCursor, params: &mut VideoStreamParameters) -> ParseResult<()> {
    if bc.read_bit()? {
        let sar_idx = bc.read_bits(8)?;
        if sar_idx == ASPECT_RATIO_EXTENDED_SAR {
            params.sar = Fraction::new(bc.read_bits(16)?, bc.read_bits(16)?);
        } else if let Some(sar) = PIXEL_ASPECT.get(sar_idx as usize) {
            params.sar = *sar;
        }
    }

    if bc.read_bit()? {
        bc.read_bit()?; // overscan_appropriate_flag
    }

    if bc.read_bit()? {
        bc.read_bits(3)?; // video_format
        bc.read_bit()?; // video_full_range_flag
        if bc.read_bit()? {
            bc.read_u8()?; // colour_primaries
            bc.read_u8()?; // transfer_characteristics
            bc.read_u8()?; // matrix_coeffs
        }
    }

    if bc.read_bit()? {
        bc.read_ue()?; // chroma_sample_loc_type_top_field
        bc.read_ue()?; // chroma_sample_loc_type_bottom_field
    }

    bc.read_bit()?; // neutral_chroma_indication_flag
    bc.read_bit()?; // field_seq_flag
    bc.read_bit()?; // frame_field_info_present_flag

    if bc.read_bit()? {
        bc.read_ue()?; // def_disp_win_left_offset
        bc.read_ue()?; // def_disp_win_right_offset
        bc.read_ue()?; // def_disp_win_top_offset
        bc.read_ue()?; // def_disp_win_bottom_offset
    }

    if bc.read_bit()? {
        params.vui_timing.num_units_in_tick = bc.read_bits(32)?;
        params.vui_timing.time_scale = bc.read_bits(32)?;
    }
    Ok(())
}

/// 解析 VPS
pub fn parse_video_parameter_set(data: &[u8], options: &ParseOptions) -> ParseResult<VideoStreamParameters> {
    if data.len() < 15 {
        return Err(ParseError::BufferExhausted);
    }
    let data = rbsp(data, options);
    let mut bc = BitCursor::new(&data);
    let mut params = VideoStreamParameters::default();

    let vps_id = bc.read_bits(4)?;
    if vps_id >= MAX_VPS_COUNT {
        return Err(out_of_range("vps_video_parameter_set_id", vps_id));
    }
    if bc.read_bits(2)? != 3 {
        return Err(ParseError::Malformed("vps_reserved_three_2bits 不为 3"));
    }
    bc.read_bits(6)?; // vps_max_layers_minus1
    let max_sub_layers_minus1 = bc.read_bits(3)?;
    if max_sub_layers_minus1 > MAX_SUB_LAYERS {
        return Err(out_of_range("vps_max_sub_layers_minus1", max_sub_layers_minus1));
    }
    bc.read_bit()?; // vps_temporal_id_nesting_flag
    if bc.read_bits(16)? != 0xffff {
        return Err(ParseError::Malformed("vps_reserved_0xffff_16bits 不为 0xffff"));
    }

    parse_profile_tier_level(&mut bc, max_sub_layers_minus1, &mut params)?;

    let start = if bc.read_bit()? { 0 } else { max_sub_layers_minus1 };
    for _ in start..=max_sub_layers_minus1 {
        bc.read_ue()?; // vps_max_dec_pic_buffering_minus1
        bc.read_ue()?; // vps_max_num_reorder_pics
        bc.read_ue()?; // vps_max_latency_increase_plus1
    }

    let max_layer_id = bc.read_bits(6)?;
    let num_layer_sets_minus1 = bc.read_ue()?;
    for _ in 1..=num_layer_sets_minus1 {
        bc.skip_bits(max_layer_id as usize + 1)?; // layer_id_included_flag
    }

    if bc.read_bit()? {
        params.vps_timing.num_units_in_tick = bc.read_bits(32)?;
        params.vps_timing.time_scale = bc.read_bits(32)?;
    }
    Ok(params)
}
