//! H.264/AVC 序列参数集解析

use crate::core::{Fraction, ParseError, ParseOptions, ParseResult, VideoStreamParameters, UNITS};
use crate::parser::bit_cursor::{unescape_rbsp, BitCursor};
use crate::parser::tables::{ASPECT_RATIO_EXTENDED_SAR, PIXEL_ASPECT};

const PROFILES: [u32; 11] = [44, 66, 77, 88, 100, 110, 118, 122, 128, 144, 244];
const LEVELS: [u32; 19] = [10, 11, 12, 13, 20, 21, 22, 30, 31, 32, 40, 41, 42, 50, 51, 52, 60, 61, 62];

const PROFILE_MULTIVIEW_HIGH: u32 = 118;
const PROFILE_STEREO_HIGH: u32 = 128;

fn out_of_range(field: &'static str, value: impl Into<u64>) -> ParseError {
    ParseError::OutOfRange {
        field,
        value: value.into(),
    }
}

/// hrd_parameters()
fn skip_hrd_parameters(bc: &mut BitCursor) -> ParseResult<()> {
    let cpb_cnt_minus1 = bc.read_ue()?;
    if cpb_cnt_minus1 > 32 {
        return Err(out_of_range("cpb_cnt_minus1", cpb_cnt_minus1));
    }
    bc.read_bits(4)?; // bit_rate_scale
    bc.read_bits(4)?; // cpb_size_scale
    for _ in 0..=cpb_cnt_minus1 {
        bc.read_ue()?; // bit_rate_value_minus1
        bc.read_ue()?; // cpb_size_value_minus1
        bc.read_bit()?; // cbr_flag
    }
    bc.read_bits(5)?; // initial_cpb_removal_delay_length_minus1
    bc.read_bits(5)?; // cpb_removal_delay_length_minus1
    bc.read_bits(5)?; // dpb_output_delay_length_minus1
    bc.read_bits(5)?; // time_offset_length
    Ok(())
}

fn skip_scaling_matrix(bc: &mut BitCursor) -> ParseResult<()> {
    for i in 0..8 {
        if !bc.read_bit()? {
            continue;
        }
        let size = if i < 6 { 16 } else { 64 };
        let mut next = 8i32;
        let mut j = 0;
        while j < size && next != 0 {
            next = (next + bc.read_se()? + 256) & 255;
            j += 1;
        }
    }
    Ok(())
}

/// 解析 SPS（NAL 头之后的负载）
pub fn parse_sequence_parameter_set(data: &[u8], options: &ParseOptions) -> ParseResult<VideoStreamParameters> {
    let rbsp = if options.strip_emulation_prevention {
        unescape_rbsp(data)
    } else {
        std::borrow::Cow::Borrowed(data)
    };
    let mut bc = BitCursor::new(&rbsp);
    let mut params = VideoStreamParameters::default();

    params.profile = bc.read_bits(8)?;
    if !PROFILES.contains(&params.profile) {
        return Err(ParseError::UnsupportedProfile(params.profile));
    }
    bc.read_bits(8)?; // constraint_set flags
    params.level = bc.read_bits(8)?;
    if !LEVELS.contains(&params.level) {
        return Err(ParseError::UnsupportedLevel(params.level));
    }

    let sps_id = bc.read_ue()?;
    if sps_id >= 32 {
        return Err(out_of_range("seq_parameter_set_id", sps_id));
    }

    let mut chroma_format_idc = 1;
    if params.profile >= 100 {
        chroma_format_idc = bc.read_ue()?;
        if chroma_format_idc == 3 {
            bc.read_bit()?; // separate_colour_plane_flag
        }
        let bit_depth_luma_minus8 = bc.read_ue()?;
        bc.read_ue()?; // bit_depth_chroma_minus8
        bc.read_bit()?; // qpprime_y_zero_transform_bypass_flag
        if bc.read_bit()? {
            skip_scaling_matrix(&mut bc)?;
        }
        params.bit_depth = (bit_depth_luma_minus8 + 8).min(u8::MAX as u32) as u8;
    } else {
        params.bit_depth = 8;
    }

    bc.read_ue()?; // log2_max_frame_num_minus4

    match bc.read_ue()? {
        0 => {
            bc.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            bc.read_bit()?; // delta_pic_order_always_zero_flag
            bc.read_se()?; // offset_for_non_ref_pic
            bc.read_se()?; // offset_for_top_to_bottom_field
            let cycle = bc.read_ue()?;
            if cycle >= 256 {
                return Err(out_of_range("num_ref_frames_in_pic_order_cnt_cycle", cycle));
            }
            for _ in 0..cycle {
                bc.read_se()?; // offset_for_ref_frame
            }
        }
        2 => {}
        other => return Err(out_of_range("pic_order_cnt_type", other)),
    }

    let ref_frames = bc.read_ue()?;
    if ref_frames > 30 {
        return Err(out_of_range("max_num_ref_frames", ref_frames));
    }
    bc.read_bit()?; // gaps_in_frame_num_value_allowed_flag

    let width_in_mbs_minus1 = bc.read_ue()?;
    let height_in_map_units_minus1 = bc.read_ue()?;
    params.interlaced = !bc.read_bit()?; // frame_mbs_only_flag
    if params.interlaced {
        bc.read_bit()?; // mb_adaptive_frame_field_flag
    }
    let direct_8x8_inference = bc.read_bit()?;
    if params.interlaced && !direct_8x8_inference {
        return Err(ParseError::Malformed("隔行码流必须启用 direct_8x8_inference"));
    }

    let frame_cropping = bc.read_bit()?;
    let (crop_left, crop_right, crop_top, crop_bottom) = if frame_cropping {
        (bc.read_ue()?, bc.read_ue()?, bc.read_ue()?, bc.read_ue()?)
    } else {
        (0, 0, 0, 0)
    };

    if bc.read_bit()? {
        parse_vui(&mut bc, &mut params)?;
    }

    if !bc.is_at_end() && (params.profile == PROFILE_MULTIVIEW_HIGH || params.profile == PROFILE_STEREO_HIGH) {
        if !bc.read_bit()? {
            return Err(ParseError::Malformed("bit_equal_to_one 为 0"));
        }
        bc.read_ue()?; // num_views_minus1
    }

    params.sar = if params.sar.is_valid() {
        params.sar.reduced()
    } else {
        Fraction::new(1, 1)
    };

    let field_factor: i64 = if params.interlaced { 2 } else { 1 };
    let mut width = (width_in_mbs_minus1 as i64 + 1) * 16;
    let mut height = (height_in_map_units_minus1 as i64 + 1) * field_factor * 16;

    if frame_cropping {
        let vsub = (chroma_format_idc == 1) as u32;
        let hsub = (chroma_format_idc == 1 || chroma_format_idc == 2) as u32;
        let step_x = 1i64 << hsub;
        let step_y = field_factor << vsub;
        width -= (crop_left as i64 + crop_right as i64) * step_x;
        height -= (crop_top as i64 + crop_bottom as i64) * step_y;
    }

    if width < 100 || height < 100 {
        return Err(out_of_range("frame_size", (width.min(height)).max(0) as u64));
    }
    if height == 1088 && options.coerce_1088_to_1080 {
        height = 1080;
    }

    params.width = width.min(u32::MAX as i64) as u32;
    params.height = height.min(u32::MAX as i64) as u32;
    Ok(params)
}

/// vui_parameters()
fn parse_vui(bc: &mut BitCursor, params: &mut VideoStreamParameters) -> ParseResult<()> {
    if bc.read_bit()? {
        let aspect_ratio_idc = bc.read_bits(8)?;
        if aspect_ratio_idc == ASPECT_RATIO_EXTENDED_SAR {
            params.sar = Fraction::new(bc.read_bits(16)?, bc.read_bits(16)?);
        } else if let Some(sar) = PIXEL_ASPECT.get(aspect_ratio_idc as usize) {
            params.sar = *sar;
        } else {
            return Err(out_of_range("aspect_ratio_idc", aspect_ratio_idc));
        }
    }

    if bc.read_bit()? {
        bc.read_bit()?; // overscan_appropriate_flag
    }

    if bc.read_bit()? {
        bc.read_bits(3)?; // video_format
        bc.read_bit()?; // video_full_range_flag
        if bc.read_bit()? {
            bc.read_bits(8)?; // colour_primaries
            bc.read_bits(8)?; // transfer_characteristics
            bc.read_bits(8)?; // matrix_coefficients
        }
    }

    if bc.read_bit()? {
        bc.read_ue()?; // chroma_sample_loc_type_top_field
        bc.read_ue()?; // chroma_sample_loc_type_bottom_field
    }

    if bc.read_bit()? {
        let num_units_in_tick = bc.read_bits(32)?;
        let time_scale = bc.read_bits(32)?;
        let fixed_frame_rate = bc.read_bit()?;
        params.vui_timing.num_units_in_tick = num_units_in_tick;
        params.vui_timing.time_scale = time_scale;
        if fixed_frame_rate && num_units_in_tick != 0 && time_scale != 0 {
            params.avg_time_per_frame =
                (UNITS as f64 * num_units_in_tick as f64 * 2.0 / time_scale as f64) as i64;
        }
    }

    let nal_hrd = bc.read_bit()?;
    if nal_hrd {
        skip_hrd_parameters(bc)?;
    }
    let vcl_hrd = bc.read_bit()?;
    if vcl_hrd {
        skip_hrd_parameters(bc)?;
    }
    if nal_hrd || vcl_hrd {
        bc.read_bit()?; // low_delay_hrd_flag
    }

    bc.read_bit()?; // pic_struct_present_flag
    if !bc.is_at_end() && bc.read_bit()? {
        bc.read_bit()?; // motion_vectors_over_pic_boundaries_flag
        bc.read_ue()?; // max_bytes_per_pic_denom
        bc.read_ue()?; // max_bits_per_mb_denom
        bc.read_ue()?; // log2_max_mv_length_horizontal
        bc.read_ue()?; // log2_max_mv_length_vertical
        let mut num_reorder_frames = 0;
        if !bc.is_at_end() {
            num_reorder_frames = bc.read_ue()?;
            bc.read_ue()?; // max_dec_frame_buffering
        }
        if num_reorder_frames > 16 {
            return Err(out_of_range("num_reorder_frames", num_reorder_frames));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::parser::bit_cursor::BitWriter;

    /// 构造 High profile 4:2:0 SPS（不含 VUI）
    pub(crate) fn high_sps(width_mbs: u32, height_units: u32, frame_mbs_only: bool, crop: Option<[u32; 4]>) -> BitWriter {
        let mut w = BitWriter::new();
        w.bits(100, 8).bits(0, 8).bits(40, 8);
        w.ue(0); // sps_id
        w.ue(1); // chroma_format_idc
        w.ue(0).ue(0).bit(false).bit(false);
        w.ue(0); // log2_max_frame_num_minus4
        w.ue(0).ue(2); // poc type 0
        w.ue(4).bit(false);
        w.ue(width_mbs - 1).ue(height_units - 1);
        w.bit(frame_mbs_only);
        if !frame_mbs_only {
            w.bit(false);
        }
        w.bit(true); // direct_8x8_inference
        match crop {
            Some([l, r, t, b]) => {
                w.bit(true).ue(l).ue(r).ue(t).ue(b);
            }
            None => {
                w.bit(false);
            }
        }
        w
    }

    #[test]
    fn test_1080p_height_coerced() {
        let mut w = high_sps(120, 68, true, None);
        w.bit(false); // vui
        let data = w.finish_rbsp();
        let params = parse_sequence_parameter_set(&data, &ParseOptions::default()).unwrap();
        assert_eq!((params.width, params.height), (1920, 1080));
        assert_eq!(params.profile, 100);
        assert_eq!(params.level, 40);
        assert_eq!(params.sar, Fraction::new(1, 1));
        assert!(!params.interlaced);

        let keep = ParseOptions {
            coerce_1088_to_1080: false,
            ..Default::default()
        };
        let params = parse_sequence_parameter_set(&data, &keep).unwrap();
        assert_eq!(params.height, 1088);
    }

    #[test]
    fn test_crop_420_progressive() {
        let mut w = high_sps(120, 68, true, Some([0, 0, 0, 4]));
        w.bit(false);
        let data = w.finish_rbsp();
        let params = parse_sequence_parameter_set(&data, &ParseOptions::default()).unwrap();
        assert_eq!(params.height, 1088 - 8);
        assert_eq!(params.width, 1920);
    }

    #[test]
    fn test_interlaced_crop_doubles_step() {
        // 34 个场宏块对 → 1088 行
        let mut w = high_sps(120, 34, false, Some([0, 0, 0, 2]));
        w.bit(false);
        let data = w.finish_rbsp();
        let params = parse_sequence_parameter_set(&data, &ParseOptions::default()).unwrap();
        assert!(params.interlaced);
        assert_eq!(params.height, 1088 - 8);
    }

    #[test]
    fn test_vui_timing_and_sar() {
        let mut w = high_sps(45, 36, true, None);
        w.bit(true); // vui
        w.bit(true).bits(255, 8).bits(64, 16).bits(48, 16);
        w.bit(false).bit(false).bit(false);
        w.bit(true).bits(1001, 32).bits(48000, 32).bit(true);
        w.bit(false).bit(false); // hrd
        w.bit(false); // pic_struct
        w.bit(false); // bitstream_restriction
        let data = w.finish_rbsp();
        let params = parse_sequence_parameter_set(&data, &ParseOptions::default()).unwrap();
        assert_eq!((params.width, params.height), (720, 576));
        assert_eq!(params.sar, Fraction::new(4, 3));
        assert_eq!(params.avg_time_per_frame, 417_083);
        assert_eq!(params.vui_timing.time_scale, 48000);
    }

    #[test]
    fn test_reserved_aspect_idc_fails() {
        let mut w = high_sps(45, 36, true, None);
        w.bit(true).bit(true).bits(17, 8);
        w.bits(0, 16);
        let data = w.finish_rbsp();
        assert!(parse_sequence_parameter_set(&data, &ParseOptions::default()).is_err());
    }

    #[test]
    fn test_rejects_unknown_profile_and_small_frames() {
        let data = [0x43, 0x00, 0x28, 0x80];
        assert_eq!(
            parse_sequence_parameter_set(&data, &ParseOptions::default()),
            Err(ParseError::UnsupportedProfile(0x43))
        );

        let mut w = high_sps(6, 6, true, None);
        w.bit(false);
        assert!(parse_sequence_parameter_set(&w.finish_rbsp(), &ParseOptions::default()).is_err());
    }

    #[test]
    fn test_emulation_prevention_stripped() {
        // 超大宽度的 ue 会产生连续的 00 字节
        let mut w = BitWriter::new();
        w.bits(66, 8).bits(0, 8).bits(30, 8);
        w.ue(0).ue(0).ue(2).ue(1).bit(false);
        w.ue(1 << 24).ue(14).bit(true).bit(true).bit(false).bit(false);
        let raw = w.finish_rbsp();
        let mut escaped = Vec::new();
        let mut zeros = 0;
        for &b in &raw {
            if zeros >= 2 {
                escaped.push(3);
                zeros = 0;
            }
            zeros = if b == 0 { zeros + 1 } else { 0 };
            escaped.push(b);
        }
        assert_ne!(escaped, raw);
        let params = parse_sequence_parameter_set(&escaped, &ParseOptions::default()).unwrap();
        assert_eq!((params.width, params.height), (((1 << 24) + 1) * 16, 240));
    }

    #[test]
    fn test_truncated_prefixes_fail() {
        let mut w = high_sps(120, 68, true, Some([0, 0, 0, 4]));
        w.bit(false);
        let data = w.finish();
        assert!(parse_sequence_parameter_set(&data, &ParseOptions::default()).is_ok());
        for len in 0..data.len() {
            assert!(
                parse_sequence_parameter_set(&data[..len], &ParseOptions::default()).is_err(),
                "prefix {len}"
            );
        }
    }
}
