//! AVCDecoderConfigurationRecord / HEVCDecoderConfigurationRecord

use crate::core::{ParseError, ParseOptions, ParseResult, VideoStreamParameters};
use crate::parser::bit_cursor::BitCursor;
use crate::parser::{avc, hevc};
use log::debug;

fn expect_bits(bc: &mut BitCursor, n: u32, expected: u32, what: &'static str) -> ParseResult<()> {
    if bc.read_bits(n)? != expected {
        return Err(ParseError::Malformed(what));
    }
    Ok(())
}

/// 从当前（已对齐）位置取出 len 字节并前移
fn take_bytes<'a>(bc: &mut BitCursor<'a>, len: usize) -> ParseResult<&'a [u8]> {
    let rest = bc.rest();
    if rest.len() < len {
        return Err(ParseError::BufferExhausted);
    }
    bc.skip_bytes(len);
    Ok(&rest[..len])
}

/// 解析 avcC；`parse_sps` 为真时用第一个 SPS 填充画面参数
pub fn parse_avc_config(data: &[u8], parse_sps: bool, options: &ParseOptions) -> ParseResult<VideoStreamParameters> {
    if data.len() < 7 {
        return Err(ParseError::BufferExhausted);
    }
    let mut bc = BitCursor::new(data);

    expect_bits(&mut bc, 8, 1, "configurationVersion 不为 1")?;
    bc.read_u8()?; // AVCProfileIndication
    bc.read_u8()?; // profile_compatibility
    bc.read_u8()?; // AVCLevelIndication
    expect_bits(&mut bc, 6, 0b111111, "avcC 保留位错误")?;
    let nal_length_size = bc.read_bits(2)? as u8 + 1;
    expect_bits(&mut bc, 3, 0b111, "avcC 保留位错误")?;

    let mut first_sps = None;
    let num_sps = bc.read_bits(5)?;
    for _ in 0..num_sps {
        let len = bc.read_u16()? as usize;
        let nal = take_bytes(&mut bc, len)?;
        if first_sps.is_none() {
            first_sps = Some(nal);
        }
    }
    let num_pps = bc.read_u8()?;
    for _ in 0..num_pps {
        let len = bc.read_u16()? as usize;
        take_bytes(&mut bc, len)?;
    }

    let mut params = match first_sps {
        Some(nal) if parse_sps && nal.len() > 1 => avc::parse_sequence_parameter_set(&nal[1..], options)?,
        Some(_) | None if parse_sps => return Err(ParseError::MissingLandmark("avcC 中的 SPS")),
        _ => VideoStreamParameters::default(),
    };
    params.nal_length_size = nal_length_size;
    Ok(params)
}

/// 解析 hvcC；`parse_sps` 为真时定位并解析 SPS 数组中的第一个 SPS
pub fn parse_hevc_config(data: &[u8], parse_sps: bool, options: &ParseOptions) -> ParseResult<VideoStreamParameters> {
    if data.len() < 23 {
        return Err(ParseError::BufferExhausted);
    }
    let mut bc = BitCursor::new(data);
    let mut params = VideoStreamParameters::default();

    // 0 为 MKV DivX HEVC 测试版
    let version = bc.read_u8()?;
    if version > 1 {
        return Err(ParseError::OutOfRange {
            field: "configurationVersion",
            value: version as u64,
        });
    }
    bc.read_bits(2)?; // general_profile_space
    bc.read_bit()?; // general_tier_flag
    params.profile = bc.read_bits(5)?;
    bc.read_bits(32)?; // general_profile_compatibility_flags
    bc.skip_bits(48)?; // general_constraint_indicator_flags
    params.level = bc.read_u8()? as u32;
    expect_bits(&mut bc, 4, 0b1111, "hvcC 保留位错误")?;
    bc.read_bits(12)?; // min_spatial_segmentation_idc
    expect_bits(&mut bc, 6, 0b111111, "hvcC 保留位错误")?;
    bc.read_bits(2)?; // parallelismType
    expect_bits(&mut bc, 6, 0b111111, "hvcC 保留位错误")?;
    bc.read_bits(2)?; // chromaFormat
    expect_bits(&mut bc, 5, 0b11111, "hvcC 保留位错误")?;
    let bit_depth_luma_minus8 = bc.read_bits(3)?;
    expect_bits(&mut bc, 5, 0b11111, "hvcC 保留位错误")?;
    bc.read_bits(3)?; // bitDepthChromaMinus8
    bc.read_u16()?; // avgFrameRate
    bc.read_bits(2)?; // constantFrameRate
    bc.read_bits(3)?; // numTemporalLayers
    bc.read_bit()?; // temporalIdNested
    let nal_length_size = bc.read_bits(2)? as u8 + 1;
    let num_arrays = bc.read_u8()?;

    params.nal_length_size = nal_length_size;
    params.bit_depth = bit_depth_luma_minus8 as u8 + 8;
    if !parse_sps {
        return Ok(params);
    }

    for _ in 0..num_arrays {
        bc.read_bit()?; // array_completeness
        bc.read_bit()?; // reserved（MKV DivX HEVC 为 1）
        let nal_unit_type = bc.read_bits(6)? as u8;
        let num_nalus = bc.read_u16()?;
        if nal_unit_type == hevc::NAL_SPS && num_nalus > 0 {
            let len = bc.read_u16()? as usize;
            let nal = take_bytes(&mut bc, len)?;
            if nal.len() <= 2 {
                return Err(ParseError::BufferExhausted);
            }
            let mut sps = hevc::parse_sequence_parameter_set(&nal[2..], options)?;
            sps.nal_length_size = nal_length_size;
            return Ok(sps);
        }
        for _ in 0..num_nalus {
            let len = bc.read_u16()? as usize;
            take_bytes(&mut bc, len)?;
        }
    }

    debug!("hvcC 中没有 SPS 数组");
    Err(ParseError::MissingLandmark("hvcC 中的 SPS"))
}

fn copy_length_prefixed(src: &[u8], pos: usize, out: &mut Vec<u8>) -> Option<usize> {
    let header = src.get(pos..pos + 2)?;
    let len = (((header[0] as usize) << 8) | header[1] as usize) + 2;
    let unit = src.get(pos..pos + len)?;
    out.extend_from_slice(unit);
    Some(pos + len)
}

/// 从 avcC 复制 SPS/PPS（保留 2 字节长度前缀）
pub fn avc_sequence_header(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    if data.len() < 7 || (data[5] & 0xe0) != 0xe0 {
        return out;
    }

    let mut pos = 6;
    let mut remaining_sps = data[5] & 0x1f;
    let mut remaining_pps: Option<u8> = None;
    while pos + 2 < data.len() {
        match remaining_pps {
            None if remaining_sps == 0 => {
                remaining_pps = Some(data[pos]);
                pos += 1;
                continue;
            }
            None => remaining_sps -= 1,
            Some(0) => break,
            Some(n) => remaining_pps = Some(n - 1),
        }
        match copy_length_prefixed(data, pos, &mut out) {
            Some(next) => pos = next,
            None => {
                debug!("avcC 参数集长度越界");
                break;
            }
        }
    }
    out
}

/// 从 hvcC 复制所有 NAL 单元（保留 2 字节长度前缀）
pub fn hevc_sequence_header(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    if data.len() < 23 {
        return out;
    }

    let num_arrays = data[22];
    let mut pos = 23;
    for _ in 0..num_arrays {
        let Some(array) = data.get(pos..pos + 3) else {
            break;
        };
        let num_nalus = ((array[1] as usize) << 8) | array[2] as usize;
        pos += 3;
        for _ in 0..num_nalus {
            match copy_length_prefixed(data, pos, &mut out) {
                Some(next) => pos = next,
                None => {
                    debug!("hvcC NAL 长度越界");
                    return out;
                }
            }
        }
    }
    out
}

/// 遍历 `avc_sequence_header` / `hevc_sequence_header` 输出中的 NAL 单元（不含长度前缀）
pub fn parameter_sets(header: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut pos = 0;
    std::iter::from_fn(move || {
        let prefix = header.get(pos..pos + 2)?;
        let len = ((prefix[0] as usize) << 8) | prefix[1] as usize;
        let unit = header.get(pos + 2..pos + 2 + len)?;
        pos += 2 + len;
        Some(unit)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::avc::tests::high_sps;
    use crate::parser::bit_cursor::BitWriter;
    use crate::parser::hevc::tests::main_sps;

    fn avcc(sps: &[u8], pps: &[u8]) -> Vec<u8> {
        let mut out = vec![1, 100, 0, 40, 0xff, 0xe1];
        out.extend_from_slice(&(sps.len() as u16 + 1).to_be_bytes());
        out.push(0x67);
        out.extend_from_slice(sps);
        out.push(1);
        out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        out.extend_from_slice(pps);
        out
    }

    fn hvcc(sps: &[u8]) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.bits(1, 8).bits(0, 2).bit(false).bits(1, 5).bits(0x6000_0000, 32).bits(0, 48).bits(120, 8);
        w.bits(0xf, 4).bits(0, 12).bits(0x3f, 6).bits(0, 2).bits(0x3f, 6).bits(1, 2);
        w.bits(0x1f, 5).bits(2, 3).bits(0x1f, 5).bits(2, 3);
        w.bits(0, 16).bits(0, 2).bits(1, 3).bit(true).bits(3, 2);
        w.bits(2, 8);
        // VPS 数组
        w.bit(true).bit(false).bits(32, 6).bits(1, 16).bits(3, 16).bytes(&[0x40, 0x01, 0x0c]);
        // SPS 数组
        w.bit(true).bit(false).bits(33, 6).bits(1, 16).bits(sps.len() as u64 + 2, 16);
        w.bytes(&[0x42, 0x01]).bytes(sps);
        w.finish()
    }

    #[test]
    fn test_avcc_with_sps() {
        let mut w = high_sps(80, 45, true, None);
        w.bit(false);
        let sps = w.finish_rbsp();
        let data = avcc(&sps, &[0x68, 0xee, 0x3c, 0x80]);

        let params = parse_avc_config(&data, true, &ParseOptions::default()).unwrap();
        assert_eq!((params.width, params.height), (1280, 720));
        assert_eq!(params.nal_length_size, 4);

        let params = parse_avc_config(&data, false, &ParseOptions::default()).unwrap();
        assert_eq!(params.width, 0);
        assert_eq!(params.nal_length_size, 4);
    }

    #[test]
    fn test_avcc_rejects_bad_version_and_reserved() {
        let mut data = avcc(&[0x64, 0, 0x28], &[0x68]);
        data[0] = 2;
        assert!(parse_avc_config(&data, false, &ParseOptions::default()).is_err());

        let mut data = avcc(&[0x64, 0, 0x28], &[0x68]);
        data[4] = 0x03;
        assert_eq!(
            parse_avc_config(&data, false, &ParseOptions::default()),
            Err(ParseError::Malformed("avcC 保留位错误"))
        );
    }

    #[test]
    fn test_avc_sequence_header_copies_sps_and_pps() {
        let data = avcc(&[0x64, 0x00, 0x28], &[0xee, 0x3c, 0x80]);
        let header = avc_sequence_header(&data);
        let units: Vec<&[u8]> = parameter_sets(&header).collect();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], &[0x67, 0x64, 0x00, 0x28]);
        assert_eq!(units[1], &[0xee, 0x3c, 0x80]);
    }

    #[test]
    fn test_hvcc_with_sps() {
        let mut w = main_sps(1920, 1088, 4);
        w.bit(false);
        let sps = w.finish_rbsp();
        let data = hvcc(&sps);

        let params = parse_hevc_config(&data, true, &ParseOptions::default()).unwrap();
        assert_eq!((params.width, params.height), (1920, 1080));
        assert_eq!(params.nal_length_size, 4);

        let params = parse_hevc_config(&data, false, &ParseOptions::default()).unwrap();
        assert_eq!(params.profile, 1);
        assert_eq!(params.level, 120);
        assert_eq!(params.bit_depth, 10);

        let header = hevc_sequence_header(&data);
        let units: Vec<&[u8]> = parameter_sets(&header).collect();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], &[0x40, 0x01, 0x0c]);
        assert_eq!(&units[1][..2], &[0x42, 0x01]);
    }

    #[test]
    fn test_hvcc_without_sps_array() {
        let mut data = hvcc(&[0u8; 20]);
        data[22] = 1;
        assert_eq!(
            parse_hevc_config(&data, true, &ParseOptions::default()),
            Err(ParseError::MissingLandmark("hvcC 中的 SPS"))
        );
    }
}
