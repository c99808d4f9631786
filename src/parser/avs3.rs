//! AVS3 序列头解析

use crate::core::{Fraction, ParseError, ParseResult, ReferenceTime, VideoStreamParameters, UNITS};
use crate::parser::bit_cursor::BitCursor;
use serde::{Deserialize, Serialize};

const SEQ_START_CODE: u8 = 0xb0;
const PROFILE_BASELINE_MAIN: u8 = 0x20;
const PROFILE_BASELINE_MAIN10: u8 = 0x22;

/// 0 禁用，14/15 保留
const FRAME_RATES: [Fraction; 16] = [
    Fraction::new(0, 0),
    Fraction::new(24000, 1001),
    Fraction::new(24, 1),
    Fraction::new(25, 1),
    Fraction::new(30000, 1001),
    Fraction::new(30, 1),
    Fraction::new(50, 1),
    Fraction::new(60000, 1001),
    Fraction::new(60, 1),
    Fraction::new(100, 1),
    Fraction::new(120, 1),
    Fraction::new(200, 1),
    Fraction::new(240, 1),
    Fraction::new(300, 1),
    Fraction::new(0, 0),
    Fraction::new(0, 0),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Avs3SequenceHeader {
    pub profile: u8,
    pub level: u8,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub frame_rate: Fraction,
    pub avg_time_per_frame: ReferenceTime,
}

impl From<&Avs3SequenceHeader> for VideoStreamParameters {
    fn from(seq: &Avs3SequenceHeader) -> Self {
        VideoStreamParameters {
            width: seq.width,
            height: seq.height,
            profile: seq.profile as u32,
            level: seq.level as u32,
            bit_depth: seq.bit_depth,
            avg_time_per_frame: seq.avg_time_per_frame,
            sar: Fraction::new(1, 1),
            ..Default::default()
        }
    }
}

/// 解析 AVS3 序列头，数据中需先出现 `00 00 01 B0`
pub fn parse_sequence_header(data: &[u8]) -> ParseResult<Avs3SequenceHeader> {
    let mut bc = BitCursor::new(data);
    if bc.next_start_code() != Some(SEQ_START_CODE) {
        return Err(ParseError::MissingLandmark("AVS3 序列头起始码"));
    }

    let mut seq = Avs3SequenceHeader {
        profile: bc.read_u8()?,
        ..Default::default()
    };
    if seq.profile != PROFILE_BASELINE_MAIN && seq.profile != PROFILE_BASELINE_MAIN10 {
        return Err(ParseError::UnsupportedProfile(seq.profile as u32));
    }
    seq.level = bc.read_u8()?;
    bc.read_bit()?; // progressive_sequence
    bc.read_bit()?; // field_coded_sequence

    let library_stream = bc.read_bit()?;
    if !library_stream && bc.read_bit()? {
        bc.read_bit()?; // duplicate_sequence_header_flag
    }

    bc.read_bit()?; // marker_bit
    seq.width = bc.read_bits(14)?;
    bc.read_bit()?; // marker_bit
    seq.height = bc.read_bits(14)?;
    if seq.width == 0 || seq.height == 0 {
        return Err(ParseError::Malformed("AVS3 尺寸为 0"));
    }

    bc.read_bits(2)?; // chroma_format
    bc.read_bits(3)?; // sample_precision

    seq.bit_depth = if seq.profile == PROFILE_BASELINE_MAIN10 {
        match bc.read_bits(3)? {
            1 => 8,
            2 => 10,
            other => {
                return Err(ParseError::OutOfRange {
                    field: "encoding_precision",
                    value: other as u64,
                })
            }
        }
    } else {
        8
    };

    bc.read_bit()?; // marker_bit
    bc.read_bits(4)?; // aspect_ratio

    let frame_rate_code = bc.read_bits(4)?;
    seq.frame_rate = FRAME_RATES[frame_rate_code as usize];
    if !seq.frame_rate.is_valid() {
        return Err(ParseError::OutOfRange {
            field: "frame_rate_code",
            value: frame_rate_code as u64,
        });
    }
    seq.avg_time_per_frame =
        (UNITS as i128 * seq.frame_rate.den as i128 / seq.frame_rate.num as i128) as ReferenceTime;
    Ok(seq)
}
