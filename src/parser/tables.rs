use crate::core::Fraction;

/// MPEG 帧率表（9..=13 为非标准扩展）
pub const STD_FRAME_RATES: [Fraction; 16] = [
    Fraction::new(0, 0),
    Fraction::new(24000, 1001),
    Fraction::new(24, 1),
    Fraction::new(25, 1),
    Fraction::new(30000, 1001),
    Fraction::new(30, 1),
    Fraction::new(50, 1),
    Fraction::new(60000, 1001),
    Fraction::new(60, 1),
    Fraction::new(15, 1),
    Fraction::new(5, 1),
    Fraction::new(10, 1),
    Fraction::new(12, 1),
    Fraction::new(15, 1),
    Fraction::new(0, 0),
    Fraction::new(0, 0),
];

/// H.264 / H.265 aspect_ratio_idc 对应的采样宽高比
pub const PIXEL_ASPECT: [Fraction; 17] = [
    Fraction::new(0, 1),
    Fraction::new(1, 1),
    Fraction::new(12, 11),
    Fraction::new(10, 11),
    Fraction::new(16, 11),
    Fraction::new(40, 33),
    Fraction::new(24, 11),
    Fraction::new(20, 11),
    Fraction::new(32, 11),
    Fraction::new(80, 33),
    Fraction::new(18, 11),
    Fraction::new(15, 11),
    Fraction::new(64, 33),
    Fraction::new(160, 99),
    Fraction::new(4, 3),
    Fraction::new(3, 2),
    Fraction::new(2, 1),
];

/// 显式宽高比
pub const ASPECT_RATIO_EXTENDED_SAR: u32 = 255;
