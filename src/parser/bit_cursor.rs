//! 位读取器
//!
//! 按 MSB 优先顺序读取定长比特与指数哥伦布码。
//!
//! ## 无符号指数哥伦布 ue(v)
//!
//! 格式：`[k 个 0][1][k 位后缀]`，值 = 2^k - 1 + 后缀
//!
//! - 0: `1`
//! - 1: `010`
//! - 2: `011`
//! - 3: `00100`
//!
//! ## 有符号指数哥伦布 se(v)
//!
//! 把 ue 值 k 映射为 `(-1)^(k+1) * ceil(k/2)`：0, 1, -1, 2, -2, ...

use crate::core::{ParseError, ParseResult};
use std::borrow::Cow;

/// 字节缓冲上的只读位游标
///
/// 任何读取失败都不会移动游标，也不会越界。
pub struct BitCursor<'a> {
    data: &'a [u8],
    /// 位偏移
    pos: usize,
}

impl<'a> BitCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// 已读取的位数
    pub fn position(&self) -> usize {
        self.pos
    }

    /// 当前字节偏移（向上对齐前）
    pub fn byte_position(&self) -> usize {
        self.pos >> 3
    }

    pub fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    /// 剩余不足 8 位时视为结束
    pub fn is_at_end(&self) -> bool {
        self.remaining_bits() < 8
    }

    /// 读取 n 位（0 ≤ n ≤ 32）
    pub fn read_bits(&mut self, n: u32) -> ParseResult<u32> {
        if n > 32 {
            return Err(ParseError::Malformed("一次最多读取 32 位"));
        }
        if self.remaining_bits() < n as usize {
            return Err(ParseError::BufferExhausted);
        }

        let mut value: u64 = 0;
        let mut left = n as usize;
        while left > 0 {
            let byte = self.data[self.pos >> 3];
            let avail = 8 - (self.pos & 7);
            let take = avail.min(left);
            let mask = ((1u16 << take) - 1) as u8;
            let bits = (byte >> (avail - take)) & mask;
            value = (value << take) | bits as u64;
            self.pos += take;
            left -= take;
        }
        Ok(value as u32)
    }

    pub fn read_bit(&mut self) -> ParseResult<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn read_u8(&mut self) -> ParseResult<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_u16(&mut self) -> ParseResult<u16> {
        Ok(self.read_bits(16)? as u16)
    }

    /// 跳过任意位数（不足时失败且不移动）
    pub fn skip_bits(&mut self, n: usize) -> ParseResult<()> {
        if self.remaining_bits() < n {
            return Err(ParseError::BufferExhausted);
        }
        self.pos += n;
        Ok(())
    }

    /// 对齐到字节边界后跳过 n 个字节，越界时停在末尾
    pub fn skip_bytes(&mut self, n: usize) {
        self.byte_align();
        let end = self.data.len() * 8;
        self.pos = (self.pos + n * 8).min(end);
    }

    pub fn byte_align(&mut self) {
        self.pos = (self.pos + 7) & !7;
    }

    /// 从当前（对齐后）字节开始的剩余数据
    pub fn rest(&self) -> &'a [u8] {
        let start = ((self.pos + 7) >> 3).min(self.data.len());
        &self.data[start..]
    }

    /// ue(v)
    pub fn read_ue(&mut self) -> ParseResult<u32> {
        let start = self.pos;
        self.read_ue_inner().map_err(|e| {
            self.pos = start;
            e
        })
    }

    fn read_ue_inner(&mut self) -> ParseResult<u32> {
        let mut leading_zeros = 0u32;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(ParseError::Malformed("指数哥伦布码过长"));
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + suffix as u64) as u32)
    }

    /// se(v)
    pub fn read_se(&mut self) -> ParseResult<i32> {
        let k = self.read_ue()? as i64;
        let magnitude = (k + 1) / 2;
        Ok(if k & 1 == 1 { magnitude } else { -magnitude } as i32)
    }

    /// AV1 uvlc()，前导零 ≥ 32 时返回 2^32 - 1
    pub fn read_uvlc(&mut self) -> ParseResult<u32> {
        let start = self.pos;
        self.read_uvlc_inner().map_err(|e| {
            self.pos = start;
            e
        })
    }

    fn read_uvlc_inner(&mut self) -> ParseResult<u32> {
        let mut leading_zeros = 0u32;
        while !self.read_bit()? {
            leading_zeros += 1;
        }
        if leading_zeros >= 32 {
            return Ok(u32::MAX);
        }
        let value = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + value as u64) as u32)
    }

    /// 查找下一个 `00 00 01 xx` 起始码，返回 xx 并把游标放在其后
    pub fn next_start_code(&mut self) -> Option<u8> {
        self.byte_align();
        let start = self.pos >> 3;
        let bytes = &self.data[start..];
        let idx = bytes
            .windows(4)
            .position(|w| w[0] == 0 && w[1] == 0 && w[2] == 1)?;
        self.pos = (start + idx + 4) * 8;
        Some(bytes[idx + 3])
    }
}

/// 去除防竞争字节：`00 00 03` → `00 00`
pub fn unescape_rbsp(data: &[u8]) -> Cow<'_, [u8]> {
    let has_escape = data
        .windows(3)
        .any(|w| w[0] == 0 && w[1] == 0 && w[2] == 3);
    if !has_escape {
        return Cow::Borrowed(data);
    }

    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    Cow::Owned(out)
}

/// 测试用位写入器
#[cfg(test)]
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    bit_len: usize,
}

#[cfg(test)]
impl BitWriter {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bit_len: 0,
        }
    }

    pub fn bits(&mut self, value: u64, n: u32) -> &mut Self {
        for i in (0..n).rev() {
            self.bit((value >> i) & 1 == 1);
        }
        self
    }

    pub fn bit(&mut self, b: bool) -> &mut Self {
        if self.bit_len % 8 == 0 {
            self.bytes.push(0);
        }
        if b {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 0x80 >> (self.bit_len % 8);
        }
        self.bit_len += 1;
        self
    }

    pub fn ue(&mut self, v: u32) -> &mut Self {
        let v1 = v as u64 + 1;
        let len = 64 - v1.leading_zeros();
        self.bits(0, len - 1);
        self.bits(v1, len)
    }

    pub fn se(&mut self, v: i32) -> &mut Self {
        let k = if v > 0 {
            (v as u32) * 2 - 1
        } else {
            (-(v as i64) as u32) * 2
        };
        self.ue(k)
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        for &b in data {
            self.bits(b as u64, 8);
        }
        self
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// 补 0 到字节边界
    pub fn finish(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    /// 追加 rbsp_stop_one_bit 后补 0
    pub fn finish_rbsp(&mut self) -> Vec<u8> {
        self.bit(true);
        self.bytes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_bits() {
        let data = [0b1011_0010, 0b1101_0101];
        let mut bc = BitCursor::new(&data);
        assert_eq!(bc.read_bits(4).unwrap(), 0b1011);
        assert_eq!(bc.read_bits(8).unwrap(), 0b0010_1101);
        assert_eq!(bc.read_bits(4).unwrap(), 0b0101);
        assert!(bc.is_at_end());
    }

    #[test]
    fn test_read_32_bits() {
        let data = [0xde, 0xad, 0xbe, 0xef, 0x80];
        let mut bc = BitCursor::new(&data);
        assert_eq!(bc.read_bits(32).unwrap(), 0xdead_beef);
        assert!(bc.read_bit().unwrap());
    }

    #[test]
    fn test_exhausted_read_does_not_advance() {
        let data = [0xff];
        let mut bc = BitCursor::new(&data);
        bc.read_bits(3).unwrap();
        assert_eq!(bc.read_bits(6), Err(ParseError::BufferExhausted));
        assert_eq!(bc.position(), 3);
        assert_eq!(bc.read_bits(5).unwrap(), 0b11111);
    }

    #[test]
    fn test_ue_known_codes() {
        // 1 | 010 | 011 | 00100 | 00101
        let mut w = BitWriter::new();
        w.bits(0b1, 1).bits(0b010, 3).bits(0b011, 3).bits(0b00100, 5).bits(0b00101, 5);
        let data = w.finish();
        let mut bc = BitCursor::new(&data);
        for expected in 0..5 {
            assert_eq!(bc.read_ue().unwrap(), expected);
        }
    }

    #[test]
    fn test_exp_golomb_round_trip() {
        let values: Vec<u32> = (0..(1u32 << 20)).step_by(997).chain([1, 2, 3, (1 << 20) - 1]).collect();
        let mut w = BitWriter::new();
        for &v in &values {
            w.ue(v);
            w.se(v as i32);
            w.se(-(v as i32));
        }
        let data = w.finish();
        let mut bc = BitCursor::new(&data);
        for &v in &values {
            assert_eq!(bc.read_ue().unwrap(), v);
            assert_eq!(bc.read_se().unwrap(), v as i32);
            assert_eq!(bc.read_se().unwrap(), -(v as i32));
        }
    }

    #[test]
    fn test_truncated_ue_restores_position() {
        // 0000 0001 | 1 后缀缺失
        let data = [0x00, 0x01];
        let mut bc = BitCursor::new(&data);
        bc.read_bits(2).unwrap();
        assert_eq!(bc.read_ue(), Err(ParseError::BufferExhausted));
        assert_eq!(bc.position(), 2);
    }

    #[test]
    fn test_uvlc_saturates() {
        let mut w = BitWriter::new();
        w.bits(0, 32).bit(true);
        w.bits(0, 2).bit(true).bits(0b10, 2);
        let data = w.finish();
        let mut bc = BitCursor::new(&data);
        assert_eq!(bc.read_uvlc().unwrap(), u32::MAX);
        assert_eq!(bc.read_uvlc().unwrap(), 3 + 2);
    }

    #[test]
    fn test_skip_bytes_clamps() {
        let data = [1, 2, 3];
        let mut bc = BitCursor::new(&data);
        bc.read_bits(1).unwrap();
        bc.skip_bytes(1);
        assert_eq!(bc.read_u8().unwrap(), 3);
        bc.skip_bytes(10);
        assert_eq!(bc.remaining_bits(), 0);
    }

    #[test]
    fn test_next_start_code() {
        let data = [0xff, 0x00, 0x00, 0x01, 0xb0, 0x20];
        let mut bc = BitCursor::new(&data);
        assert_eq!(bc.next_start_code(), Some(0xb0));
        assert_eq!(bc.read_u8().unwrap(), 0x20);
        assert_eq!(bc.next_start_code(), None);
    }

    #[test]
    fn test_unescape_rbsp() {
        let data = [0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x05];
        assert_eq!(&*unescape_rbsp(&data), &[0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x05]);
        assert!(matches!(unescape_rbsp(&[1, 2, 3]), Cow::Borrowed(_)));
    }
}
