//! 端点线上编码所需的最小编组流。
//!
//! 只覆盖端点编码用到的原语：小端整数、布尔、紧凑尺寸前缀、UTF-8 字符串与封装（encapsulation）。
//! 封装格式为 `i32 size`（包含自身 4 字节与 2 字节编码版本）+ `u8 major` + `u8 minor` + 负载，
//! 读取方可以凭 `size` 跳过未知类型的负载。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// 封装头长度：4 字节 size + 2 字节编码版本。
pub const ENCAPS_HEADER_LEN: usize = 6;

/// 封装编码版本。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

impl EncodingVersion {
    /// 当前使用的编码版本 1.1。
    pub const V1_1: Self = Self { major: 1, minor: 1 };
}

impl std::fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// 输出流。
#[derive(Debug, Default)]
pub struct OutputStream {
    buf: BytesMut,
    encaps_starts: Vec<usize>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_byte(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_short(&mut self, value: i16) {
        self.buf.put_i16_le(value);
    }

    pub fn write_int(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    /// 紧凑尺寸：小于 255 用 1 字节，否则 `255` + `i32`。
    pub fn write_size(&mut self, size: usize) {
        if size < 255 {
            self.buf.put_u8(size as u8);
        } else {
            self.buf.put_u8(255);
            self.buf.put_i32_le(size as i32);
        }
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_size(value.len());
        self.buf.put_slice(value.as_bytes());
    }

    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// 开始一个封装；size 字段先占位，在 [`end_encapsulation`](Self::end_encapsulation) 时回填。
    pub fn start_encapsulation(&mut self, encoding: EncodingVersion) {
        self.encaps_starts.push(self.buf.len());
        self.buf.put_i32_le(0);
        self.buf.put_u8(encoding.major);
        self.buf.put_u8(encoding.minor);
    }

    /// 结束最近一次开始的封装并回填长度。
    pub fn end_encapsulation(&mut self) -> Result<()> {
        let start = self
            .encaps_starts
            .pop()
            .ok_or_else(|| TransportError::Marshal("no open encapsulation".into()))?;
        let size = (self.buf.len() - start) as i32;
        self.buf[start..start + 4].copy_from_slice(&size.to_le_bytes());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn finished(self) -> Bytes {
        self.buf.freeze()
    }
}

/// 输入流。
#[derive(Debug, Clone)]
pub struct InputStream {
    buf: Bytes,
    encaps_ends: Vec<usize>,
    consumed: usize,
}

impl InputStream {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            buf: bytes.into(),
            encaps_ends: Vec::new(),
            consumed: 0,
        }
    }

    fn need(&self, count: usize) -> Result<()> {
        if self.buf.remaining() < count {
            return Err(TransportError::Marshal(format!(
                "unexpected end of stream: need {count} bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        self.need(1)?;
        self.consumed += 1;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_short(&mut self) -> Result<i16> {
        self.need(2)?;
        self.consumed += 2;
        Ok(self.buf.get_i16_le())
    }

    pub fn read_int(&mut self) -> Result<i32> {
        self.need(4)?;
        self.consumed += 4;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_size(&mut self) -> Result<usize> {
        let first = self.read_byte()?;
        if first < 255 {
            return Ok(usize::from(first));
        }
        let size = self.read_int()?;
        usize::try_from(size).map_err(|_| TransportError::Marshal(format!("negative size {size}")))
    }

    pub fn read_blob(&mut self, len: usize) -> Result<Bytes> {
        self.need(len)?;
        self.consumed += len;
        Ok(self.buf.split_to(len))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_size()?;
        let bytes = self.read_blob(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| TransportError::Marshal(format!("invalid UTF-8 string: {err}")))
    }

    /// 进入封装，返回其编码版本。
    pub fn start_encapsulation(&mut self) -> Result<EncodingVersion> {
        let start = self.consumed;
        let size = self.read_int()?;
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size >= ENCAPS_HEADER_LEN)
            .ok_or_else(|| TransportError::Marshal(format!("invalid encapsulation size {size}")))?;
        self.need(size - 4)?;
        let major = self.read_byte()?;
        let minor = self.read_byte()?;
        self.encaps_ends.push(start + size);
        Ok(EncodingVersion { major, minor })
    }

    /// 离开封装；负载必须恰好读完。
    pub fn end_encapsulation(&mut self) -> Result<()> {
        let end = self
            .encaps_ends
            .pop()
            .ok_or_else(|| TransportError::Marshal("no open encapsulation".into()))?;
        if self.consumed != end {
            return Err(TransportError::Marshal(format!(
                "encapsulation not fully consumed: {} bytes left",
                end.saturating_sub(self.consumed)
            )));
        }
        Ok(())
    }

    /// 原样读取整个封装负载（不含 6 字节头），用于保留未知类型端点。
    pub fn read_encapsulation(&mut self) -> Result<(EncodingVersion, Bytes)> {
        let size = self.read_int()?;
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size >= ENCAPS_HEADER_LEN)
            .ok_or_else(|| TransportError::Marshal(format!("invalid encapsulation size {size}")))?;
        let major = self.read_byte()?;
        let minor = self.read_byte()?;
        let payload = self.read_blob(size - ENCAPS_HEADER_LEN)?;
        Ok((EncodingVersion { major, minor }, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulation_size_includes_header() {
        let mut out = OutputStream::new();
        out.start_encapsulation(EncodingVersion::V1_1);
        out.write_string("abc");
        out.end_encapsulation().unwrap();
        assert_eq!(out.as_slice(), &[10, 0, 0, 0, 1, 1, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn long_sizes_use_escape_byte() {
        let mut out = OutputStream::new();
        out.write_size(300);
        assert_eq!(out.as_slice(), &[255, 44, 1, 0, 0]);
        let mut input = InputStream::new(out.finished());
        assert_eq!(input.read_size().unwrap(), 300);
    }

    #[test]
    fn truncated_input_is_marshal_error() {
        let mut input = InputStream::new(Bytes::from_static(&[1, 0]));
        let err = input.read_int().unwrap_err();
        assert!(matches!(err, TransportError::Marshal(_)));
    }

    #[test]
    fn unconsumed_encapsulation_is_rejected() {
        let mut out = OutputStream::new();
        out.start_encapsulation(EncodingVersion::V1_1);
        out.write_int(7);
        out.write_int(8);
        out.end_encapsulation().unwrap();

        let mut input = InputStream::new(out.finished());
        input.start_encapsulation().unwrap();
        assert_eq!(input.read_int().unwrap(), 7);
        assert!(input.end_encapsulation().is_err());
    }
}
