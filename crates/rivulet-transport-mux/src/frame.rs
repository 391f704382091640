//! # 多帧消息单元与线格式
//!
//! ## 意图（Why）
//! - 多路复用套接字以“多帧单元”为收发粒度：身份帧与内容帧在同一个单元内到达，
//!   解复用器据此拆出身份；
//! - TCP 承载时需要一个自描述的帧格式，读端才能在任意分片下还原单元边界。
//!
//! ## 逻辑（How）
//! - 每帧编码为 `[flags:u8][len:u32 BE][payload]`，`flags` 的 bit0 表示后面还有帧；
//! - 没有任何帧的空单元编码为一个零长度的末帧，解码时仅含单个空帧的单元还原为空单元。
//!
//! ## 注意事项（Trade-offs）
//! - 因此“只有一个空帧”的单元与空单元在线上不可区分，空单元被用作显式关闭标记。

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rivulet_core::CodecError;

/// 帧头长度：1 字节标志 + 4 字节长度。
pub const FRAME_HEADER_LEN: usize = 5;

/// 默认单帧上限。
pub const DEFAULT_MAX_FRAME: usize = 8 * 1024 * 1024;

const MORE: u8 = 0b0000_0001;

/// 一个多帧消息单元。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Multipart {
    frames: VecDeque<Bytes>,
}

impl Multipart {
    pub fn new() -> Self {
        Self::default()
    }

    /// 单帧单元。
    pub fn single(frame: impl Into<Bytes>) -> Self {
        let mut unit = Self::new();
        unit.push_back(frame);
        unit
    }

    pub fn push_front(&mut self, frame: impl Into<Bytes>) {
        self.frames.push_front(frame.into());
    }

    pub fn push_back(&mut self, frame: impl Into<Bytes>) {
        self.frames.push_back(frame.into());
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        self.frames.pop_front()
    }

    pub fn front(&self) -> Option<&Bytes> {
        self.frames.front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.frames.iter()
    }

    pub fn into_frames(self) -> VecDeque<Bytes> {
        self.frames
    }

    /// 编码后的字节数。
    pub fn encoded_len(&self) -> usize {
        if self.frames.is_empty() {
            return FRAME_HEADER_LEN;
        }
        self.frames
            .iter()
            .map(|frame| FRAME_HEADER_LEN + frame.len())
            .sum()
    }

    /// 追加编码到 `out`。
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(self.encoded_len());
        if self.frames.is_empty() {
            out.put_u8(0);
            out.put_u32(0);
            return;
        }
        let last = self.frames.len() - 1;
        for (index, frame) in self.frames.iter().enumerate() {
            out.put_u8(if index < last { MORE } else { 0 });
            out.put_u32(frame.len() as u32);
            out.put_slice(frame);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out.freeze()
    }
}

impl From<Vec<Bytes>> for Multipart {
    fn from(frames: Vec<Bytes>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

impl From<Bytes> for Multipart {
    fn from(frame: Bytes) -> Self {
        Self::single(frame)
    }
}

impl IntoIterator for Multipart {
    type Item = Bytes;
    type IntoIter = std::collections::vec_deque::IntoIter<Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

/// 增量解码器：可以喂入任意分片，每凑齐一个单元返回一次。
#[derive(Debug)]
pub struct MultipartDecoder {
    max_frame: usize,
    pending: VecDeque<Bytes>,
}

impl Default for MultipartDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl MultipartDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame,
            pending: VecDeque::new(),
        }
    }

    /// 从 `buf` 头部消费完整帧；凑齐一个单元时返回它，剩余字节留在 `buf` 中。
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Multipart>, CodecError> {
        loop {
            if buf.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let flags = buf[0];
            let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            if len > self.max_frame {
                return Err(CodecError::FrameTooLarge {
                    size: len,
                    limit: self.max_frame,
                });
            }
            if buf.len() < FRAME_HEADER_LEN + len {
                return Ok(None);
            }
            buf.advance(FRAME_HEADER_LEN);
            self.pending.push_back(buf.split_to(len).freeze());
            if flags & MORE == 0 {
                let mut frames = std::mem::take(&mut self.pending);
                if frames.len() == 1 && frames[0].is_empty() {
                    frames.clear();
                }
                return Ok(Some(Multipart { frames }));
            }
        }
    }
}
